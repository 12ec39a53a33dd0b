//! Script Runtime
//!
//! One embedded interpreter: its lifecycle, its module table, its object heap
//! and the lock serializing access to all of it.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;
use crate::error::{ScriptError, ScriptException, ScriptResult};
use crate::lock::{RuntimeGuard, RuntimeLock};
use crate::module::{CallResult, CallScope, ClassDef, ModuleDef, NativeFn, is_public};
use crate::native::{ModuleProvider, NativeModules};
use crate::object::ObjectRef;

pub(crate) type ObjId = u64;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    /// Created, not yet initialized
    Uninitialized = 0,
    /// Accepting calls
    Running = 1,
    /// Torn down; terminal
    Finalized = 2,
}

impl RuntimeState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Running,
            _ => Self::Finalized,
        }
    }

    pub fn is_alive(&self) -> bool {
        *self == RuntimeState::Running
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeState::Uninitialized => write!(f, "uninitialized"),
            RuntimeState::Running => write!(f, "running"),
            RuntimeState::Finalized => write!(f, "finalized"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter State
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct ModuleObject {
    name: String,
    functions: BTreeMap<String, NativeFn>,
    classes: BTreeMap<String, Arc<ClassDef>>,
    attrs: Map<String, Value>,
}

impl ModuleObject {
    fn from_def(name: &str, def: ModuleDef) -> Self {
        Self {
            name: name.to_string(),
            functions: def.functions,
            classes: def.classes,
            attrs: def.attrs,
        }
    }
}

pub(crate) struct InstanceObject {
    class: Arc<ClassDef>,
    module: ObjId,
    attrs: Map<String, Value>,
}

pub(crate) enum HeapObject {
    Module(ModuleObject),
    Instance(InstanceObject),
}

struct HeapEntry {
    refcount: usize,
    object: HeapObject,
}

/// Interpreter state. Only reachable through a held [`RuntimeGuard`].
pub(crate) struct Interpreter {
    search_path: Vec<PathBuf>,
    /// Module table: import name to module object. Holds one reference each.
    modules: HashMap<String, ObjId>,
    heap: HashMap<ObjId, HeapEntry>,
    next_id: ObjId,
}

impl Interpreter {
    fn new() -> Self {
        Self {
            search_path: Vec::new(),
            modules: HashMap::new(),
            heap: HashMap::new(),
            next_id: 1,
        }
    }

    fn alloc(&mut self, object: HeapObject, refcount: usize) -> ObjId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.insert(id, HeapEntry { refcount, object });
        id
    }

    pub(crate) fn incref(&mut self, id: ObjId) -> bool {
        match self.heap.get_mut(&id) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference. Returns the objects freed as a result, to be
    /// dropped by the caller once the state is no longer borrowed.
    pub(crate) fn decref(&mut self, id: ObjId) -> Vec<HeapObject> {
        let mut freed = Vec::new();
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(entry) = self.heap.get_mut(&id) else {
                continue;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                continue;
            }
            if let Some(entry) = self.heap.remove(&id) {
                if let HeapObject::Instance(instance) = &entry.object {
                    pending.push(instance.module);
                }
                freed.push(entry.object);
            }
        }
        freed
    }

    fn module(&self, id: ObjId) -> Option<&ModuleObject> {
        match self.heap.get(&id).map(|e| &e.object) {
            Some(HeapObject::Module(module)) => Some(module),
            _ => None,
        }
    }

    fn instance(&self, id: ObjId) -> Option<&InstanceObject> {
        match self.heap.get(&id).map(|e| &e.object) {
            Some(HeapObject::Instance(instance)) => Some(instance),
            _ => None,
        }
    }

    fn attrs_mut(&mut self, id: ObjId) -> Option<&mut Map<String, Value>> {
        match self.heap.get_mut(&id).map(|e| &mut e.object) {
            Some(HeapObject::Module(module)) => Some(&mut module.attrs),
            Some(HeapObject::Instance(instance)) => Some(&mut instance.attrs),
            None => None,
        }
    }

    pub(crate) fn attr(&self, owner: ObjId, name: &str) -> Option<Value> {
        match self.heap.get(&owner).map(|e| &e.object)? {
            HeapObject::Module(module) => module.attrs.get(name).cloned(),
            HeapObject::Instance(instance) => instance.attrs.get(name).cloned(),
        }
    }

    pub(crate) fn set_attr(&mut self, owner: ObjId, name: &str, value: Value) {
        if let Some(attrs) = self.attrs_mut(owner) {
            attrs.insert(name.to_string(), value);
        }
    }

    /// Find `name` on the instance's class if there is an instance, otherwise
    /// among the module's functions. Yields the callable, `self` and the module.
    fn resolve(&self, module: ObjId, instance: Option<ObjId>, name: &str) -> Option<(NativeFn, Option<ObjId>, ObjId)> {
        match instance {
            Some(id) => {
                let instance = self.instance(id)?;
                let f = instance.class.methods.get(name)?;
                Some((f.clone(), Some(id), instance.module))
            }
            None => {
                let f = self.module(module)?.functions.get(name)?;
                Some((f.clone(), None, module))
            }
        }
    }

    /// Public callables, sorted (map keys are ordered).
    fn callables(&self, module: ObjId, instance: Option<ObjId>) -> Vec<String> {
        match instance {
            Some(id) => match self.instance(id) {
                Some(instance) => instance.class.public_methods().cloned().collect(),
                None => Vec::new(),
            },
            None => match self.module(module) {
                Some(module) => module
                    .functions
                    .keys()
                    .filter(|name| is_public(name))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn teardown(&mut self) -> Vec<HeapObject> {
        self.modules.clear();
        self.search_path.clear();
        self.heap.drain().map(|(_, entry)| entry.object).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

struct RuntimeInner {
    state: AtomicU8,
    lock: RuntimeLock,
    natives: Arc<NativeModules>,
    providers: RwLock<Vec<Arc<dyn ModuleProvider>>>,
    leaked: AtomicUsize,
}

/// Handle to an embedded interpreter. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Create an uninitialized runtime.
    pub fn new() -> Self {
        let natives = Arc::new(NativeModules::new());
        let providers: Vec<Arc<dyn ModuleProvider>> = vec![natives.clone()];
        Self {
            inner: Arc::new(RuntimeInner {
                state: AtomicU8::new(RuntimeState::Uninitialized as u8),
                lock: RuntimeLock::new(Interpreter::new()),
                natives,
                providers: RwLock::new(providers),
                leaked: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a runtime that is already running.
    pub fn initialized() -> Self {
        let runtime = Self::new();
        runtime
            .inner
            .state
            .store(RuntimeState::Running as u8, Ordering::SeqCst);
        tracing::info!(component = "Runtime", operation = "initialize", "Runtime initialized");
        runtime
    }

    /// The process-wide runtime, initialized on first use.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(Self::initialized)
    }

    /// Move from `Uninitialized` to `Running`. A no-op on a running runtime;
    /// a finalized runtime cannot be brought back.
    pub fn initialize(&self) -> ScriptResult<()> {
        match self.inner.state.compare_exchange(
            RuntimeState::Uninitialized as u8,
            RuntimeState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                tracing::info!(component = "Runtime", operation = "initialize", "Runtime initialized");
                Ok(())
            }
            Err(current) if RuntimeState::from_u8(current).is_alive() => Ok(()),
            Err(_) => Err(ScriptError::RuntimeUnavailable),
        }
    }

    /// Tear the interpreter down. Terminal.
    ///
    /// References still held by executors become leaks: dropping them later
    /// never touches interpreter state.
    pub fn finalize(&self) {
        let guard = self.inner.lock.acquire();
        let previous = RuntimeState::from_u8(
            self.inner
                .state
                .swap(RuntimeState::Finalized as u8, Ordering::SeqCst),
        );
        if !previous.is_alive() {
            return;
        }
        let garbage = guard.borrow_mut().teardown();
        drop(guard);

        tracing::info!(
            component = "Runtime",
            operation = "finalize",
            objects = garbage.len(),
            "Runtime finalized"
        );
        drop(garbage);
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Acquire the runtime lock.
    ///
    /// The returned guard is not held if the runtime is not alive, including
    /// when it was finalized while this thread waited for the lock.
    pub fn lock(&self) -> RuntimeGuard<'_> {
        if !self.is_alive() {
            return RuntimeGuard::unheld(self);
        }
        let inner = self.inner.lock.acquire();
        if !self.is_alive() {
            return RuntimeGuard::unheld(self);
        }
        RuntimeGuard::held(self, inner)
    }

    pub fn runtime_lock(&self) -> &RuntimeLock {
        &self.inner.lock
    }

    /// Apply startup configuration: append the configured paths to the
    /// module search path.
    pub fn configure(&self, config: &RuntimeConfig) -> ScriptResult<()> {
        for path in config.paths() {
            self.add_search_path(path)?;
        }
        Ok(())
    }

    /// Append `path` to the module search path. Returns `false` if it was
    /// already present.
    pub fn add_search_path(&self, path: impl Into<PathBuf>) -> ScriptResult<bool> {
        let path = path.into();
        let guard = self.lock();
        let added = guard
            .with(|interp| {
                if interp.search_path.contains(&path) {
                    false
                } else {
                    interp.search_path.push(path.clone());
                    true
                }
            })
            .ok_or(ScriptError::RuntimeUnavailable)?;
        if added {
            tracing::debug!(component = "Runtime", operation = "add_path", path = %path.display(), "Added search path");
        }
        Ok(added)
    }

    pub fn search_path(&self) -> Vec<PathBuf> {
        self.lock()
            .with(|interp| interp.search_path.clone())
            .unwrap_or_default()
    }

    /// Register a natively defined module with this runtime's built-in provider.
    pub fn register_module<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Result<ModuleDef, ScriptException> + Send + Sync + 'static,
    {
        self.inner.natives.register(name, factory)
    }

    /// Add a provider consulted after the ones already registered.
    pub fn add_provider(&self, provider: Arc<dyn ModuleProvider>) {
        self.inner.providers.write().push(provider);
    }

    pub fn natives(&self) -> &NativeModules {
        &self.inner.natives
    }

    /// Names in the module table, sorted.
    pub fn loaded_modules(&self) -> Vec<String> {
        let mut names = self
            .lock()
            .with(|interp| interp.modules.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of objects alive in the interpreter heap.
    pub fn live_objects(&self) -> usize {
        self.lock()
            .with(|interp| interp.heap.len())
            .unwrap_or(0)
    }

    /// Number of class instances alive in the interpreter heap.
    pub fn live_instances(&self) -> usize {
        self.lock()
            .with(|interp| {
                interp
                    .heap
                    .values()
                    .filter(|e| matches!(e.object, HeapObject::Instance(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// References dropped after the runtime stopped being alive.
    pub fn leaked_references(&self) -> usize {
        self.inner.leaked.load(Ordering::SeqCst)
    }

    pub(crate) fn note_leak(&self) {
        self.inner.leaked.fetch_add(1, Ordering::SeqCst);
    }

    fn find_module(&self, name: &str, search_path: &[PathBuf]) -> Result<ModuleDef, ScriptException> {
        let providers = self.inner.providers.read().clone();
        for provider in providers {
            if let Some(result) = provider.load(name, search_path) {
                return result;
            }
        }
        Err(ScriptException::module_not_found(name))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("leaked", &self.leaked_references())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter Operations
// ─────────────────────────────────────────────────────────────────────────────

/// A bound module plus the instance calls should go to, if any.
pub(crate) struct Target {
    pub module: ObjectRef,
    pub instance: Option<ObjectRef>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native callable panicked".to_string()
    }
}

impl RuntimeGuard<'_> {
    /// Import `name`, going through the module table first.
    pub(crate) fn import(&self, name: &str) -> ScriptResult<ObjectRef> {
        let runtime = self.runtime();
        let cached = self
            .with(|interp| {
                let id = *interp.modules.get(name)?;
                interp.incref(id).then_some(id)
            })
            .ok_or(ScriptError::RuntimeUnavailable)?;
        if let Some(id) = cached {
            return Ok(ObjectRef::adopt(runtime, id));
        }

        let search_path = self
            .with(|interp| interp.search_path.clone())
            .unwrap_or_default();
        let def = runtime
            .find_module(name, &search_path)
            .map_err(|e| ScriptError::ModuleLoad {
                module: name.to_string(),
                reason: e.to_string(),
            })?;

        // One reference for the module table, one for the caller.
        let id = self
            .with(|interp| {
                let id = interp.alloc(HeapObject::Module(ModuleObject::from_def(name, def)), 2);
                interp.modules.insert(name.to_string(), id);
                id
            })
            .ok_or(ScriptError::RuntimeUnavailable)?;
        Ok(ObjectRef::adopt(runtime, id))
    }

    /// Re-run the provider for `module` and swap its contents in place.
    pub(crate) fn reload(&self, module: &ObjectRef) -> ScriptResult<()> {
        let name = self
            .with(|interp| interp.module(module.id()).map(|m| m.name.clone()))
            .ok_or(ScriptError::RuntimeUnavailable)?
            .ok_or_else(|| ScriptError::Reload {
                module: String::new(),
                reason: "object is not a module".to_string(),
            })?;

        let search_path = self
            .with(|interp| interp.search_path.clone())
            .unwrap_or_default();
        let def = self
            .runtime()
            .find_module(&name, &search_path)
            .map_err(|e| ScriptError::Reload {
                module: name.clone(),
                reason: e.to_string(),
            })?;

        let previous = self
            .with(|interp| {
                let entry = interp.heap.get_mut(&module.id())?;
                let fresh = HeapObject::Module(ModuleObject::from_def(&name, def));
                Some(std::mem::replace(&mut entry.object, fresh))
            })
            .flatten();
        drop(previous);
        Ok(())
    }

    /// Create an instance of `class` from `module`, running its initializer.
    pub(crate) fn instantiate(&mut self, module: &ObjectRef, class: &str, args: &[Value]) -> ScriptResult<ObjectRef> {
        let module_id = module.id();
        let (module_name, class_def) = self
            .with(|interp| {
                interp
                    .module(module_id)
                    .map(|m| (m.name.clone(), m.classes.get(class).cloned()))
            })
            .ok_or(ScriptError::RuntimeUnavailable)?
            .ok_or(ScriptError::ModuleNotLoaded)?;

        let class_def = class_def.ok_or_else(|| ScriptError::Instantiation {
            module: module_name.clone(),
            class: class.to_string(),
            reason: ScriptException::attribute_error(format!(
                "module '{}' has no attribute '{}'",
                module_name, class
            ))
            .to_string(),
        })?;

        let instance_id = self
            .with(|interp| {
                interp.incref(module_id);
                let instance = InstanceObject {
                    class: class_def.clone(),
                    module: module_id,
                    attrs: Map::new(),
                };
                interp.alloc(HeapObject::Instance(instance), 1)
            })
            .ok_or(ScriptError::RuntimeUnavailable)?;
        let instance = ObjectRef::adopt(self.runtime(), instance_id);

        if let Some(init) = &class_def.init {
            if let Err(exception) = self.run(init, Some(instance_id), module_id, "__init__", args) {
                return Err(ScriptError::Instantiation {
                    module: module_name,
                    class: class.to_string(),
                    reason: exception.to_string(),
                });
            }
        }
        Ok(instance)
    }

    /// Resolve `method` on `target` and call it.
    pub(crate) fn invoke(&mut self, target: &Target, method: &str, args: &[Value]) -> ScriptResult<Value> {
        let instance = target.instance.as_ref().map(ObjectRef::id);
        let (f, this, module) = self
            .with(|interp| interp.resolve(target.module.id(), instance, method))
            .ok_or(ScriptError::RuntimeUnavailable)?
            .ok_or_else(|| ScriptError::MethodNotFound(method.to_string()))?;

        self.run(&f, this, module, method, args)
            .map_err(|exception| ScriptError::interpreter(method, exception))
    }

    pub(crate) fn has_callable(&self, target: &Target, name: &str) -> bool {
        let instance = target.instance.as_ref().map(ObjectRef::id);
        self.with(|interp| interp.resolve(target.module.id(), instance, name).is_some())
            .unwrap_or(false)
    }

    pub(crate) fn callables(&self, target: &Target) -> Vec<String> {
        let instance = target.instance.as_ref().map(ObjectRef::id);
        self.with(|interp| interp.callables(target.module.id(), instance))
            .unwrap_or_default()
    }

    pub(crate) fn classes(&self, module: &ObjectRef) -> Vec<String> {
        self.with(|interp| {
            interp
                .module(module.id())
                .map(|m| m.classes.keys().filter(|n| is_public(n)).cloned().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Run a callable. Panics are caught here and become `SystemError`.
    fn run(&mut self, f: &NativeFn, this: Option<ObjId>, module: ObjId, method: &str, args: &[Value]) -> CallResult {
        let mut scope = CallScope::new(self, this, module, method, args);
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut scope))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(component = "Runtime", method, %message, "Native callable panicked");
                Err(ScriptException::new("SystemError", message))
            }
        }
    }
}
