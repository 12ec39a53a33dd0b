//! Script module and class definitions.
//!
//! A [`ModuleDef`] is what a [`ModuleProvider`](crate::ModuleProvider) hands the
//! interpreter on import: module-level functions, classes and module globals.
//! Callables are native closures receiving a [`CallScope`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ScriptException;
use crate::lock::RuntimeGuard;
use crate::runtime::{ObjId, Runtime};

/// Result of a script callable.
pub type CallResult = Result<Value, ScriptException>;

/// A callable hosted in the interpreter.
pub type NativeFn = Arc<dyn Fn(&mut CallScope<'_, '_>) -> CallResult + Send + Sync>;

/// Names beginning with `_` are private: callable, never listed.
pub fn is_public(name: &str) -> bool {
    !name.starts_with('_')
}

// ─────────────────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Definition of a script class.
#[derive(Clone)]
pub struct ClassDef {
    pub(crate) name: String,
    pub(crate) init: Option<NativeFn>,
    pub(crate) methods: BTreeMap<String, NativeFn>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
            methods: BTreeMap::new(),
        }
    }

    /// Initializer run by `create_instance`, with `self` bound to the new instance.
    pub fn init<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallScope<'_, '_>) -> Result<(), ScriptException> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(move |scope: &mut CallScope<'_, '_>| {
            f(scope).map(|_| Value::Null)
        }));
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CallScope<'_, '_>) -> CallResult + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn public_methods(&self) -> impl Iterator<Item = &String> {
        self.methods.keys().filter(|name| is_public(name))
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Definition of a script module.
#[derive(Clone)]
pub struct ModuleDef {
    pub(crate) name: String,
    pub(crate) functions: BTreeMap<String, NativeFn>,
    pub(crate) classes: BTreeMap<String, Arc<ClassDef>>,
    pub(crate) attrs: Map<String, Value>,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
            classes: BTreeMap::new(),
            attrs: Map::new(),
        }
    }

    pub fn function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut CallScope<'_, '_>) -> CallResult + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.insert(class.name.clone(), Arc::new(class));
        self
    }

    /// A module global, readable from callables via [`CallScope::module_attr`].
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDef")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Scope
// ─────────────────────────────────────────────────────────────────────────────

/// What a callable sees while it runs.
///
/// The runtime lock is held for the whole call. Use [`CallScope::allow_threads`]
/// around blocking work that does not touch the interpreter.
pub struct CallScope<'g, 'r> {
    guard: &'g mut RuntimeGuard<'r>,
    this: Option<ObjId>,
    module: ObjId,
    method: &'g str,
    args: &'g [Value],
}

impl<'g, 'r> CallScope<'g, 'r> {
    pub(crate) fn new(
        guard: &'g mut RuntimeGuard<'r>,
        this: Option<ObjId>,
        module: ObjId,
        method: &'g str,
        args: &'g [Value],
    ) -> Self {
        Self {
            guard,
            this,
            module,
            method,
            args,
        }
    }

    pub fn method(&self) -> &str {
        self.method
    }

    pub fn args(&self) -> &[Value] {
        self.args
    }

    /// Positional argument `index`, converted to `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ScriptException> {
        let value = self.args.get(index).ok_or_else(|| {
            ScriptException::type_error(format!(
                "{}() missing required positional argument {}",
                self.method, index
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ScriptException::type_error(format!("{}() argument {}: {}", self.method, index, e))
        })
    }

    /// Positional argument `index`, or `default` when it was not passed.
    pub fn arg_or<T: DeserializeOwned>(&self, index: usize, default: T) -> Result<T, ScriptException> {
        if index < self.args.len() {
            self.arg(index)
        } else {
            Ok(default)
        }
    }

    /// Whether the callable was invoked on an instance.
    pub fn has_self(&self) -> bool {
        self.this.is_some()
    }

    /// Attribute of `self`, or of the module for module-level functions.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        let owner = self.this.unwrap_or(self.module);
        self.guard.with(|interp| interp.attr(owner, name)).flatten()
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<Value>) {
        let owner = self.this.unwrap_or(self.module);
        let value = value.into();
        self.guard.with(|interp| interp.set_attr(owner, name, value));
    }

    pub fn module_attr(&self, name: &str) -> Option<Value> {
        let module = self.module;
        self.guard.with(|interp| interp.attr(module, name)).flatten()
    }

    pub fn set_module_attr(&mut self, name: &str, value: impl Into<Value>) {
        let module = self.module;
        let value = value.into();
        self.guard.with(|interp| interp.set_attr(module, name, value));
    }

    /// The runtime this call runs in, for nested calls.
    pub fn runtime(&self) -> &'r Runtime {
        self.guard.runtime()
    }

    /// Run blocking work with the runtime lock released.
    ///
    /// Interpreter state may change while `f` runs; attributes read before
    /// should be read again afterwards.
    pub fn allow_threads<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard.unlocked(f)
    }
}

impl fmt::Debug for CallScope<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallScope")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("has_self", &self.this.is_some())
            .finish()
    }
}
