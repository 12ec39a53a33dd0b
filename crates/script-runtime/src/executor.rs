//! Script Executor
//!
//! Binds one script module (and optionally one instance of a class from it)
//! and exposes thread-safe synchronous, asynchronous and callback-style
//! invocation of its callables.
//!
//! The binding lock is only ever taken on its own or nested inside the
//! runtime lock, never the other way round. Interpreter references are never
//! dropped while the binding lock is held.

use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ScriptError, ScriptResult};
use crate::lock::RuntimeGuard;
use crate::object::ObjectRef;
use crate::promise::{self, CallFuture};
use crate::runtime::{Runtime, Target};
use crate::value::{IntoArgs, from_value, to_args};

struct Binding {
    module_name: String,
    class_name: Option<String>,
    module: Option<ObjectRef>,
    instance: Option<ObjectRef>,
}

/// Thread-safe invoker bound to one script module.
pub struct ScriptExecutor {
    runtime: Runtime,
    binding: Arc<RwLock<Binding>>,
}

impl ScriptExecutor {
    /// Bind `module_name` without importing it yet.
    pub fn new(runtime: &Runtime, module_name: impl Into<String>) -> Self {
        Self {
            runtime: runtime.clone(),
            binding: Arc::new(RwLock::new(Binding {
                module_name: module_name.into(),
                class_name: None,
                module: None,
                instance: None,
            })),
        }
    }

    /// Bind and import `module_name`.
    pub fn with_import(runtime: &Runtime, module_name: impl Into<String>) -> ScriptResult<Self> {
        let executor = Self::new(runtime, module_name);
        executor.import("")?;
        Ok(executor)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn module_name(&self) -> String {
        self.binding.read().module_name.clone()
    }

    /// Name of the class the bound instance was created from.
    pub fn class_name(&self) -> Option<String> {
        self.binding.read().class_name.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.binding.read().module.is_some()
    }

    pub fn has_instance(&self) -> bool {
        self.binding.read().instance.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Binding
    // ─────────────────────────────────────────────────────────────────────────

    /// Import `module_name` (or the bound name when empty) and bind it.
    ///
    /// The executor is unloaded first; on failure it stays unloaded. Any
    /// previously created instance is released.
    pub fn import(&self, module_name: &str) -> ScriptResult<()> {
        let stale = {
            let mut binding = self.binding.write();
            if !module_name.is_empty() {
                binding.module_name = module_name.to_string();
            }
            binding.class_name = None;
            (binding.module.take(), binding.instance.take())
        };
        drop(stale);

        let name = self.module_name();
        let guard = self.runtime.lock();
        match guard.import(&name) {
            Ok(module) => {
                self.binding.write().module = Some(module);
                tracing::info!(component = "ScriptExecutor", operation = "import", module = %name, "Module imported");
                Ok(())
            }
            Err(e) => {
                tracing::error!(component = "ScriptExecutor", operation = "import", module = %name, error = %e, "Import failed");
                Err(e)
            }
        }
    }

    /// Instantiate `class_name` from the bound module with no arguments and
    /// route subsequent calls to the instance.
    pub fn create_instance(&self, class_name: &str) -> ScriptResult<()> {
        self.create_instance_with(class_name, ())
    }

    /// Instantiate `class_name` with constructor arguments.
    pub fn create_instance_with(&self, class_name: &str, args: impl IntoArgs) -> ScriptResult<()> {
        let args = to_args("__init__", args)?;
        let mut guard = self.held_lock()?;
        let module = self.binding.read().module.clone().ok_or(ScriptError::ModuleNotLoaded)?;

        let instance = match guard.instantiate(&module, class_name, &args) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!(
                    component = "ScriptExecutor",
                    operation = "create_instance",
                    class = class_name,
                    error = %e,
                    "Instantiation failed"
                );
                return Err(e);
            }
        };

        let previous = {
            let mut binding = self.binding.write();
            binding.class_name = Some(class_name.to_string());
            binding.instance.replace(instance)
        };
        drop(previous);
        drop(module);
        drop(guard);

        tracing::info!(component = "ScriptExecutor", operation = "create_instance", class = class_name, "Instance created");
        Ok(())
    }

    /// Re-execute the bound module in place.
    pub fn reload(&self) -> ScriptResult<()> {
        let guard = self.held_lock()?;
        let module = self.binding.read().module.clone();
        let Some(module) = module else {
            return Err(ScriptError::Reload {
                module: self.module_name(),
                reason: "module not loaded".to_string(),
            });
        };
        guard.reload(&module)?;
        drop(module);
        drop(guard);

        tracing::info!(component = "ScriptExecutor", operation = "reload", module = %self.module_name(), "Module reloaded");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invocation
    // ─────────────────────────────────────────────────────────────────────────

    /// Call `method` and wait for its result on the calling thread.
    pub fn call_sync<R: DeserializeOwned>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<R> {
        let args = to_args(method, args)?;
        let value = self.dispatch(method, &args)?;
        from_value(method, value)
    }

    /// Call `method`, discarding its result.
    pub fn call_void(&self, method: &str, args: impl IntoArgs) -> ScriptResult<()> {
        let args = to_args(method, args)?;
        self.dispatch(method, &args).map(|_| ())
    }

    /// Call `method` on a detached thread.
    ///
    /// Returns without touching the runtime lock. Every error, including an
    /// unloaded module or a finalized runtime, arrives through the returned
    /// future.
    pub fn call_async<R>(&self, method: &str, args: impl IntoArgs) -> CallFuture<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let args = match to_args(method, args) {
            Ok(args) => args,
            Err(e) => return CallFuture::failed(e),
        };

        let (promise, future) = promise::channel();
        let runtime = self.runtime.clone();
        let binding = self.binding.clone();
        let method_name = method.to_string();
        let spawned = thread::Builder::new()
            .name(format!("script-call-{}", method))
            .spawn(move || {
                let result = invoke(&runtime, &binding, &method_name, &args)
                    .and_then(|value| from_value(&method_name, value));
                promise.resolve(result);
            });

        match spawned {
            Ok(_) => future,
            Err(e) => {
                tracing::error!(component = "ScriptExecutor", operation = "call_async", method, error = %e, "Failed to spawn call thread");
                CallFuture::failed(e.into())
            }
        }
    }

    /// Call `method` asynchronously and report through `callback` as
    /// `(result, success, error_message)`. The callback runs on an
    /// unspecified thread.
    pub fn call_with_callback<R, F>(&self, method: &str, callback: F, args: impl IntoArgs)
    where
        R: DeserializeOwned + Send + 'static,
        F: FnOnce(Option<R>, bool, String) + Send + 'static,
    {
        self.call_async::<R>(method, args).then(move |result| match result {
            Ok(value) => callback(Some(value), true, String::new()),
            Err(e) => callback(None, false, e.to_string()),
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether `name` resolves to a callable. Never fails.
    pub fn has_method(&self, name: &str) -> bool {
        let Ok(guard) = self.held_lock() else {
            return false;
        };
        match self.target(&guard) {
            Ok(target) => guard.has_callable(&target, name),
            Err(_) => false,
        }
    }

    /// Public callables on the instance, or on the module when there is no
    /// instance. Sorted; empty when nothing is loaded.
    pub fn get_method_list(&self) -> Vec<String> {
        let Ok(guard) = self.held_lock() else {
            return Vec::new();
        };
        match self.target(&guard) {
            Ok(target) => guard.callables(&target),
            Err(_) => Vec::new(),
        }
    }

    /// Public classes defined by the bound module.
    pub fn get_class_list(&self) -> Vec<String> {
        let Ok(guard) = self.held_lock() else {
            return Vec::new();
        };
        let module = self.binding.read().module.clone();
        module.map(|m| guard.classes(&m)).unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn held_lock(&self) -> ScriptResult<RuntimeGuard<'_>> {
        let guard = self.runtime.lock();
        if guard.is_held() {
            Ok(guard)
        } else {
            Err(ScriptError::RuntimeUnavailable)
        }
    }

    fn target(&self, guard: &RuntimeGuard<'_>) -> ScriptResult<Target> {
        snapshot(&self.binding, guard)
    }

    fn dispatch(&self, method: &str, args: &[Value]) -> ScriptResult<Value> {
        let mut guard = self.held_lock()?;
        let target = self.target(&guard)?;
        tracing::debug!(component = "ScriptExecutor", operation = "call", method, "Calling");

        let result = guard.invoke(&target, method, args);
        if let Err(e) = &result {
            tracing::warn!(component = "ScriptExecutor", operation = "call", method, error = %e, "Call failed");
        }
        drop(target);
        drop(guard);
        result
    }
}

/// Snapshot of the bound references. Cloning them needs the runtime lock,
/// which `_guard` proves is held.
fn snapshot(binding: &RwLock<Binding>, _guard: &RuntimeGuard<'_>) -> ScriptResult<Target> {
    let binding = binding.read();
    let module = binding.module.clone().ok_or(ScriptError::ModuleNotLoaded)?;
    Ok(Target {
        module,
        instance: binding.instance.clone(),
    })
}

/// Body of an asynchronous call, run on its own thread.
fn invoke(runtime: &Runtime, binding: &RwLock<Binding>, method: &str, args: &[Value]) -> ScriptResult<Value> {
    let mut guard = runtime.lock();
    if !guard.is_held() {
        return Err(ScriptError::RuntimeUnavailable);
    }
    let target = snapshot(binding, &guard)?;
    let result = guard.invoke(&target, method, args);
    drop(target);
    drop(guard);
    result
}

impl Drop for ScriptExecutor {
    fn drop(&mut self) {
        let binding = self.binding.read();
        if binding.module.is_some() && !self.runtime.is_alive() {
            tracing::warn!(
                component = "ScriptExecutor",
                operation = "drop",
                module = %binding.module_name,
                "Runtime no longer alive, leaking interpreter references"
            );
        }
    }
}

impl std::fmt::Debug for ScriptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let binding = self.binding.read();
        f.debug_struct("ScriptExecutor")
            .field("module", &binding.module_name)
            .field("class", &binding.class_name)
            .field("loaded", &binding.module.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptException;
    use crate::module::{ClassDef, ModuleDef};
    use serde_json::json;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn calc_module() -> Result<ModuleDef, ScriptException> {
        Ok(ModuleDef::new("calc")
            .attr("counter", 0)
            .function("add", |scope| {
                let a: i64 = scope.arg(0)?;
                let b: i64 = scope.arg(1)?;
                Ok(json!(a + b))
            })
            .function("divide", |scope| {
                let a: f64 = scope.arg(0)?;
                let b: f64 = scope.arg(1)?;
                if b == 0.0 {
                    return Err(ScriptException::value_error("division by zero"));
                }
                Ok(json!(a / b))
            })
            .function("bump", |scope| {
                let next = scope.get_attr("counter").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                scope.set_attr("counter", next);
                Ok(json!(next))
            })
            .function("nested", |scope| {
                let x: i64 = scope.arg(0)?;
                let inner = ScriptExecutor::with_import(scope.runtime(), "calc")
                    .map_err(|e| ScriptException::runtime_error(e.to_string()))?;
                let sum: i64 = inner
                    .call_sync("add", (x, 1))
                    .map_err(|e| ScriptException::runtime_error(e.to_string()))?;
                Ok(json!(sum * 10))
            })
            .function("hold", |scope| {
                let ms: u64 = scope.arg(0)?;
                thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            })
            .function("_private", |_| Ok(json!("hidden")))
            .class(
                ClassDef::new("Calculator")
                    .init(|scope| {
                        scope.set_attr("history", json!([]));
                        Ok(())
                    })
                    .method("calculate", |scope| {
                        let op: String = scope.arg(0)?;
                        let a: f64 = scope.arg(1)?;
                        let b: f64 = scope.arg(2)?;
                        let result = match op.as_str() {
                            "+" => a + b,
                            "*" => a * b,
                            other => {
                                return Err(ScriptException::value_error(format!("unknown operator {}", other)));
                            }
                        };
                        let mut history = scope.get_attr("history").unwrap_or_else(|| json!([]));
                        if let Some(entries) = history.as_array_mut() {
                            entries.push(json!(format!("{} {} {} = {}", a, op, b, result)));
                        }
                        scope.set_attr("history", history);
                        Ok(json!(result))
                    })
                    .method("get_history", |scope| Ok(scope.get_attr("history").unwrap_or_else(|| json!([])))),
            )
            .class(ClassDef::new("Broken").init(|_| Err(ScriptException::runtime_error("cannot build"))))
        )
    }

    fn runtime() -> Runtime {
        let runtime = Runtime::initialized();
        runtime.register_module("calc", calc_module);
        runtime
    }

    #[test]
    fn call_before_import_reports_not_loaded() {
        let runtime = runtime();
        let executor = ScriptExecutor::new(&runtime, "calc");
        assert!(!executor.is_loaded());
        assert!(matches!(executor.call_sync::<i64>("add", (2, 3)), Err(ScriptError::ModuleNotLoaded)));

        executor.import("").unwrap();
        assert!(executor.is_loaded());
        assert_eq!(executor.call_sync::<i64>("add", (2, 3)).unwrap(), 5);
    }

    #[test]
    fn failed_import_leaves_executor_unloaded() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        let err = executor.import("missing").unwrap_err();
        assert!(matches!(err, ScriptError::ModuleLoad { ref module, .. } if module == "missing"));
        assert!(!executor.is_loaded());
        assert_eq!(executor.module_name(), "missing");
    }

    #[test]
    fn interpreter_errors_keep_exception_text() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();

        let err = executor.call_sync::<f64>("divide", (1, 0)).unwrap_err();
        assert!(err.to_string().contains("ValueError: division by zero"));

        assert!(matches!(
            executor.call_sync::<i64>("subtract", (1, 2)),
            Err(ScriptError::MethodNotFound(ref m)) if m == "subtract"
        ));

        let err = executor.call_sync::<i64>("add", (1,)).unwrap_err();
        assert!(err.to_string().contains("TypeError"));

        assert!(matches!(
            executor.call_sync::<String>("add", (1, 2)),
            Err(ScriptError::Conversion { .. })
        ));
    }

    #[test]
    fn instance_calls_resolve_on_class() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        executor.create_instance("Calculator").unwrap();
        assert_eq!(executor.class_name().as_deref(), Some("Calculator"));

        assert_eq!(executor.call_sync::<f64>("calculate", ("+", 2, 3)).unwrap(), 5.0);
        assert_eq!(executor.call_sync::<f64>("calculate", ("*", 4, 5)).unwrap(), 20.0);
        let history: Vec<String> = executor.call_sync("get_history", ()).unwrap();
        assert_eq!(history.len(), 2);

        assert!(matches!(
            executor.call_sync::<i64>("add", (1, 2)),
            Err(ScriptError::MethodNotFound(_))
        ));
    }

    #[test]
    fn failed_instantiation_does_not_leak_instance() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();

        let err = executor.create_instance("Missing").unwrap_err();
        assert!(err.to_string().contains("has no attribute 'Missing'"));

        let err = executor.create_instance("Broken").unwrap_err();
        assert!(err.to_string().contains("RuntimeError: cannot build"));

        assert!(!executor.has_instance());
        assert_eq!(runtime.live_instances(), 0);

        let unloaded = ScriptExecutor::new(&runtime, "calc");
        assert!(matches!(unloaded.create_instance("Calculator"), Err(ScriptError::ModuleNotLoaded)));
    }

    #[test]
    fn method_listing_follows_binding() {
        let runtime = runtime();
        let executor = ScriptExecutor::new(&runtime, "calc");
        assert!(executor.get_method_list().is_empty());
        assert!(!executor.has_method("add"));

        executor.import("").unwrap();
        assert_eq!(executor.get_method_list(), vec!["add", "bump", "divide", "hold", "nested"]);
        assert!(executor.has_method("_private"));
        assert_eq!(executor.get_class_list(), vec!["Broken", "Calculator"]);

        executor.create_instance("Calculator").unwrap();
        assert_eq!(executor.get_method_list(), vec!["calculate", "get_history"]);
        assert!(!executor.has_method("add"));
    }

    #[test]
    fn nested_call_reenters_runtime() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        assert_eq!(executor.call_sync::<i64>("nested", (4,)).unwrap(), 50);
    }

    #[test]
    fn concurrent_calls_are_serialized() {
        let runtime = runtime();
        let executor = Arc::new(ScriptExecutor::with_import(&runtime, "calc").unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        executor.call_void("bump", ()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(executor.call_sync::<i64>("bump", ()).unwrap(), 201);
    }

    #[tokio::test]
    async fn async_errors_arrive_through_future() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();

        assert_eq!(executor.call_async::<i64>("add", (20, 22)).await.unwrap(), 42);

        let err = executor.call_async::<f64>("divide", (1, 0)).await.unwrap_err();
        assert!(matches!(err, ScriptError::Interpreter { .. }));
        assert!(err.to_string().contains("division by zero"));

        let unloaded = ScriptExecutor::new(&runtime, "calc");
        assert!(matches!(
            unloaded.call_async::<i64>("add", (1, 2)).await,
            Err(ScriptError::ModuleNotLoaded)
        ));

        runtime.finalize();
        assert!(matches!(
            executor.call_async::<i64>("add", (1, 2)).await,
            Err(ScriptError::RuntimeUnavailable)
        ));
    }

    #[test]
    fn call_async_returns_while_another_call_holds_the_lock() {
        let runtime = runtime();
        let executor = Arc::new(ScriptExecutor::with_import(&runtime, "calc").unwrap());

        let busy = {
            let executor = executor.clone();
            thread::spawn(move || executor.call_sync::<u64>("hold", (400,)))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !runtime.runtime_lock().is_locked() {
            assert!(Instant::now() < deadline, "busy call never took the lock");
            thread::sleep(Duration::from_millis(1));
        }

        let start = Instant::now();
        let future = executor.call_async::<i64>("add", (1, 2));
        let (tx, rx) = mpsc::channel();
        executor.call_with_callback::<i64, _>("add", move |value, _, _| tx.send(value).unwrap(), (3, 4));
        let returned = start.elapsed();
        assert!(returned < Duration::from_millis(100), "call_async blocked for {:?}", returned);
        assert!(!future.is_ready());

        assert_eq!(future.wait().unwrap(), 3);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(7));
        assert_eq!(busy.join().unwrap().unwrap(), 400);
    }

    #[test]
    fn callback_reports_success_and_failure() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        let (tx, rx) = mpsc::channel();

        let ok_tx = tx.clone();
        executor.call_with_callback::<i64, _>(
            "add",
            move |value, success, error| ok_tx.send((value, success, error)).unwrap(),
            (1, 2),
        );
        let (value, success, error) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, Some(3));
        assert!(success);
        assert!(error.is_empty());

        executor.call_with_callback::<f64, _>(
            "divide",
            move |value, success, error| tx.send((value.map(|v| v as i64), success, error)).unwrap(),
            (1, 0),
        );
        let (value, success, error) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, None);
        assert!(!success);
        assert!(error.contains("division by zero"));
    }

    #[test]
    fn reload_restarts_module_state() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        assert_eq!(executor.call_sync::<i64>("bump", ()).unwrap(), 1);
        assert_eq!(executor.call_sync::<i64>("bump", ()).unwrap(), 2);

        executor.reload().unwrap();
        assert_eq!(executor.call_sync::<i64>("bump", ()).unwrap(), 1);

        let unloaded = ScriptExecutor::new(&runtime, "calc");
        assert!(matches!(unloaded.reload(), Err(ScriptError::Reload { .. })));
    }

    #[test]
    fn drop_after_finalize_leaks_instead_of_touching_runtime() {
        let runtime = runtime();
        let executor = ScriptExecutor::with_import(&runtime, "calc").unwrap();
        executor.create_instance("Calculator").unwrap();

        runtime.finalize();
        assert!(matches!(executor.call_sync::<i64>("add", (1, 2)), Err(ScriptError::RuntimeUnavailable)));
        assert!(executor.get_method_list().is_empty());

        drop(executor);
        assert_eq!(runtime.leaked_references(), 2);
    }
}
