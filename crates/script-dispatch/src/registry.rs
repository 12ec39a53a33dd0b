//! Executor Registry
//!
//! Process-wide map from `(module, class)` to an executor handle. Lookups take
//! a shared lock and hand out a reference-counted copy, so dispatch never
//! holds the registry lock while a script runs. Executors are built and
//! drained outside the exclusive lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use script_runtime::{CallFuture, IntoArgs, Runtime, ScriptError, ScriptExecutor, ScriptResult};

use crate::handle::{Executor, ExecutorHandle};
use crate::pool::{DEFAULT_QUEUE_CAPACITY, PoolConfig, ScriptThreadPoolExecutor};

// ─────────────────────────────────────────────────────────────────────────────
// Keys & Info
// ─────────────────────────────────────────────────────────────────────────────

/// Registry key. An empty class names a module-level executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorKey {
    pub module: String,
    pub class: String,
}

impl ExecutorKey {
    pub fn new(module: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            class: class.into(),
        }
    }
}

impl std::fmt::Display for ExecutorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.class)
    }
}

/// Summary of a registered executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub module_name: String,
    pub class_name: String,
    pub is_pool: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default grace period for a pool to drain on unregister.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How `unregister` waits for a pool's outstanding calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Wait up to the grace period, then fail and keep the entry.
    Wait(Duration),
    /// Wait however long it takes.
    WaitForever,
    /// Cancel queued calls, then wait up to the grace period for running ones.
    CancelPending(Duration),
}

impl Default for DrainPolicy {
    fn default() -> Self {
        DrainPolicy::Wait(DEFAULT_DRAIN_TIMEOUT)
    }
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub drain_policy: DrainPolicy,

    /// Queue bound for pools the registry creates.
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_policy: DrainPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RegistryConfig {
    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of executors keyed by `(module, class)`.
pub struct ExecutorRegistry {
    runtime: Runtime,
    config: RegistryConfig,
    executors: RwLock<HashMap<ExecutorKey, ExecutorHandle>>,
}

static GLOBAL: OnceLock<ExecutorRegistry> = OnceLock::new();

impl ExecutorRegistry {
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_config(runtime, RegistryConfig::default())
    }

    pub fn with_config(runtime: &Runtime, config: RegistryConfig) -> Self {
        Self {
            runtime: runtime.clone(),
            config,
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry, bound to [`Runtime::global`].
    pub fn global() -> &'static ExecutorRegistry {
        GLOBAL.get_or_init(|| ExecutorRegistry::new(Runtime::global()))
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an executor for `module`/`class`. Returns `false` if one
    /// already exists or construction failed.
    ///
    /// With `use_pool`, calls go through a pool of `pool_size` workers
    /// (0 for hardware parallelism).
    pub fn register(&self, module: &str, class: &str, use_pool: bool, pool_size: usize) -> bool {
        match self.try_register(module, class, use_pool, pool_size) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    component = "ExecutorRegistry",
                    operation = "register",
                    module,
                    class,
                    error = %e,
                    "Registration failed"
                );
                false
            }
        }
    }

    /// Like [`register`](Self::register), reporting why registration failed.
    pub fn try_register(&self, module: &str, class: &str, use_pool: bool, pool_size: usize) -> ScriptResult<()> {
        let key = ExecutorKey::new(module, class);
        if self.executors.read().contains_key(&key) {
            return Err(already_exists(&key));
        }

        // Construction imports and instantiates; keep it outside the lock.
        let executor = Arc::new(self.build(module, class, use_pool, pool_size)?);

        let mut executors = self.executors.write();
        if executors.contains_key(&key) {
            drop(executors);
            // Lost the race; the losing executor is discarded here.
            drop(executor);
            return Err(already_exists(&key));
        }
        executors.insert(key.clone(), executor);
        drop(executors);

        tracing::info!(
            component = "ExecutorRegistry",
            operation = "register",
            executor = %key,
            pool = use_pool,
            "Executor registered"
        );
        Ok(())
    }

    fn build(&self, module: &str, class: &str, use_pool: bool, pool_size: usize) -> ScriptResult<Executor> {
        let executor = ScriptExecutor::with_import(&self.runtime, module)?;
        if !class.is_empty() {
            executor.create_instance(class)?;
        }
        if !use_pool {
            return Ok(Executor::Single(executor));
        }
        let config = PoolConfig::default()
            .with_threads(pool_size)
            .with_queue_capacity(self.config.queue_capacity);
        Ok(Executor::Pool(ScriptThreadPoolExecutor::from_executor(executor, config)?))
    }

    /// Remove the executor for `module`/`class`. Returns `false` if it does
    /// not exist or a pool failed to drain in time.
    pub fn unregister(&self, module: &str, class: &str) -> bool {
        match self.try_unregister(module, class) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    component = "ExecutorRegistry",
                    operation = "unregister",
                    module,
                    class,
                    error = %e,
                    "Unregistration failed"
                );
                false
            }
        }
    }

    /// Like [`unregister`](Self::unregister), reporting why it failed.
    ///
    /// A pool is drained according to the configured [`DrainPolicy`] with no
    /// registry lock held. On timeout the entry stays registered.
    pub fn try_unregister(&self, module: &str, class: &str) -> ScriptResult<()> {
        let key = ExecutorKey::new(module, class);
        let handle = self.get_by_key(&key).ok_or_else(|| not_found(&key))?;

        if let Some(pool) = handle.pool() {
            self.drain(pool)?;
        }

        let removed = {
            let mut executors = self.executors.write();
            match executors.get(&key) {
                Some(current) if Arc::ptr_eq(current, &handle) => executors.remove(&key),
                _ => None,
            }
        };
        // Dropped outside the lock: the last handle stops its pool.
        match removed {
            Some(_) => {
                tracing::info!(component = "ExecutorRegistry", operation = "unregister", executor = %key, "Executor unregistered");
                Ok(())
            }
            None => Err(not_found(&key)),
        }
    }

    fn drain(&self, pool: &ScriptThreadPoolExecutor) -> ScriptResult<()> {
        let timeout = match self.config.drain_policy {
            DrainPolicy::WaitForever => {
                pool.wait_all();
                return Ok(());
            }
            DrainPolicy::Wait(timeout) => timeout,
            DrainPolicy::CancelPending(timeout) => {
                pool.cancel_pending();
                timeout
            }
        };
        if pool.wait_all_for(timeout) {
            Ok(())
        } else {
            Err(ScriptError::UnregisterTimeout(timeout))
        }
    }

    /// Unregister everything. Returns how many executors were removed.
    pub fn unregister_all(&self) -> usize {
        let keys: Vec<ExecutorKey> = self.executors.read().keys().cloned().collect();
        keys.iter()
            .filter(|key| self.unregister(&key.module, &key.class))
            .count()
    }

    pub fn has_executor(&self, module: &str, class: &str) -> bool {
        self.executors
            .read()
            .contains_key(&ExecutorKey::new(module, class))
    }

    pub fn get(&self, module: &str, class: &str) -> Option<ExecutorHandle> {
        self.get_by_key(&ExecutorKey::new(module, class))
    }

    fn get_by_key(&self, key: &ExecutorKey) -> Option<ExecutorHandle> {
        self.executors.read().get(key).cloned()
    }

    fn require(&self, module: &str, class: &str) -> ScriptResult<ExecutorHandle> {
        let key = ExecutorKey::new(module, class);
        self.get_by_key(&key).ok_or_else(|| not_found(&key))
    }

    /// All registered executors, sorted by module then class.
    pub fn list_executors(&self) -> Vec<ExecutorInfo> {
        let mut entries: Vec<(ExecutorKey, bool)> = self
            .executors
            .read()
            .iter()
            .map(|(key, executor)| (key.clone(), executor.is_pool()))
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(key, is_pool)| ExecutorInfo {
                module_name: key.module,
                class_name: key.class,
                is_pool,
            })
            .collect()
    }

    pub fn get_method_list(&self, module: &str, class: &str) -> ScriptResult<Vec<String>> {
        Ok(self.require(module, class)?.get_method_list())
    }

    pub fn len(&self) -> usize {
        self.executors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.read().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    pub fn call_sync<R>(&self, module: &str, class: &str, method: &str, args: impl IntoArgs) -> ScriptResult<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.require(module, class)?.call_sync(method, args)
    }

    pub fn call_void(&self, module: &str, class: &str, method: &str, args: impl IntoArgs) -> ScriptResult<()> {
        self.require(module, class)?.call_void(method, args)
    }

    pub fn call_async<R>(&self, module: &str, class: &str, method: &str, args: impl IntoArgs) -> ScriptResult<CallFuture<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.require(module, class)?.call_async(method, args)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

fn not_found(key: &ExecutorKey) -> ScriptError {
    ScriptError::ExecutorNotFound {
        module: key.module.clone(),
        class: key.class.clone(),
    }
}

fn already_exists(key: &ExecutorKey) -> ScriptError {
    ScriptError::ExecutorAlreadyExists {
        module: key.module.clone(),
        class: key.class.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_runtime::{ClassDef, ModuleDef, ScriptException};
    use serde_json::json;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    fn core_module(constructed: Arc<AtomicUsize>) -> ModuleDef {
        ModuleDef::new("Core")
            .function("version", |_| Ok(json!("1.0")))
            .function("sleep_ms", |scope| {
                let ms: u64 = scope.arg(0)?;
                scope.allow_threads(|| thread::sleep(Duration::from_millis(ms)));
                Ok(json!(ms))
            })
            .class(
                ClassDef::new("Client")
                    .init(move |scope| {
                        constructed.fetch_add(1, Ordering::SeqCst);
                        scope.set_attr("connected", false);
                        Ok(())
                    })
                    .method("connect", |scope| {
                        let url: String = scope.arg(0)?;
                        if url.is_empty() {
                            return Err(ScriptException::value_error("empty url"));
                        }
                        scope.set_attr("connected", true);
                        Ok(json!(true))
                    })
                    .method("is_connected", |scope| Ok(scope.get_attr("connected").unwrap_or(json!(false))))
                    .method("sleep_ms", |scope| {
                        let ms: u64 = scope.arg(0)?;
                        scope.allow_threads(|| thread::sleep(Duration::from_millis(ms)));
                        Ok(json!(ms))
                    }),
            )
    }

    fn registry_with(config: RegistryConfig) -> (ExecutorRegistry, Arc<AtomicUsize>) {
        let runtime = Runtime::initialized();
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = constructed.clone();
        runtime.register_module("Core", move || Ok(core_module(counter.clone())));
        (ExecutorRegistry::with_config(&runtime, config), constructed)
    }

    fn registry() -> ExecutorRegistry {
        registry_with(RegistryConfig::default()).0
    }

    #[test]
    fn register_then_unregister() {
        let registry = registry();
        assert!(registry.register("Core", "Client", false, 0));
        assert!(registry.has_executor("Core", "Client"));
        assert!(!registry.register("Core", "Client", true, 2));
        assert!(matches!(
            registry.try_register("Core", "Client", false, 0),
            Err(ScriptError::ExecutorAlreadyExists { .. })
        ));

        assert!(registry.unregister("Core", "Client"));
        assert!(!registry.has_executor("Core", "Client"));
        assert!(!registry.unregister("Core", "Client"));
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_construction_registers_nothing() {
        let registry = registry();
        assert!(!registry.register("Missing", "Client", false, 0));
        assert!(matches!(
            registry.try_register("Core", "Nope", false, 0),
            Err(ScriptError::Instantiation { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn module_level_executor_has_empty_class() {
        let registry = registry();
        assert!(registry.register("Core", "", false, 0));
        assert_eq!(registry.call_sync::<String>("Core", "", "version", ()).unwrap(), "1.0");
        assert_eq!(registry.get_method_list("Core", "").unwrap(), vec!["sleep_ms", "version"]);
        assert_eq!(
            registry.get_method_list("Core", "Client").unwrap_err().to_string(),
            "Executor not found: Core::Client"
        );
    }

    #[test]
    fn concurrent_registration_keeps_one_instance() {
        let (registry, constructed) = registry_with(RegistryConfig::default());
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.register("Core", "Client", false, 0)
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(registry.len(), 1);
        assert!(constructed.load(Ordering::SeqCst) >= 1);
        assert_eq!(registry.runtime().live_instances(), 1);
    }

    #[test]
    fn dispatch_reaches_the_instance() {
        let registry = registry();
        registry.register("Core", "Client", true, 2);

        assert!(registry.call_sync::<bool>("Core", "Client", "connect", ("ws://localhost",)).unwrap());
        assert!(registry.call_sync::<bool>("Core", "Client", "is_connected", ()).unwrap());
        registry.call_void("Core", "Client", "connect", ("ws://other",)).unwrap();

        let err = registry.call_sync::<bool>("Core", "Client", "connect", ("",)).unwrap_err();
        assert!(matches!(err, ScriptError::Interpreter { .. }));
        assert!(err.to_string().contains("ValueError: empty url"));

        let err = registry
            .call_async::<bool>("Core", "Client", "connect", ("",))
            .unwrap()
            .wait()
            .unwrap_err();
        assert!(matches!(err, ScriptError::Interpreter { .. }));
        assert!(err.to_string().contains("ValueError: empty url"));

        assert!(matches!(
            registry.call_sync::<bool>("Core", "Other", "connect", ()),
            Err(ScriptError::ExecutorNotFound { .. })
        ));
        assert!(registry.call_async::<bool>("Core", "Other", "connect", ()).is_err());
    }

    #[test]
    fn list_is_sorted_with_pool_flags() {
        let registry = registry();
        registry.register("Core", "Client", true, 1);
        registry.register("Core", "", false, 0);

        let listed = registry.list_executors();
        assert_eq!(
            listed,
            vec![
                ExecutorInfo {
                    module_name: "Core".into(),
                    class_name: "".into(),
                    is_pool: false,
                },
                ExecutorInfo {
                    module_name: "Core".into(),
                    class_name: "Client".into(),
                    is_pool: true,
                },
            ]
        );
    }

    #[test]
    fn handle_outlives_unregistration() {
        let registry = registry();
        registry.register("Core", "Client", true, 1);
        let handle = registry.get("Core", "Client").unwrap();

        assert!(registry.unregister("Core", "Client"));
        assert!(handle.call_sync::<bool>("connect", ("ws://still-here",)).unwrap());
        assert_eq!(handle.class_name().as_deref(), Some("Client"));
    }

    #[test]
    fn drain_timeout_keeps_entry() {
        let config = RegistryConfig::default().with_drain_policy(DrainPolicy::Wait(Duration::from_millis(50)));
        let (registry, _) = registry_with(config);
        registry.register("Core", "Client", true, 1);

        let slow = registry
            .call_async::<u64>("Core", "Client", "sleep_ms", (400,))
            .unwrap();
        assert!(matches!(
            registry.try_unregister("Core", "Client"),
            Err(ScriptError::UnregisterTimeout(_))
        ));
        assert!(registry.has_executor("Core", "Client"));

        assert_eq!(slow.wait().unwrap(), 400);
        assert!(registry.unregister("Core", "Client"));
    }

    #[test]
    fn cancel_pending_policy_drops_queued_calls() {
        let config = RegistryConfig::default()
            .with_drain_policy(DrainPolicy::CancelPending(Duration::from_secs(5)));
        let (registry, _) = registry_with(config);
        registry.register("Core", "Client", true, 1);

        let running = registry
            .call_async::<u64>("Core", "Client", "sleep_ms", (100,))
            .unwrap();
        let handle = registry.get("Core", "Client").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.pool().map(|p| p.get_active_count()) != Some(1) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        let queued = registry
            .call_async::<u64>("Core", "Client", "sleep_ms", (100,))
            .unwrap();

        assert!(registry.unregister("Core", "Client"));
        assert_eq!(running.wait().unwrap(), 100);
        assert!(matches!(queued.wait(), Err(ScriptError::Cancelled)));
    }

    #[test]
    fn unregister_all_empties_registry() {
        let registry = registry();
        registry.register("Core", "Client", true, 1);
        registry.register("Core", "", false, 0);
        assert_eq!(registry.unregister_all(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn pooled_client_calls_overlap() {
        let registry = registry();
        assert!(registry.register("Core", "Client", true, 2));

        let start = Instant::now();
        let futures: Vec<CallFuture<u64>> = (0..5)
            .map(|_| {
                registry
                    .call_async("Core", "Client", "sleep_ms", (50,))
                    .unwrap()
            })
            .collect();
        let results = futures::future::join_all(futures).await;
        let elapsed = start.elapsed();

        assert!(results.into_iter().all(|r| r.unwrap() == 50));
        assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1250), "elapsed {:?}", elapsed);

        let pool = registry.get("Core", "Client").unwrap();
        assert!(pool.pool().unwrap().wait_all_for(Duration::from_secs(1)));
    }
}
