//! Host
//!
//! Owns the executor registry for one runtime and wires it up from
//! [`HostConfig`].

use serde::Serialize;

use script_dispatch::{ExecutorInfo, ExecutorRegistry};
use script_runtime::{Runtime, ScriptResult};

use crate::config::HostConfig;
use crate::demo;

/// Snapshot of what the host is running.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub runtime_state: String,
    pub search_path: Vec<String>,
    pub loaded_modules: Vec<String>,
    pub executors: Vec<ExecutorInfo>,
}

pub struct Host {
    runtime: Runtime,
    registry: ExecutorRegistry,
}

impl Host {
    /// Initialize `runtime`, install the built-in modules and register every
    /// configured executor. Executors that fail to construct are logged and
    /// skipped.
    pub fn start(runtime: &Runtime, config: &HostConfig) -> ScriptResult<Self> {
        runtime.initialize()?;
        runtime.configure(&config.runtime)?;
        demo::install(runtime);

        let registry = ExecutorRegistry::with_config(runtime, config.registry.to_registry_config());
        for spec in &config.executors {
            match registry.try_register(&spec.module, &spec.class, spec.pool, spec.threads) {
                Ok(()) => tracing::info!(
                    component = "Host",
                    module = %spec.module,
                    class = %spec.class,
                    pool = spec.pool,
                    threads = spec.threads,
                    "Registered executor"
                ),
                Err(e) => tracing::error!(
                    component = "Host",
                    module = %spec.module,
                    class = %spec.class,
                    error = %e,
                    "Failed to register executor"
                ),
            }
        }

        Ok(Self {
            runtime: runtime.clone(),
            registry,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn describe(&self) -> HostStatus {
        HostStatus {
            runtime_state: self.runtime.state().to_string(),
            search_path: self
                .runtime
                .search_path()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            loaded_modules: self.runtime.loaded_modules(),
            executors: self.registry.list_executors(),
        }
    }

    /// Drain and drop every executor, then finalize the runtime.
    pub fn shutdown(&self) {
        let removed = self.registry.unregister_all();
        tracing::info!(component = "Host", removed, "Executors unregistered");
        self.runtime.finalize();
    }
}
