//! Module providers.
//!
//! Imports are resolved by asking each registered [`ModuleProvider`] in turn.
//! [`NativeModules`] is the built-in provider: a catalog of host-defined
//! modules, each produced by a factory that is re-run on reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ScriptException;
use crate::module::ModuleDef;

/// Source of script modules.
pub trait ModuleProvider: Send + Sync {
    /// Load `module`. `None` means this provider does not know the module and
    /// the next provider should be asked; `Some(Err(..))` means the module was
    /// found but raised while loading.
    ///
    /// `search_path` is the runtime's module search path at import time, in
    /// order. Providers that locate modules by directory resolve against it;
    /// [`NativeModules`] ignores it.
    fn load(&self, module: &str, search_path: &[PathBuf]) -> Option<Result<ModuleDef, ScriptException>>;
}

/// Builds a fresh definition of a module.
pub type ModuleFactory = Arc<dyn Fn() -> Result<ModuleDef, ScriptException> + Send + Sync>;

/// Catalog of natively defined modules.
#[derive(Default)]
pub struct NativeModules {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl NativeModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory. Returns `true` if it replaced an earlier one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Result<ModuleDef, ScriptException> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(component = "NativeModules", module = %name, "Registered native module");
        self.factories.write().insert(name, Arc::new(factory)).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ModuleProvider for NativeModules {
    fn load(&self, module: &str, _search_path: &[PathBuf]) -> Option<Result<ModuleDef, ScriptException>> {
        let factory = self.factories.read().get(module).cloned()?;
        Some(factory())
    }
}

impl std::fmt::Debug for NativeModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModules")
            .field("modules", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_runs_on_every_load() {
        let natives = NativeModules::new();
        assert!(!natives.register("demo", || Ok(ModuleDef::new("demo").attr("x", 1))));
        assert!(natives.contains("demo"));

        let first = natives.load("demo", &[]).unwrap().unwrap();
        let second = natives.load("demo", &[]).unwrap().unwrap();
        assert_eq!(first.name(), second.name());

        assert!(natives.load("missing", &[]).is_none());
    }

    #[test]
    fn raising_factory_is_reported() {
        let natives = NativeModules::new();
        natives.register("broken", || Err(ScriptException::new("SyntaxError", "invalid syntax")));
        let err = natives.load("broken", &[]).unwrap().unwrap_err();
        assert_eq!(err.to_string(), "SyntaxError: invalid syntax");
    }
}
