//! Runtime configuration consumed at startup.

use serde::{Deserialize, Serialize};

/// Paths appended to the interpreter's module search path when the runtime
/// is configured. Empty strings are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding the host's own script modules.
    pub module_search_path: String,

    /// Directory holding third-party packages.
    pub package_path: String,
}

impl RuntimeConfig {
    pub fn with_module_search_path(mut self, path: impl Into<String>) -> Self {
        self.module_search_path = path.into();
        self
    }

    pub fn with_package_path(mut self, path: impl Into<String>) -> Self {
        self.package_path = path.into();
        self
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &str> {
        [self.module_search_path.as_str(), self.package_path.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
    }
}
