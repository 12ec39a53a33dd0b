//! Error types for the script runtime and everything dispatching into it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An exception raised by script code.
///
/// Carries the exception kind (`ValueError`, `TypeError`, ...) and its message,
/// rendered as `Kind: message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptException {
    pub kind: String,
    pub message: String,
}

impl ScriptException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn module_not_found(module: &str) -> Self {
        Self::new("ModuleNotFoundError", format!("No module named '{}'", module))
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScriptException {}

/// Errors surfaced by executors, pools and the registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to import module '{module}': {reason}")]
    ModuleLoad { module: String, reason: String },

    #[error("Failed to create instance of '{module}.{class}': {reason}")]
    Instantiation {
        module: String,
        class: String,
        reason: String,
    },

    #[error("Module not loaded. Call import() first")]
    ModuleNotLoaded,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Script error in '{method}': {exception}")]
    Interpreter {
        method: String,
        exception: ScriptException,
    },

    #[error("Conversion failed for '{method}': {reason}")]
    Conversion { method: String, reason: String },

    #[error("Failed to reload module '{module}': {reason}")]
    Reload { module: String, reason: String },

    #[error("Script runtime is not running")]
    RuntimeUnavailable,

    #[error("Executor not found: {module}::{class}")]
    ExecutorNotFound { module: String, class: String },

    #[error("Executor already exists: {module}::{class}")]
    ExecutorAlreadyExists { module: String, class: String },

    #[error("Executor is stopped")]
    ExecutorStopped,

    #[error("Executor did not drain within {0:?}")]
    UnregisterTimeout(Duration),

    #[error("Task cancelled before it started")]
    Cancelled,

    #[error("Call abandoned before producing a result")]
    Abandoned,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(String),
}

impl ScriptError {
    pub(crate) fn interpreter(method: &str, exception: ScriptException) -> Self {
        Self::Interpreter {
            method: method.to_string(),
            exception,
        }
    }

    pub(crate) fn conversion(method: &str, err: impl fmt::Display) -> Self {
        Self::Conversion {
            method: method.to_string(),
            reason: err.to_string(),
        }
    }

    /// The script exception behind this error, if the call got far enough to raise one.
    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            Self::Interpreter { exception, .. } => Some(exception),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::SpawnFailed(err.to_string())
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;
