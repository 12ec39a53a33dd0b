//! Executor Handle
//!
//! The registry stores either kind of executor behind one type so that
//! dispatch does not care which one it got.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use script_runtime::{CallFuture, IntoArgs, ScriptExecutor, ScriptResult};

use crate::pool::ScriptThreadPoolExecutor;

/// Shared handle to a registered executor. Stays valid after the registry
/// entry is removed.
pub type ExecutorHandle = Arc<Executor>;

/// A single executor or a thread pool in front of one.
#[derive(Debug)]
pub enum Executor {
    Single(ScriptExecutor),
    Pool(ScriptThreadPoolExecutor),
}

impl Executor {
    pub fn is_pool(&self) -> bool {
        matches!(self, Executor::Pool(_))
    }

    /// The executor that ultimately runs the calls.
    pub fn script_executor(&self) -> &ScriptExecutor {
        match self {
            Executor::Single(executor) => executor,
            Executor::Pool(pool) => pool.executor(),
        }
    }

    pub fn pool(&self) -> Option<&ScriptThreadPoolExecutor> {
        match self {
            Executor::Pool(pool) => Some(pool),
            Executor::Single(_) => None,
        }
    }

    pub fn module_name(&self) -> String {
        self.script_executor().module_name()
    }

    pub fn class_name(&self) -> Option<String> {
        self.script_executor().class_name()
    }

    pub fn call_sync<R>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        match self {
            Executor::Single(executor) => executor.call_sync(method, args),
            Executor::Pool(pool) => pool.call_sync(method, args),
        }
    }

    pub fn call_void(&self, method: &str, args: impl IntoArgs) -> ScriptResult<()> {
        match self {
            Executor::Single(executor) => executor.call_void(method, args),
            Executor::Pool(pool) => pool.call_void(method, args),
        }
    }

    /// Start a call without waiting. Only a stopped pool fails here.
    pub fn call_async<R>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<CallFuture<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        match self {
            Executor::Single(executor) => Ok(executor.call_async(method, args)),
            Executor::Pool(pool) => pool.call_async(method, args),
        }
    }

    pub fn get_method_list(&self) -> Vec<String> {
        self.script_executor().get_method_list()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.script_executor().has_method(name)
    }
}

impl From<ScriptExecutor> for Executor {
    fn from(executor: ScriptExecutor) -> Self {
        Executor::Single(executor)
    }
}

impl From<ScriptThreadPoolExecutor> for Executor {
    fn from(pool: ScriptThreadPoolExecutor) -> Self {
        Executor::Pool(pool)
    }
}
