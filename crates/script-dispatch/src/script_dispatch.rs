//! Script Dispatch
//!
//! Pooled and registered access to script executors.
//!
//! - [`ScriptThreadPoolExecutor`]: fixed worker pool in front of one executor
//! - [`Executor`]: either kind behind one handle type
//! - [`ExecutorRegistry`]: `(module, class)` to shared executor handle

pub mod handle;
pub mod pool;
pub mod registry;

pub use handle::{Executor, ExecutorHandle};
pub use pool::{DEFAULT_QUEUE_CAPACITY, PoolConfig, PoolState, ScriptThreadPoolExecutor};
pub use registry::{
    DEFAULT_DRAIN_TIMEOUT, DrainPolicy, ExecutorInfo, ExecutorKey, ExecutorRegistry, RegistryConfig,
};
