//! Script Runtime
//!
//! Safe multi-threaded access to a single-threaded, globally locked embedded
//! interpreter.
//!
//! # Architecture
//!
//! - A [`Runtime`] owns the interpreter state behind a reentrant [`RuntimeLock`]
//! - Script modules come from [`ModuleProvider`]s; [`NativeModules`] is built in
//! - A [`ScriptExecutor`] binds one module (and optionally one instance) and
//!   takes the lock around every interpreter touch
//! - Asynchronous calls resolve a [`CallFuture`] that can be waited on,
//!   awaited, or given a completion callback
//! - Once a runtime is finalized, outstanding [`ObjectRef`]s leak rather than
//!   touch torn-down state

mod config;
mod error;
mod executor;
mod lock;
mod module;
mod native;
mod object;
mod promise;
mod runtime;
mod value;

pub use config::RuntimeConfig;
pub use error::{ScriptError, ScriptException, ScriptResult};
pub use executor::ScriptExecutor;
pub use lock::{RuntimeGuard, RuntimeLock};
pub use module::{CallResult, CallScope, ClassDef, ModuleDef, NativeFn, is_public};
pub use native::{ModuleFactory, ModuleProvider, NativeModules};
pub use object::ObjectRef;
pub use promise::{CallFuture, Promise, channel};
pub use runtime::{Runtime, RuntimeState};
pub use value::{IntoArgs, Value};
