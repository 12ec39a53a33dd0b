//! Script Thread Pool Executor
//!
//! A fixed set of worker threads draining a FIFO queue of calls against one
//! shared [`ScriptExecutor`]. Submission never blocks on script execution;
//! results come back through [`CallFuture`]s.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;

use script_runtime::{CallFuture, IntoArgs, Promise, Runtime, ScriptError, ScriptExecutor, ScriptResult, channel};

// ─────────────────────────────────────────────────────────────────────────────
// Pool Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default bound on queued (not yet started) calls.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sizing of a thread pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Worker count; 0 means hardware parallelism (4 if unknown).
    pub threads: usize,

    /// Maximum queued calls before `submit` blocks; 0 means unbounded.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// The worker count this configuration produces.
    pub fn resolved_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// Accepting submissions
    Running = 0,
    /// Refusing submissions, workers finishing the queue
    Stopping = 1,
    /// All workers joined
    Stopped = 2,
}

impl PoolState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == PoolState::Running
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Running => write!(f, "running"),
            PoolState::Stopping => write!(f, "stopping"),
            PoolState::Stopped => write!(f, "stopped"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Jobs
// ─────────────────────────────────────────────────────────────────────────────

trait Job: Send {
    fn run(self: Box<Self>, executor: &ScriptExecutor);
    fn cancel(self: Box<Self>);
}

struct CallJob<R> {
    method: String,
    args: Vec<Value>,
    promise: Promise<R>,
}

impl<R: DeserializeOwned + Send + 'static> Job for CallJob<R> {
    fn run(self: Box<Self>, executor: &ScriptExecutor) {
        let CallJob { method, args, promise } = *self;
        promise.resolve(executor.call_sync::<R>(&method, args));
    }

    fn cancel(self: Box<Self>) {
        self.promise.resolve(Err(ScriptError::Cancelled));
    }
}

struct Queue {
    jobs: VecDeque<Box<dyn Job>>,
    active: usize,
    stopping: bool,
}

impl Queue {
    fn is_drained(&self) -> bool {
        self.jobs.is_empty() && self.active == 0
    }
}

struct Shared {
    executor: ScriptExecutor,
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or the pool starts stopping.
    work_available: Condvar,
    /// Signalled when the queue is empty and nothing is running.
    drained: Condvar,
    /// Signalled when a queued job is taken.
    space_available: Condvar,
    state: AtomicU8,
    capacity: usize,
}

impl Shared {
    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread Pool Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Worker pool dispatching calls onto one [`ScriptExecutor`].
pub struct ScriptThreadPoolExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl ScriptThreadPoolExecutor {
    /// Import `module_name` and start the workers.
    pub fn new(runtime: &Runtime, module_name: &str, config: PoolConfig) -> ScriptResult<Self> {
        let executor = ScriptExecutor::with_import(runtime, module_name)?;
        Self::from_executor(executor, config)
    }

    /// Start workers around an already configured executor.
    pub fn from_executor(executor: ScriptExecutor, config: PoolConfig) -> ScriptResult<Self> {
        let thread_count = config.resolved_threads();
        let module = executor.module_name();
        let pool = Self {
            shared: Arc::new(Shared {
                executor,
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    active: 0,
                    stopping: false,
                }),
                work_available: Condvar::new(),
                drained: Condvar::new(),
                space_available: Condvar::new(),
                state: AtomicU8::new(PoolState::Running as u8),
                capacity: config.queue_capacity,
            }),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
        };

        for worker_id in 0..thread_count {
            let shared = pool.shared.clone();
            // On failure the pool's drop joins whatever already started.
            let handle = thread::Builder::new()
                .name(format!("script-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, shared))?;
            pool.workers.lock().push(handle);
        }

        tracing::info!(
            component = "ScriptThreadPoolExecutor",
            operation = "start",
            module = %module,
            threads = thread_count,
            "Thread pool started"
        );
        Ok(pool)
    }

    /// Queue a call. Fails only if the pool is stopping; everything else is
    /// reported through the future. Blocks while the queue is full.
    pub fn submit<R>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<CallFuture<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let args = match args.into_args() {
            Ok(args) => args,
            Err(e) => {
                return Ok(CallFuture::failed(ScriptError::Conversion {
                    method: method.to_string(),
                    reason: e.to_string(),
                }));
            }
        };

        let (promise, future) = channel();
        let job: Box<dyn Job> = Box::new(CallJob {
            method: method.to_string(),
            args,
            promise,
        });

        let capacity = self.shared.capacity;
        let mut queue = self.shared.queue.lock();
        self.shared.space_available.wait_while(&mut queue, |q| {
            !q.stopping && capacity > 0 && q.jobs.len() >= capacity
        });
        if queue.stopping {
            return Err(ScriptError::ExecutorStopped);
        }
        queue.jobs.push_back(job);
        drop(queue);

        self.shared.work_available.notify_one();
        Ok(future)
    }

    /// Submit and wait for the result.
    pub fn call_sync<R>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.submit::<R>(method, args)?.wait()
    }

    /// Submit and wait, discarding the result.
    pub fn call_void(&self, method: &str, args: impl IntoArgs) -> ScriptResult<()> {
        self.submit::<IgnoredAny>(method, args)?.wait().map(|_| ())
    }

    /// Same as [`submit`](Self::submit).
    pub fn call_async<R>(&self, method: &str, args: impl IntoArgs) -> ScriptResult<CallFuture<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.submit(method, args)
    }

    /// Block until the queue is empty and no call is running.
    ///
    /// Must not be called from inside a task running on this pool.
    pub fn wait_all(&self) {
        let mut queue = self.shared.queue.lock();
        self.shared.drained.wait_while(&mut queue, |q| !q.is_drained());
    }

    /// Like [`wait_all`](Self::wait_all) with a bound. Returns whether the
    /// pool drained in time.
    pub fn wait_all_for(&self, timeout: Duration) -> bool {
        let mut queue = self.shared.queue.lock();
        self.shared
            .drained
            .wait_while_for(&mut queue, |q| !q.is_drained(), timeout);
        queue.is_drained()
    }

    /// Drop every queued call that has not started. Their futures resolve
    /// with [`ScriptError::Cancelled`]. Returns how many were dropped.
    pub fn cancel_pending(&self) -> usize {
        let cancelled: Vec<Box<dyn Job>> = self.shared.queue.lock().jobs.drain(..).collect();
        self.shared.space_available.notify_all();
        self.shared.drained.notify_all();

        let count = cancelled.len();
        for job in cancelled {
            job.cancel();
        }
        if count > 0 {
            tracing::info!(
                component = "ScriptThreadPoolExecutor",
                operation = "cancel_pending",
                cancelled = count,
                "Cancelled pending calls"
            );
        }
        count
    }

    /// Stop accepting work, let workers finish the queue, and join them.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.stopping {
                queue.stopping = true;
                self.shared.set_state(PoolState::Stopping);
                tracing::info!(
                    component = "ScriptThreadPoolExecutor",
                    operation = "shutdown",
                    pending = queue.jobs.len(),
                    "Thread pool stopping"
                );
            }
        }
        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();

        let mut workers = self.workers.lock();
        let current = thread::current().id();
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(component = "ScriptThreadPoolExecutor", "Worker thread panicked");
            }
        }
        self.shared.set_state(PoolState::Stopped);
        drop(workers);

        tracing::debug!(component = "ScriptThreadPoolExecutor", operation = "shutdown", "Thread pool stopped");
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Calls currently executing.
    pub fn get_active_count(&self) -> usize {
        self.shared.queue.lock().active
    }

    /// Calls queued but not started.
    pub fn get_pending_count(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn executor(&self) -> &ScriptExecutor {
        &self.shared.executor
    }

    pub fn get_method_list(&self) -> Vec<String> {
        self.shared.executor.get_method_list()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.shared.executor.has_method(name)
    }
}

fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    tracing::debug!(component = "ScriptThreadPoolExecutor", worker = worker_id, "Worker started");

    loop {
        let job = {
            let mut queue = shared.queue.lock();
            shared
                .work_available
                .wait_while(&mut queue, |q| !q.stopping && q.jobs.is_empty());
            match queue.jobs.pop_front() {
                Some(job) => {
                    queue.active += 1;
                    job
                }
                // Stopping and nothing left.
                None => break,
            }
        };
        shared.space_available.notify_one();

        if panic::catch_unwind(AssertUnwindSafe(|| job.run(&shared.executor))).is_err() {
            tracing::error!(component = "ScriptThreadPoolExecutor", worker = worker_id, "Task panicked");
        }

        let drained = {
            let mut queue = shared.queue.lock();
            queue.active -= 1;
            queue.is_drained()
        };
        if drained {
            shared.drained.notify_all();
        }
    }

    tracing::debug!(component = "ScriptThreadPoolExecutor", worker = worker_id, "Worker stopped");
}

impl Drop for ScriptThreadPoolExecutor {
    fn drop(&mut self) {
        if self.state() != PoolState::Stopped {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ScriptThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptThreadPoolExecutor")
            .field("module", &self.shared.executor.module_name())
            .field("threads", &self.thread_count)
            .field("state", &self.state())
            .finish()
    }
}
