//! Runtime Lock
//!
//! Every touch of interpreter state happens under the runtime's lock. The lock
//! is reentrant: a thread that already holds it (for example a native callable
//! making a nested call) can acquire it again without deadlocking.

use std::cell::RefCell;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::runtime::{Interpreter, Runtime};

/// Mutual exclusion around one interpreter.
pub struct RuntimeLock {
    mutex: ReentrantMutex<RefCell<Interpreter>>,
}

impl RuntimeLock {
    pub(crate) fn new(interpreter: Interpreter) -> Self {
        Self {
            mutex: ReentrantMutex::new(RefCell::new(interpreter)),
        }
    }

    pub(crate) fn acquire(&self) -> ReentrantMutexGuard<'_, RefCell<Interpreter>> {
        self.mutex.lock()
    }

    /// Whether the lock is currently held by any thread.
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    /// Whether the calling thread holds the lock.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread()
    }
}

/// Scoped acquisition of a [`RuntimeLock`].
///
/// Obtained from [`Runtime::lock`]. If the runtime was not alive at the time of
/// acquisition the guard is *not held*, and must not be treated as permission
/// to touch interpreter state. The lock is released when the guard drops, on
/// every exit path including unwinding.
pub struct RuntimeGuard<'r> {
    runtime: &'r Runtime,
    inner: Option<ReentrantMutexGuard<'r, RefCell<Interpreter>>>,
}

impl<'r> RuntimeGuard<'r> {
    pub(crate) fn held(runtime: &'r Runtime, inner: ReentrantMutexGuard<'r, RefCell<Interpreter>>) -> Self {
        Self {
            runtime,
            inner: Some(inner),
        }
    }

    pub(crate) fn unheld(runtime: &'r Runtime) -> Self {
        Self {
            runtime,
            inner: None,
        }
    }

    /// Whether this guard actually holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }

    pub fn runtime(&self) -> &'r Runtime {
        self.runtime
    }

    /// Run `f` against the interpreter state. `None` when the guard is not held.
    ///
    /// The state is borrowed only for the duration of `f`; `f` must not call
    /// back into anything that takes the runtime lock.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Interpreter) -> R) -> Option<R> {
        let inner = self.inner.as_ref()?;
        let mut interpreter = inner.borrow_mut();
        Some(f(&mut interpreter))
    }

    /// Release the lock while `f` runs, then take it back.
    ///
    /// Only the outermost acquisition on this thread actually frees the
    /// interpreter for other threads.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        match self.inner.as_mut() {
            Some(inner) => ReentrantMutexGuard::unlocked(inner, f),
            None => f(),
        }
    }
}

impl std::fmt::Debug for RuntimeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeGuard")
            .field("held", &self.is_held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::runtime::Runtime;

    #[test]
    fn reentrant_on_same_thread() {
        let runtime = Runtime::initialized();
        let outer = runtime.lock();
        assert!(outer.is_held());
        let inner = runtime.lock();
        assert!(inner.is_held());
        assert!(runtime.runtime_lock().is_owned_by_current_thread());
        drop(inner);
        drop(outer);
        assert!(!runtime.runtime_lock().is_locked());
    }

    #[test]
    fn excludes_other_threads() {
        let runtime = Runtime::initialized();
        let entered = Arc::new(AtomicBool::new(false));

        let guard = runtime.lock();
        let handle = {
            let runtime = runtime.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _guard = runtime.lock();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn not_held_before_initialize_or_after_finalize() {
        let runtime = Runtime::new();
        assert!(!runtime.lock().is_held());

        runtime.initialize().unwrap();
        assert!(runtime.lock().is_held());

        runtime.finalize();
        assert!(!runtime.lock().is_held());
    }

    #[test]
    fn unlocked_lets_other_threads_in() {
        let runtime = Runtime::initialized();
        let mut guard = runtime.lock();

        let other = runtime.clone();
        let acquired = guard.unlocked(move || {
            thread::spawn(move || other.lock().is_held())
                .join()
                .unwrap()
        });

        assert!(acquired);
        assert!(guard.is_held());
    }
}
