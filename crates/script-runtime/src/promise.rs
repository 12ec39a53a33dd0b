//! Single-assignment result cells.
//!
//! A [`Promise`] is the producing half, a [`CallFuture`] the consuming half.
//! The consumer can block ([`CallFuture::wait`]), poll with a timeout
//! ([`CallFuture::wait_for`]), `.await` it, or hand it a completion callback
//! ([`CallFuture::then`]). A promise dropped without a value resolves the
//! future with [`ScriptError::Abandoned`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{ScriptError, ScriptResult};

type Callback<T> = Box<dyn FnOnce(ScriptResult<T>) + Send>;

enum SlotState<T> {
    Pending {
        wakers: Vec<Waker>,
        callback: Option<Callback<T>>,
    },
    Ready(ScriptResult<T>),
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending {
                wakers: Vec::new(),
                callback: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: ScriptResult<T>) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Pending {
                wakers,
                callback: Some(callback),
            } => {
                drop(state);
                wakers.into_iter().for_each(Waker::wake);
                callback(result);
            }
            SlotState::Pending {
                wakers,
                callback: None,
            } => {
                *state = SlotState::Ready(result);
                drop(state);
                self.ready.notify_all();
                wakers.into_iter().for_each(Waker::wake);
            }
            done => *state = done,
        }
    }
}

/// Create a connected promise/future pair.
pub fn channel<T>() -> (Promise<T>, CallFuture<T>) {
    let slot = Arc::new(Slot::pending());
    (
        Promise {
            slot: Some(slot.clone()),
        },
        CallFuture { slot },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Promise
// ─────────────────────────────────────────────────────────────────────────────

/// Producing half of a call result.
pub struct Promise<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Promise<T> {
    pub fn resolve(mut self, result: ScriptResult<T>) {
        if let Some(slot) = self.slot.take() {
            slot.complete(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.complete(Err(ScriptError::Abandoned));
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Future
// ─────────────────────────────────────────────────────────────────────────────

/// Consuming half of a call result.
pub struct CallFuture<T> {
    slot: Arc<Slot<T>>,
}

impl<T> CallFuture<T> {
    /// A future that is already resolved.
    pub fn resolved(result: ScriptResult<T>) -> Self {
        Self {
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState::Ready(result)),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn failed(err: ScriptError) -> Self {
        Self::resolved(Err(err))
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending { .. })
    }

    /// Block until the result is available.
    pub fn wait(self) -> ScriptResult<T> {
        let mut state = self.slot.state.lock();
        self.slot
            .ready
            .wait_while(&mut state, |s| matches!(s, SlotState::Pending { .. }));
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => result,
            _ => Err(ScriptError::Abandoned),
        }
    }

    /// Block for at most `timeout`. Returns whether the result is available.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.slot.state.lock();
        self.slot
            .ready
            .wait_while_for(&mut state, |s| matches!(s, SlotState::Pending { .. }), timeout);
        !matches!(*state, SlotState::Pending { .. })
    }

    /// Deliver the result to `callback` instead of waiting for it.
    ///
    /// Runs immediately on the calling thread if the result is already
    /// available, otherwise on the thread that resolves the promise.
    pub fn then<F>(self, callback: F)
    where
        F: FnOnce(ScriptResult<T>) + Send + 'static,
    {
        let mut state = self.slot.state.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => {
                drop(state);
                callback(result);
            }
            SlotState::Pending { wakers, .. } => {
                *state = SlotState::Pending {
                    wakers,
                    callback: Some(Box::new(callback)),
                };
            }
            SlotState::Taken => {
                drop(state);
                callback(Err(ScriptError::Abandoned));
            }
        }
    }
}

impl<T> Future for CallFuture<T> {
    type Output = ScriptResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        if let SlotState::Pending { wakers, .. } = &mut *state {
            if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => Poll::Ready(result),
            _ => Poll::Ready(Err(ScriptError::Abandoned)),
        }
    }
}

impl<T> std::fmt::Debug for CallFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn wait_returns_value_from_other_thread() {
        let (promise, future) = channel::<i64>();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.resolve(Ok(42));
        });
        assert_eq!(future.wait().unwrap(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn wait_for_times_out_while_pending() {
        let (promise, future) = channel::<i64>();
        assert!(!future.wait_for(Duration::from_millis(20)));
        assert!(!future.is_ready());

        promise.resolve(Ok(1));
        assert!(future.wait_for(Duration::from_millis(20)));
        assert!(future.is_ready());
    }

    #[test]
    fn dropped_promise_abandons() {
        let (promise, future) = channel::<String>();
        drop(promise);
        assert!(matches!(future.wait(), Err(ScriptError::Abandoned)));
    }

    #[test]
    fn then_runs_on_resolving_thread_or_immediately() {
        let (tx, rx) = mpsc::channel();

        let (promise, future) = channel::<i64>();
        let sender = tx.clone();
        future.then(move |r| sender.send(r.unwrap()).unwrap());
        promise.resolve(Ok(7));

        CallFuture::resolved(Ok(8)).then(move |r| tx.send(r.unwrap()).unwrap());

        assert_eq!(rx.recv().unwrap(), 7);
        assert_eq!(rx.recv().unwrap(), 8);
    }

    #[test]
    fn first_resolution_wins() {
        let (promise, future) = channel::<i64>();
        promise.resolve(Err(ScriptError::Cancelled));
        assert!(matches!(future.wait(), Err(ScriptError::Cancelled)));
    }

    #[tokio::test]
    async fn awaitable() {
        let (promise, future) = channel::<Vec<i64>>();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.resolve(Ok(vec![1, 2, 3]));
        });
        assert_eq!(future.await.unwrap(), vec![1, 2, 3]);

        let failed: CallFuture<()> = CallFuture::failed(ScriptError::ExecutorStopped);
        assert!(matches!(failed.await, Err(ScriptError::ExecutorStopped)));
    }
}
