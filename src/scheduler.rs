//! Bounded concurrency scheduler
//!
//! At most `capacity` units of work run at once; the rest wait in a FIFO queue and are
//! promoted as running units finish (success, failure and cancellation alike).
//! Each unit receives a child [`CancellationToken`] that fires on [`Scheduler::cancel`].

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type Work = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct State {
    pending: VecDeque<Work>,
    running: usize,
    closed: bool,
}

struct Inner {
    capacity: usize,
    state: Mutex<State>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// FIFO admission control for async work (cloneable - all state is Arc-wrapped)
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler running at most `capacity` units concurrently (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    running: 0,
                    closed: false,
                }),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue a unit of work, starting it immediately if a slot is free
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`Error::SchedulerClosed`] once [`join`](Self::join) or [`cancel`](Self::cancel)
    /// has been called.
    pub fn submit<F, Fut>(&self, work: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(Error::SchedulerClosed);
        }
        state
            .pending
            .push_back(Box::new(move |token| Box::pin(work(token))));
        Inner::promote(&self.inner, &mut state);
        Ok(())
    }

    /// Stop accepting work and wait until nothing is pending or running
    pub async fn join(&self) {
        {
            let mut state = self.inner.lock();
            state.closed = true;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Drop pending work unexecuted, signal every running unit to cancel, then join
    pub async fn cancel(&self) {
        let dropped = {
            let mut state = self.inner.lock();
            state.closed = true;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        tracing::debug!(dropped_pending = dropped, "Cancelling scheduler");
        self.inner.cancel.cancel();
        self.join().await;
    }

    /// Number of units currently running
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Number of units waiting for a slot
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Maximum concurrently running units
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Whether [`cancel`](Self::cancel) has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start pending units while there is capacity. Caller holds the state lock.
    fn promote(this: &Arc<Inner>, state: &mut State) {
        // Without a runtime (e.g. during runtime teardown) nothing can be spawned;
        // leave the work queued.
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        while state.running < this.capacity {
            let Some(work) = state.pending.pop_front() else {
                break;
            };
            state.running += 1;
            let fut = work(this.cancel.child_token());
            let slot = SlotGuard {
                inner: Arc::clone(this),
            };
            this.tracker.spawn(async move {
                let _slot = slot;
                fut.await;
            });
        }
    }

    fn finish_one(this: &Arc<Inner>) {
        let mut state = this.lock();
        state.running = state.running.saturating_sub(1);
        Inner::promote(this, &mut state);
    }
}

/// Releases a running slot when the unit completes or its future is dropped.
///
/// The next unit is spawned before the finishing task leaves the tracker, so the
/// tracker cannot drain while work is still pending.
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        Inner::finish_one(&self.inner);
    }
}
