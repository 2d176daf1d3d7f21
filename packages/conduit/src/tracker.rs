//! Counting latch for waiting on a dynamically growing set of work.

use crate::channel::{polling::block_on, token::lock};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};


// message for the panic upon the counter going below zero.
const NEGATIVE_COUNTER: &str = "negative tracker counter";

// message for the panic upon the counter exceeding usize::MAX.
const COUNTER_OVERFLOW: &str = "tracker counter overflow";

/// Counter of outstanding units of work, which can be waited on to reach zero
///
/// Register each unit of work with [`add`](Self::add) (or [`enter`](Self::enter)) _before_
/// spawning the task that will carry it out, and have that task call [`done`](Self::done) when
/// it finishes. [`wait`](Self::wait) resolves once the counter is zero. Registering after spawning
/// lets a concurrent `wait` resolve too early.
///
/// `Tracker` is a cheaply cloneable handle to shared state. Independent batches of work should use
/// independent trackers.
///
/// ```
/// use conduit::Tracker;
/// use std::thread;
///
/// let tracker = Tracker::new();
/// for i in 0..4 {
///     let guard = tracker.enter();
///     thread::spawn(move || {
///         let _guard = guard;
///         println!("working on {}", i);
///     });
/// }
/// tracker.wait().block();
/// assert_eq!(tracker.count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct Tracker(Arc<Mutex<State>>);

#[derive(Default)]
struct State {
    // outstanding units of work.
    count: usize,
    // incremented each time count transitions to zero.
    generation: u64,
    // parked waiters, by id.
    waiters: Vec<(u64, Waker)>,
    next_waiter_id: u64,
}

impl Tracker {
    /// Construct with a count of zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the count by `delta`
    ///
    /// If this brings the count to zero, all current waiters are released.
    ///
    /// # Panics
    ///
    /// If this would bring the count below zero, or above `usize::MAX`. The count is left
    /// unchanged in that case.
    pub fn add(&self, delta: isize) {
        let mut state = lock(&self.0);
        let Some(count) = state.count.checked_add_signed(delta) else {
            drop(state);
            if delta < 0 {
                panic!("{}", NEGATIVE_COUNTER);
            } else {
                panic!("{}", COUNTER_OVERFLOW);
            }
        };
        state.count = count;
        if count != 0 || delta == 0 {
            return;
        }
        state.generation += 1;
        let generation = state.generation;
        let waiters = std::mem::take(&mut state.waiters);
        drop(state);
        trace!(generation, waiters = waiters.len(), "tracker reached zero");
        for (_, waker) in waiters {
            waker.wake();
        }
    }

    /// Decrement the count by one
    ///
    /// # Panics
    ///
    /// If the count is already zero.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Increment the count by one, returning a guard which decrements it when dropped
    ///
    /// Moving the guard into the spawned task makes it decrement the count however the task ends,
    /// including by panicking.
    pub fn enter(&self) -> DoneGuard {
        self.add(1);
        DoneGuard(Some(self.clone()))
    }

    /// Current count
    pub fn count(&self) -> usize {
        lock(&self.0).count
    }

    /// Create a future which resolves once the count is zero
    ///
    /// Resolves immediately if the count is already zero. Otherwise, resolves when the count next
    /// transitions to zero, even if it has become non-zero again by the time this is polled.
    pub fn wait(&self) -> WaitFut {
        WaitFut {
            tracker: self.clone(),
            parked: None,
        }
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Tracker").field("count", &self.count()).finish()
    }
}


/// Future for waiting on a [`Tracker`] to reach zero
pub struct WaitFut {
    tracker: Tracker,
    // waiter id and the generation it was parked during.
    parked: Option<(u64, u64)>,
}

impl WaitFut {
    /// Block the current thread until the tracker's count reaches zero
    pub fn block(mut self) {
        block_on(&mut self)
    }
}

impl Future for WaitFut {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let mut state = lock(&this.tracker.0);
        match this.parked {
            Some((_, generation)) if generation != state.generation => {
                this.parked = None;
                return Poll::Ready(());
            }
            _ if state.count == 0 => {
                if let Some((id, _)) = this.parked.take() {
                    state.waiters.retain(|&(waiter_id, _)| waiter_id != id);
                }
                return Poll::Ready(());
            }
            Some((id, _)) => {
                if let Some((_, waker)) = state.waiters.iter_mut().find(|(waiter_id, _)| *waiter_id == id) {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                }
            }
            None => {
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push((id, cx.waker().clone()));
                this.parked = Some((id, state.generation));
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitFut {
    fn drop(&mut self) {
        if let Some((id, _)) = self.parked.take() {
            lock(&self.tracker.0).waiters.retain(|&(waiter_id, _)| waiter_id != id);
        }
    }
}


/// Guard which decrements a [`Tracker`] when dropped
///
/// Created by [`Tracker::enter`].
#[must_use = "dropping the guard immediately decrements the tracker"]
pub struct DoneGuard(Option<Tracker>);

impl DoneGuard {
    /// Decrement the tracker now
    pub fn done(mut self) {
        if let Some(tracker) = self.0.take() {
            tracker.done();
        }
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.0.take() {
            tracker.done();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::mpsc,
        thread,
        time::Duration,
    };

    // block on the tracker in another thread, reporting to the returned receiver when released.
    fn wait_in_thread(tracker: &Tracker) -> mpsc::Receiver<()> {
        let (send, recv) = mpsc::channel();
        let tracker = tracker.clone();
        thread::spawn(move || {
            tracker.wait().block();
            let _ = send.send(());
        });
        recv
    }

    #[test]
    fn wait_on_zero_returns_immediately() {
        Tracker::new().wait().block();
    }

    #[test]
    fn released_after_exactly_n_done() {
        let tracker = Tracker::new();
        tracker.add(3);
        let released = wait_in_thread(&tracker);

        tracker.done();
        tracker.done();
        assert!(released.recv_timeout(Duration::from_millis(50)).is_err());

        tracker.done();
        released.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn all_waiters_released_together() {
        let tracker = Tracker::new();
        tracker.add(1);
        let released: Vec<_> = (0..8).map(|_| wait_in_thread(&tracker)).collect();
        thread::sleep(Duration::from_millis(20));
        tracker.done();
        for released in released {
            released.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn negative_delta_combinator() {
        let tracker = Tracker::new();
        tracker.add(5);
        tracker.add(-2);
        assert_eq!(tracker.count(), 3);
        tracker.add(-3);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn below_zero_panics_and_leaves_count() {
        let tracker = Tracker::new();
        assert!(catch_unwind(AssertUnwindSafe(|| tracker.done())).is_err());
        tracker.add(1);
        assert!(catch_unwind(AssertUnwindSafe(|| tracker.add(-2))).is_err());
        assert_eq!(tracker.count(), 1);
        tracker.done();
        tracker.wait().block();
    }

    #[test]
    fn overflow_panics_with_its_own_message() {
        let tracker = Tracker::new();
        tracker.add(isize::MAX);
        tracker.add(isize::MAX);
        let err = catch_unwind(AssertUnwindSafe(|| tracker.add(isize::MAX))).unwrap_err();
        assert_eq!(err.downcast_ref::<String>().map(String::as_str), Some(COUNTER_OVERFLOW));
        assert_eq!(tracker.count(), usize::MAX - 1);

        let err = catch_unwind(AssertUnwindSafe(|| Tracker::new().done())).unwrap_err();
        assert_eq!(err.downcast_ref::<String>().map(String::as_str), Some(NEGATIVE_COUNTER));
    }

    #[test]
    fn guard_decrements_on_panic() {
        let tracker = Tracker::new();
        let guard = tracker.enter();
        let join = thread::spawn(move || {
            let _guard = guard;
            panic!("worker failed");
        });
        assert!(join.join().is_err());
        assert_eq!(tracker.count(), 0);
        tracker.wait().block();
    }

    #[test]
    fn waiter_released_by_transition_even_if_count_rises_again() {
        let tracker = Tracker::new();
        tracker.add(1);
        let mut fut = Box::pin(tracker.wait());
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(fut.as_mut().poll(&mut cx).is_pending());
        tracker.done();
        tracker.add(1);
        assert!(fut.as_mut().poll(&mut cx).is_ready());
    }

    #[tokio::test]
    async fn async_wait() {
        let tracker = Tracker::new();
        for _ in 0..16 {
            let guard = tracker.enter();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                drop(guard);
            });
        }
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
        assert_eq!(tracker.count(), 0);
    }
}
