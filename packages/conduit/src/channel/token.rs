// parking primitives for channel operations that could not complete immediately.
//
// a parked operation leaves a `Waiter` in a channel's queue. every waiter carries an `Arc<Token>`
// shared by all the waiters of the same blocking operation (a plain send/recv has one waiter, a
// select has one per case). the token can be fired exactly once. whoever fires it either:
//
// - completes a parked send by taking its item (a counterpart recv),
// - tells a parked recv that an item may be available, so it retries,
// - tells it the channel was closed, or
// - is the owner itself, withdrawing the operation.
//
// a parked sender's waiter carries a slot holding its pending item. the slot is only touched by a
// counterpart while it holds the token claim, and by the owner only after it has observed the
// token as fired. parked receivers carry no slot: items only ever leave the channel through a
// receive that is actively being polled, so a dropped receive can never strand one.
//
// lock order is always: channel lock -> token lock -> slot lock.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Waker,
};


// lock a mutex, ignoring poisoning.
//
// the channel never panics while holding one of its locks except on internal bugs, but a waker
// supplied by a caller's executor could, and that must not wedge every other handle.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// how a token was fired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Outcome {
    // a counterpart completed the transfer.
    Transferred,
    // an item may have become available. the receiver must retry.
    Notified,
    // the channel was closed while parked.
    Closed,
    // the owner withdrew the operation.
    Withdrawn,
}

// which case fired a token, and how.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Fired {
    pub(crate) case: usize,
    pub(crate) outcome: Outcome,
}

// one-shot wake token for a parked operation.
pub(crate) struct Token {
    state: Mutex<TokenState>,
}

struct TokenState {
    fired: Option<Fired>,
    waker: Option<Waker>,
}

// exclusive right to complete the operation a token belongs to.
//
// holds the token lock, so the owner cannot observe the token as fired until this is dropped.
// dropping it wakes the owner, unless the owner is the one who claimed it.
pub(crate) struct Claim<'a> {
    state: MutexGuard<'a, TokenState>,
}

impl Token {
    // construct an unfired token which will wake the given waker when fired.
    pub(crate) fn new(waker: &Waker) -> Arc<Self> {
        Arc::new(Token {
            state: Mutex::new(TokenState {
                fired: None,
                waker: Some(waker.clone()),
            }),
        })
    }

    // try to fire the token. returns none if it was already fired.
    pub(crate) fn claim(&self, case: usize, outcome: Outcome) -> Option<Claim<'_>> {
        let mut state = lock(&self.state);
        if state.fired.is_some() {
            return None;
        }
        state.fired = Some(Fired { case, outcome });
        Some(Claim { state })
    }

    // if fired, return how. otherwise, store the waker to be woken when fired.
    pub(crate) fn poll_fired(&self, waker: &Waker) -> Option<Fired> {
        let mut state = lock(&self.state);
        if state.fired.is_some() {
            return state.fired;
        }
        match &state.waker {
            Some(prev) if prev.will_wake(waker) => (),
            _ => state.waker = Some(waker.clone()),
        }
        None
    }

    // how the token was fired, if it was.
    pub(crate) fn fired(&self) -> Option<Fired> {
        lock(&self.state).fired
    }

    // whether the token has been fired.
    pub(crate) fn is_fired(&self) -> bool {
        self.fired().is_some()
    }
}

impl<'a> Drop for Claim<'a> {
    fn drop(&mut self) {
        let withdrawn = self.state.fired.is_some_and(|fired| fired.outcome == Outcome::Withdrawn);
        if let Some(waker) = self.state.waker.take() {
            if !withdrawn {
                waker.wake();
            }
        }
    }
}

// hand-off space for one item.
pub(crate) struct Slot<T>(Mutex<Option<T>>);

impl<T> Slot<T> {
    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Slot(Mutex::new(None)))
    }

    pub(crate) fn holding(elem: T) -> Arc<Self> {
        Arc::new(Slot(Mutex::new(Some(elem))))
    }

    pub(crate) fn put(&self, elem: T) {
        let prev = lock(&self.0).replace(elem);
        debug_assert!(prev.is_none(), "slot overwritten (internal bug)");
    }

    pub(crate) fn take(&self) -> Option<T> {
        lock(&self.0).take()
    }
}

// parked operation in one of a channel's waiter queues. senders carry an `Arc<Slot<T>>`,
// receivers nothing.
pub(crate) struct Waiter<S = ()> {
    pub(crate) token: Arc<Token>,
    // index of the select case this waiter belongs to, or 0 for plain operations.
    pub(crate) case: usize,
    pub(crate) slot: S,
}

impl<S> Waiter<S> {
    // whether this waiter belongs to the given token.
    pub(crate) fn belongs_to(&self, token: &Token) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.token), token)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        task::Wake,
    };

    struct CountWakes(AtomicUsize);

    impl Wake for CountWakes {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn token_fires_once() {
        let counter = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let token = Token::new(&waker);

        assert!(token.poll_fired(&waker).is_none());
        drop(token.claim(2, Outcome::Transferred).unwrap());
        assert!(token.claim(0, Outcome::Closed).is_none());
        assert_eq!(
            token.poll_fired(&waker),
            Some(Fired { case: 2, outcome: Outcome::Transferred }),
        );
        assert_eq!(counter.0.load(SeqCst), 1);
    }

    #[test]
    fn withdrawing_does_not_wake_owner() {
        let counter = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let token = Token::new(&waker);

        drop(token.claim(0, Outcome::Withdrawn).unwrap());
        assert!(token.is_fired());
        assert_eq!(counter.0.load(SeqCst), 0);
    }

    #[test]
    fn slot_hand_off() {
        let slot = Slot::empty();
        assert!(slot.take().is_none());
        slot.put("x");
        assert_eq!(slot.take(), Some("x"));
        assert_eq!(Slot::holding(5).take(), Some(5));
    }
}
