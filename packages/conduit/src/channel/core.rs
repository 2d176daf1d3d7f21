// minimal safe API for the channel. the exposed API is a convenience wrapper around this.

use super::token::{lock, Outcome, Slot, Token, Waiter};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};


// handle to a channel.
pub(crate) struct Channel<T>(Arc<Shared<T>>);

// channel shared state.
struct Shared<T> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T>>,
    // maximum number of buffered elements. 0 means every transfer is a direct hand-off.
    capacity: usize,
}

// channel lockable state.
pub(crate) struct Lockable<T> {
    // buffered elements. never longer than capacity.
    elems: VecDeque<T>,
    capacity: usize,
    // once true, never becomes false again. both waiter queues are emptied when it becomes true
    // and nothing is ever parked afterwards.
    closed: bool,
    // parked senders, each slot holding the element to be sent.
    send_waiters: VecDeque<Waiter<Arc<Slot<T>>>>,
    // parked receivers. they are only ever notified, and take elements themselves once they retry.
    recv_waiters: VecDeque<Waiter>,
}

// result of trying to send without blocking.
pub(crate) enum TrySend<T> {
    Sent,
    Full(T),
    Closed(T),
}

// result of trying to receive without blocking.
pub(crate) enum TryRecv<T> {
    Received(T),
    Empty,
    Closed,
}

impl<T> Channel<T> {
    // construct an open, empty channel.
    pub(crate) fn new(capacity: usize) -> Self {
        Channel(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                elems: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            }),
            capacity,
        }))
    }

    // clone another handle to the channel.
    pub(crate) fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.capacity
    }

    // lock the channel.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Lockable<T>> {
        lock(&self.0.lockable)
    }
}

impl<T> Lockable<T> {
    pub(crate) fn len(&self) -> usize {
        self.elems.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    // whether a send would complete without parking. sending into a closed channel counts, since
    // it completes immediately, albeit by failing.
    //
    // parked receivers don't count: an element only counts as sent once it is buffered or a
    // receiver has actually taken it.
    pub(crate) fn can_send(&self) -> bool {
        self.closed || self.elems.len() < self.capacity
    }

    // whether a recv would complete without parking.
    //
    // waiters belonging to `me` are ignored, so that a select never matches against itself.
    pub(crate) fn can_recv(&self, me: Option<&Token>) -> bool {
        !self.elems.is_empty() || self.closed || has_live(&self.send_waiters, me)
    }

    // try to send an element without parking.
    pub(crate) fn try_send(&mut self, elem: T) -> TrySend<T> {
        if self.closed {
            TrySend::Closed(elem)
        } else if self.elems.len() < self.capacity {
            self.elems.push_back(elem);
            self.notify_receiver(None);
            TrySend::Sent
        } else {
            TrySend::Full(elem)
        }
    }

    // try to receive an element without parking.
    pub(crate) fn try_recv(&mut self) -> TryRecv<T> {
        if let Some(elem) = self.elems.pop_front() {
            // room was made, so admit the longest-parked sender into the buffer
            if let Some(next) = self.take_from_sender() {
                self.elems.push_back(next);
            }
            return TryRecv::Received(elem);
        }

        // buffer empty. this is the only path for rendezvous channels
        if let Some(elem) = self.take_from_sender() {
            return TryRecv::Received(elem);
        }

        if self.closed {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    // park a sender, and notify a receiver that it can take the element. the slot must hold the
    // element.
    pub(crate) fn park_sender(&mut self, waiter: Waiter<Arc<Slot<T>>>) {
        debug_assert!(!self.closed, "parked sender on closed channel (internal bug)");
        let token = Arc::clone(&waiter.token);
        self.send_waiters.push_back(waiter);
        self.notify_receiver(Some(&token));
    }

    // park a receiver.
    pub(crate) fn park_receiver(&mut self, waiter: Waiter) {
        debug_assert!(!self.closed, "parked receiver on closed channel (internal bug)");
        self.recv_waiters.push_back(waiter);
    }

    // remove all waiters belonging to the token.
    pub(crate) fn unpark(&mut self, token: &Token) {
        self.send_waiters.retain(|waiter| !waiter.belongs_to(token));
        self.recv_waiters.retain(|waiter| !waiter.belongs_to(token));
    }

    // called when a receiver which was notified is dropped before retrying. if the element it was
    // notified about may still be there, notify the next receiver in its place.
    pub(crate) fn pass_on(&mut self) {
        if !self.elems.is_empty() || has_live(&self.send_waiters, None) {
            self.notify_receiver(None);
        }
    }

    // close the channel. returns false if it was already closed.
    //
    // fires every parked operation with Outcome::Closed. parked senders keep their element in
    // their slot.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        for waiter in self.recv_waiters.drain(..) {
            drop(waiter.token.claim(waiter.case, Outcome::Closed));
        }
        for waiter in self.send_waiters.drain(..) {
            drop(waiter.token.claim(waiter.case, Outcome::Closed));
        }
        true
    }

    // notify the longest-parked live receiver not belonging to `me`, if any. stale waiters passed
    // over on the way are discarded.
    fn notify_receiver(&mut self, me: Option<&Token>) {
        let mut i = 0;
        while i < self.recv_waiters.len() {
            if me.is_some_and(|me| self.recv_waiters[i].belongs_to(me)) {
                i += 1;
                continue;
            }
            let Some(waiter) = self.recv_waiters.remove(i) else { break };
            if waiter.token.claim(waiter.case, Outcome::Notified).is_some() {
                return;
            }
        }
    }

    // take the element of the longest-parked live sender, if any, completing its send.
    fn take_from_sender(&mut self) -> Option<T> {
        while let Some(waiter) = self.send_waiters.pop_front() {
            if let Some(claim) = waiter.token.claim(waiter.case, Outcome::Transferred) {
                let elem = waiter.slot.take();
                drop(claim);
                if elem.is_some() {
                    return elem;
                }
            }
        }
        None
    }
}

// whether the queue contains a waiter which could currently be fired by a counterpart.
fn has_live<S>(waiters: &VecDeque<Waiter<S>>, me: Option<&Token>) -> bool {
    waiters.iter()
        .filter(|waiter| !me.is_some_and(|me| waiter.belongs_to(me)))
        .any(|waiter| !waiter.token.is_fired())
}


// ==== single-channel operations ====


// send operation. elem is moved into the channel's send queue if it can't complete immediately.
pub(crate) struct Send<T> {
    channel: Channel<T>,
    state: SendState<T>,
}

enum SendState<T> {
    // not yet polled. none once rescinded.
    Init(Option<T>),
    // parked in the channel, the slot holding the element.
    Parked { token: Arc<Token>, slot: Arc<Slot<T>> },
    // resolved or withdrawn.
    Terminated,
}

impl<T> Send<T> {
    pub(crate) fn new(channel: Channel<T>, elem: T) -> Self {
        Send { channel, state: SendState::Init(Some(elem)) }
    }

    // poll the operation.
    //
    // - resolves to ok upon successfully sending.
    // - resolves to err with the element if the channel is or becomes closed.
    //
    // panics if already terminated.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Result<(), T>> {
        match std::mem::replace(&mut self.state, SendState::Terminated) {
            SendState::Init(Some(elem)) => {
                let mut lock = self.channel.lock();
                match lock.try_send(elem) {
                    TrySend::Sent => Poll::Ready(Ok(())),
                    TrySend::Closed(elem) => Poll::Ready(Err(elem)),
                    TrySend::Full(elem) => {
                        let token = Token::new(cx.waker());
                        let slot = Slot::holding(elem);
                        lock.park_sender(Waiter {
                            token: Arc::clone(&token),
                            case: 0,
                            slot: Arc::clone(&slot),
                        });
                        self.state = SendState::Parked { token, slot };
                        Poll::Pending
                    }
                }
            }
            SendState::Parked { token, slot } => match token.poll_fired(cx.waker()) {
                None => {
                    self.state = SendState::Parked { token, slot };
                    Poll::Pending
                }
                Some(fired) => match fired.outcome {
                    Outcome::Transferred => Poll::Ready(Ok(())),
                    Outcome::Closed => match slot.take() {
                        Some(elem) => Poll::Ready(Err(elem)),
                        None => unreachable!("closed sender lost its element (internal bug)"),
                    },
                    Outcome::Notified | Outcome::Withdrawn =>
                        unreachable!("send fired with {:?} (internal bug)", fired.outcome),
                },
            },
            SendState::Init(None) | SendState::Terminated =>
                panic!("send future polled after already resolved or rescinded"),
        }
    }

    // if not already resolved or withdrawn, withdraw the operation and return the element.
    pub(crate) fn cancel(&mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, SendState::Terminated) {
            SendState::Init(elem) => elem,
            SendState::Parked { token, slot } => {
                let mut lock = self.channel.lock();
                drop(token.claim(0, Outcome::Withdrawn));
                lock.unpark(&token);
                drop(lock);
                // empty if a receiver already took it. still present if withdrawn or closed.
                slot.take()
            }
            SendState::Terminated => None,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, SendState::Terminated)
    }
}

// recv operation.
pub(crate) struct Recv<T> {
    channel: Channel<T>,
    state: RecvState,
}

enum RecvState {
    // not yet polled, or woken and due to retry.
    Init,
    // parked in the channel.
    Parked(Arc<Token>),
    // resolved or withdrawn.
    Terminated,
}

impl<T> Recv<T> {
    pub(crate) fn new(channel: Channel<T>) -> Self {
        Recv { channel, state: RecvState::Init }
    }

    // poll the operation. resolves to none once the channel is closed and drained.
    //
    // panics if already terminated.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Poll<Option<T>> {
        loop {
            match std::mem::replace(&mut self.state, RecvState::Terminated) {
                RecvState::Init => {
                    let mut lock = self.channel.lock();
                    return match lock.try_recv() {
                        TryRecv::Received(elem) => Poll::Ready(Some(elem)),
                        TryRecv::Closed => Poll::Ready(None),
                        TryRecv::Empty => {
                            let token = Token::new(cx.waker());
                            lock.park_receiver(Waiter {
                                token: Arc::clone(&token),
                                case: 0,
                                slot: (),
                            });
                            self.state = RecvState::Parked(token);
                            Poll::Pending
                        }
                    };
                }
                RecvState::Parked(token) => match token.poll_fired(cx.waker()) {
                    None => {
                        self.state = RecvState::Parked(token);
                        return Poll::Pending;
                    }
                    // either way, retrying tells whether there is an element. a closed channel
                    // may still have buffered elements.
                    Some(fired) if fired.outcome != Outcome::Withdrawn => {
                        self.state = RecvState::Init;
                    }
                    Some(_) => unreachable!("withdrawn recv polled (internal bug)"),
                },
                RecvState::Terminated =>
                    panic!("recv future polled after already resolved or aborted"),
            }
        }
    }

    // if not already resolved, withdraw the operation. if it was notified but never retried, pass
    // the notification on to another receiver.
    pub(crate) fn cancel(&mut self) {
        if let RecvState::Parked(token) = std::mem::replace(&mut self.state, RecvState::Terminated) {
            let mut lock = self.channel.lock();
            let withdrawn = token.claim(0, Outcome::Withdrawn).is_some();
            lock.unpark(&token);
            if !withdrawn && token.fired().is_some_and(|fired| fired.outcome == Outcome::Notified) {
                lock.pass_on();
            }
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, RecvState::Terminated)
    }
}
