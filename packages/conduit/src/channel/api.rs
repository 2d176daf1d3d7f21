// exposed API of conduits

use self::future::*;
use super::{
    error::*,
    core::{self, TryRecv, TrySend},
};


// ==== helper functions for adapting core API to exposed API ====


// message for the panic upon sending into a closed conduit.
pub(crate) const SEND_ON_CLOSED: &str = "send on closed conduit";

// message for the panic upon closing a closed conduit.
const CLOSE_OF_CLOSED: &str = "close of closed conduit";

fn try_send<T>(channel: &core::Channel<T>, msg: T) -> Result<(), TrySendError<T>> {
    match channel.lock().try_send(msg) {
        TrySend::Sent => Ok(()),
        TrySend::Full(msg) => Err(TrySendError::Full(msg)),
        TrySend::Closed(msg) => Err(TrySendError::Closed(msg)),
    }
}

fn try_recv<T>(channel: &core::Channel<T>) -> Result<T, TryRecvError> {
    match channel.lock().try_recv() {
        TryRecv::Received(msg) => Ok(msg),
        TryRecv::Empty => Err(TryRecvError::Empty),
        TryRecv::Closed => Err(TryRecvError::Closed),
    }
}

// close the channel, or panic if already closed. the lock is released before panicking so the
// channel stays usable by other handles.
fn close<T>(channel: &core::Channel<T>) {
    let newly_closed = channel.lock().close();
    if !newly_closed {
        panic!("{}", CLOSE_OF_CLOSED);
    }
    trace!(capacity = channel.capacity(), "conduit closed");
}

fn is_closed<T>(channel: &core::Channel<T>) -> bool {
    channel.lock().is_closed()
}

fn len<T>(channel: &core::Channel<T>) -> usize {
    channel.lock().len()
}

// crate-internal access to a handle's channel.
pub(crate) trait HasChannel<T> {
    fn channel(&self) -> &core::Channel<T>;
}

mod sealed {
    pub trait Sealed {}
}

/// Handle which can send into a conduit: [`Conduit`] or [`Sender`]
///
/// Sealed. Used to restrict which handles may be given to [`Select::send`](crate::Select::send).
#[allow(private_bounds)]
pub trait CanSend<T>: sealed::Sealed + HasChannel<T> {}

/// Handle which can receive from a conduit: [`Conduit`] or [`Receiver`]
///
/// Sealed. Used to restrict which handles may be given to [`Select::recv`](crate::Select::recv).
#[allow(private_bounds)]
pub trait CanRecv<T>: sealed::Sealed + HasChannel<T> {}


// ==== the exposed API ====


/// Create a conduit with the given capacity
///
/// Shorthand for [`Conduit::new`].
pub fn conduit<T>(capacity: usize) -> Conduit<T> {
    Conduit::new(capacity)
}

/// Bounded, closable, multi-producer multi-consumer conduit for transferring messages between tasks
///
/// A conduit with capacity `n > 0` buffers up to `n` messages, and sending only blocks while the
/// buffer is full. A conduit with capacity 0 buffers nothing: each send blocks until a receiver
/// takes the message directly, so [`try_send`](Self::try_send) on it never succeeds.
///
/// Handles are reference-counted and cheap to clone. Dropping handles never closes the conduit;
/// that only happens by calling [`close`](Self::close), which may be done exactly once. After a
/// conduit is closed, messages already buffered can still be received, after which receiving
/// resolves to `None`. Sending into a closed conduit is a bug in the caller and panics.
///
/// Messages sent by one task are received in the order they were sent. Blocked senders and
/// receivers are served in the order they started blocking.
///
/// [`send_only`](Self::send_only) and [`recv_only`](Self::recv_only) narrow a handle to only
/// the operations of one direction.
pub struct Conduit<T>(core::Channel<T>);

impl<T> Conduit<T> {
    /// Create an open conduit with the given capacity
    pub fn new(capacity: usize) -> Self {
        Conduit(core::Channel::new(capacity))
    }

    /// Create a future to send a message into this conduit
    ///
    /// See [`SendFut`], which can also be driven on the current thread with
    /// [`block`](SendFut::block).
    pub fn send(&self, msg: T) -> SendFut<T> {
        SendFut(core::Send::new(self.0.clone(), msg))
    }

    /// Create a future to receive a message from this conduit
    ///
    /// See [`RecvFut`], which can also be driven on the current thread with
    /// [`block`](RecvFut::block).
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut(core::Recv::new(self.0.clone()))
    }

    /// Try to send a message without blocking
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        try_send(&self.0, msg)
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        try_recv(&self.0)
    }

    /// Close this conduit
    ///
    /// Blocked receivers wake up and, once buffered messages are drained, receive `None`. Blocked
    /// senders wake up and panic.
    ///
    /// # Panics
    ///
    /// If the conduit has already been closed.
    pub fn close(&self) {
        close(&self.0)
    }

    /// Whether this conduit has been closed
    pub fn is_closed(&self) -> bool {
        is_closed(&self.0)
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        len(&self.0)
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }

    /// Create a send-only handle to this conduit
    pub fn send_only(&self) -> Sender<T> {
        Sender(self.0.clone())
    }

    /// Create a receive-only handle to this conduit
    pub fn recv_only(&self) -> Receiver<T> {
        Receiver(self.0.clone())
    }

    /// Blocking iterator over received messages, which ends once the conduit is closed and drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter(&self.0)
    }
}

impl<T> Clone for Conduit<T> {
    fn clone(&self) -> Self {
        Conduit(self.0.clone())
    }
}

impl<T> std::fmt::Debug for Conduit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        debug_handle("Conduit", &self.0, f)
    }
}

impl<T> From<Conduit<T>> for Sender<T> {
    fn from(conduit: Conduit<T>) -> Self {
        Sender(conduit.0)
    }
}

impl<T> From<Conduit<T>> for Receiver<T> {
    fn from(conduit: Conduit<T>) -> Self {
        Receiver(conduit.0)
    }
}


/// Send-only handle to a [`Conduit`]
///
/// The sending side may close the conduit, the receiving side may not.
pub struct Sender<T>(core::Channel<T>);

impl<T> Sender<T> {
    /// Create a future to send a message into the conduit
    pub fn send(&self, msg: T) -> SendFut<T> {
        SendFut(core::Send::new(self.0.clone(), msg))
    }

    /// Try to send a message without blocking
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        try_send(&self.0, msg)
    }

    /// Close the conduit
    ///
    /// # Panics
    ///
    /// If the conduit has already been closed.
    pub fn close(&self) {
        close(&self.0)
    }

    /// Whether the conduit has been closed
    pub fn is_closed(&self) -> bool {
        is_closed(&self.0)
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        len(&self.0)
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        debug_handle("Sender", &self.0, f)
    }
}


/// Receive-only handle to a [`Conduit`]
pub struct Receiver<T>(core::Channel<T>);

impl<T> Receiver<T> {
    /// Create a future to receive a message from the conduit
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut(core::Recv::new(self.0.clone()))
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        try_recv(&self.0)
    }

    /// Blocking iterator over received messages, which ends once the conduit is closed and drained
    pub fn iter(&self) -> Iter<'_, T> {
        Iter(&self.0)
    }

    /// Whether the conduit has been closed
    ///
    /// Messages may still be buffered even if this returns true.
    pub fn is_closed(&self) -> bool {
        is_closed(&self.0)
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        len(&self.0)
    }

    /// Whether no messages are currently buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered messages
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver(self.0.clone())
    }
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        debug_handle("Receiver", &self.0, f)
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

fn debug_handle<T>(
    name: &str,
    channel: &core::Channel<T>,
    f: &mut std::fmt::Formatter,
) -> std::fmt::Result {
    let lock = channel.lock();
    f.debug_struct(name)
        .field("capacity", &channel.capacity())
        .field("len", &lock.len())
        .field("closed", &lock.is_closed())
        .finish()
}


/// Blocking iterator over messages received from a conduit
///
/// Each call to `next` blocks the current thread until a message arrives, and returns `None` once
/// the conduit is closed and drained.
pub struct Iter<'a, T>(&'a core::Channel<T>);

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        RecvFut(core::Recv::new(self.0.clone())).block()
    }
}


impl<T> sealed::Sealed for Conduit<T> {}
impl<T> sealed::Sealed for Sender<T> {}
impl<T> sealed::Sealed for Receiver<T> {}

impl<T> HasChannel<T> for Conduit<T> {
    fn channel(&self) -> &core::Channel<T> {
        &self.0
    }
}

impl<T> HasChannel<T> for Sender<T> {
    fn channel(&self) -> &core::Channel<T> {
        &self.0
    }
}

impl<T> HasChannel<T> for Receiver<T> {
    fn channel(&self) -> &core::Channel<T> {
        &self.0
    }
}

impl<T> CanSend<T> for Conduit<T> {}
impl<T> CanSend<T> for Sender<T> {}
impl<T> CanRecv<T> for Conduit<T> {}
impl<T> CanRecv<T> for Receiver<T> {}


// future types for conduits.
pub(crate) mod future {
    use super::*;
    use crate::channel::polling::block_on;
    use std::{
        task::{Poll, Context},
        future::Future,
        pin::Pin,
    };

    /// Future for sending into a conduit
    ///
    /// The message is not sent until this future resolves. Dropping it before then withdraws the
    /// message, as does [`rescind`](Self::rescind).
    ///
    /// # Panics
    ///
    /// Polling panics if the conduit is closed, or becomes closed while this future is waiting.
    /// Use [`try_send`](Conduit::try_send) to detect closure without panicking.
    pub struct SendFut<T>(pub(super) core::Send<T>);

    // the message is never pinned.
    impl<T> Unpin for SendFut<T> {}

    fn map_send_result<T>(result: Result<(), T>) {
        if let Err(msg) = result {
            // drop the message first, so a panicking destructor can't turn this into an abort
            drop(msg);
            panic!("{}", SEND_ON_CLOSED);
        }
    }

    impl<T> Future for SendFut<T> {
        type Output = ();

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.0.poll(cx).map(map_send_result)
        }
    }

    impl<T> SendFut<T> {
        /// Block the current thread until this future resolves
        ///
        /// # Panics
        ///
        /// If the conduit is or becomes closed, or if this future has already resolved or
        /// rescinded.
        pub fn block(mut self) {
            assert!(!self.is_terminated(), "SendFut.block called after terminated");
            map_send_result(block_on(&mut PollSend(&mut self.0)))
        }

        /// If the message has not yet been sent, abort the send operation and take the message back
        pub fn rescind(&mut self) -> Option<T> {
            self.0.cancel()
        }

        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for SendFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for SendFut<T> {
        fn drop(&mut self) {
            // withdraw from the conduit's queue if still parked there
            drop(self.0.cancel());
        }
    }

    // adapts the core send op to a future which reports closure rather than panicking.
    struct PollSend<'a, T>(&'a mut core::Send<T>);

    impl<'a, T> Future for PollSend<'a, T> {
        type Output = Result<(), T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), T>> {
            self.get_mut().0.poll(cx)
        }
    }


    /// Future for receiving from a conduit
    ///
    /// Resolves to `Some` with a message, or to `None` once the conduit is closed and all buffered
    /// messages have been received.
    ///
    /// Dropping this future before it resolves aborts the receive. A message is only taken out of
    /// the conduit while this future is being polled, so dropping it never loses one.
    pub struct RecvFut<T>(pub(super) core::Recv<T>);

    impl<T> Unpin for RecvFut<T> {}

    impl<T> Future for RecvFut<T> {
        type Output = Option<T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.is_terminated() {
                return Poll::Pending;
            }
            this.0.poll(cx)
        }
    }

    impl<T> RecvFut<T> {
        /// Block the current thread until this future resolves
        ///
        /// # Panics
        ///
        /// If this future has already resolved.
        pub fn block(mut self) -> Option<T> {
            assert!(!self.is_terminated(), "RecvFut.block called after terminated");
            block_on(&mut self)
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.0.is_terminated()
        }
    }

    #[cfg(feature = "futures")]
    impl<T> futures::future::FusedFuture for RecvFut<T> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<T> Drop for RecvFut<T> {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }
}


// ==== tests ====
