// channel error types.
//
// these are expected signals, not failures. contract violations (sending into or closing an
// already closed conduit) panic instead.

use thiserror::Error;


/// Error for trying to send into a conduit without blocking
///
/// Either variant gives the message back.
#[derive(Error, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TrySendError<T> {
    /// The conduit is open, but the send could not complete without blocking
    #[error("conduit is full")]
    Full(T),
    /// The conduit has been closed
    #[error("conduit is closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Take back the message that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(msg) | TrySendError::Closed(msg) => msg,
        }
    }

    /// Whether this error was caused by the conduit being full
    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }

    /// Whether this error was caused by the conduit being closed
    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

// hand-written so the message type doesn't need to be Debug.
impl<T> std::fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Error for trying to receive from a conduit without blocking
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TryRecvError {
    /// The conduit is open, but no message could be received without blocking
    #[error("conduit is empty")]
    Empty,
    /// The conduit has been closed and all buffered messages have been received
    #[error("conduit is closed and drained")]
    Closed,
}
