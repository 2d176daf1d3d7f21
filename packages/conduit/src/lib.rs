//! Bounded conduits, multi-way select, and a completion tracker, usable from both blocking and
//! async code.
//!
//! - A [`Conduit`] is a FIFO of capacity `n` shared by any number of senders and receivers. With
//!   capacity 0 every message is handed directly from a sender to a receiver. Closing a conduit
//!   lets receivers drain what is buffered and then observe the close; sending on a closed
//!   conduit is a usage error and panics.
//! - A [`Select`] waits on several send and receive cases at once and carries out exactly one of
//!   them, picking uniformly at random among those ready.
//! - A [`Tracker`] counts outstanding units of work and lets anyone wait for it to reach zero.
//! - A [`Pipeline`] combines the three into a generate-then-consume run which only finishes
//!   once every consumer has.
//!
//! Every operation which can wait returns a future, which can either be awaited or run to
//! completion on the current thread with its `block` method.

#[macro_use]
extern crate tracing;

mod channel;
mod select;
mod tracker;
mod timer;
mod spawn;
mod pipeline;

pub use crate::{
    channel::{
        api::*,
        error::{TryRecvError, TrySendError},
    },
    pipeline::{FanOut, Phase, Pipeline, PipelineConfig, Report},
    select::Select,
    spawn::{Spawn, ThreadSpawner, TokioSpawner},
    timer::after,
    tracker::{DoneGuard, Tracker, WaitFut},
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}

/// Future types
pub mod future {
    pub use crate::channel::api::future::*;
    pub use crate::tracker::WaitFut;
}
