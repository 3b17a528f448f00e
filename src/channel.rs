//! Channel abstraction over the underlying implementation.
//!
//! The rest of the crate never names the channel crate directly: everything
//! goes through these aliases and constructors, so swapping the implementation
//! means touching only this file. The executor relies on two properties of the
//! implementation: rendezvous (zero capacity) channels for block I/O, and
//! multi-way selects that can mix receive and send operations
//! ([`Selector`]).

pub use flume::{RecvError, RecvTimeoutError, SendError, Selector, TryRecvError, TrySendError};

pub type Sender<T> = flume::Sender<T>;
pub type Receiver<T> = flume::Receiver<T>;

/// A channel with a fixed capacity. Senders block when the buffer is full.
pub fn bounded<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    flume::bounded(cap)
}

/// A rendezvous channel: every send blocks until a receiver takes the message.
///
/// Block inputs and interrupt channels are rendezvous so that delivery order
/// within a connection is the send order and a sender can always be unstuck by
/// the receiver going away.
pub fn rendezvous<T>() -> (Sender<T>, Receiver<T>) {
    flume::bounded(0)
}

/// A channel with unlimited capacity. Sends never block.
///
/// Used by the pub/sub fabric so that publishers are never throttled by slow
/// subscribers.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    flume::unbounded()
}
