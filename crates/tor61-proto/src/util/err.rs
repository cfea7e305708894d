//! Define an error type for the tor61-proto crate.
use thiserror::Error;

use tor61_cell::{Agent, CircId};

/// An error type for the tor61-proto crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the cell-handling layer.
    #[error("cell encoding error: {0}")]
    CellErr(#[from] tor61_cell::Error),
    /// An error that occurred from the io system.
    #[error("io error: {0}")]
    IoErr(#[from] std::io::Error),
    /// The peer didn't answer our `open` in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// One side of the handshake refused the other.
    #[error("handshake with {0} rejected")]
    HandshakeRejected(Agent),
    /// Protocol violation at the channel level
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// Channel is closed.
    #[error("channel closed")]
    ChannelClosed,
    /// We were asked to send on a circuit that has no outgoing mapping.
    ///
    /// This is always a routing bug on our side.
    #[error("no outgoing circuit mapped for circuit {0}")]
    UnmappedCircuit(CircId),
    /// Can't allocate any more circuit IDs on a channel.
    #[error("too many entries in map: can't allocate ID")]
    IdRangeFull,
    /// Our channel provider couldn't give us a channel to the next hop.
    #[error("couldn't get a channel: {0}")]
    ChanFailed(String),
    /// There was a programming error somewhere in the code.
    #[error("Internal programming error: {0}")]
    InternalError(String),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::InternalError("thread failed while holding lock".into())
    }
}
