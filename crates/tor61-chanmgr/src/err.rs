//! Declare error types for tor61-chanmgr

use std::sync::PoisonError;
use thiserror::Error;

/// An error returned by a channel manager.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A target was given for which no channel could be built.
    #[error("Target was unusable: {0}")]
    UnusableTarget(String),

    /// We were waiting on a pending channel, but it didn't succeed.
    #[error("Pending channel failed to launch")]
    PendingFailed,

    /// It took too long for us to establish this connection.
    #[error("Channel timed out")]
    ChanTimeout,

    /// A protocol error while making a channel
    #[error("Protocol error while opening a channel: {0}")]
    Proto(#[from] tor61_proto::Error),

    /// An I/O error while making a channel
    #[error("I/O error while opening a channel: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Error {
        Error::Internal("Thread failed while holding lock")
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::ChanTimeout
    }
}
