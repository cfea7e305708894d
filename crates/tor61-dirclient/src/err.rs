//! Declare dirclient-specific errors.

use thiserror::Error;

/// An error originating from the tor61-dirclient crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// We couldn't talk to the registration service.
    #[error("I/O error talking to registration service: {0}")]
    Io(#[from] std::io::Error),
    /// The registration service didn't answer in time.
    #[error("registration service timed out")]
    Timeout,
    /// The registration service sent something we couldn't understand.
    #[error("bad message from registration service: {0}")]
    BadMessage(&'static str),
    /// The registration service answered with the wrong kind of message.
    #[error("unexpected {0} message from registration service")]
    Unexpected(crate::proto::RegCmd),
    /// A request was too big to encode.
    #[error("request field too long: {0}")]
    TooLong(&'static str),
    /// The address of the registration service was unusable.
    #[error("bad registration service address: {0}")]
    BadAddress(String),
    /// We gave up on reaching the directory at startup.
    #[error("couldn't reach the router directory after {0} attempts")]
    BootstrapFailed(u32),
}
