//! Define an error type for the tor61-cell crate.
use thiserror::Error;

use crate::cell::CellCmd;

/// An error that occurred while encoding or decoding a cell.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The buffer ended before the cell did.
    #[error("cell truncated: needed {needed} bytes, got {got}")]
    Truncated {
        /// How many bytes the cell's header says it occupies.
        needed: usize,
        /// How many bytes we actually had.
        got: usize,
    },
    /// The buffer was not a whole number of 512-byte segments, or was
    /// longer than its header says.
    #[error("bad cell length {0}")]
    BadLength(usize),
    /// We found a command byte that isn't part of the protocol.
    #[error("unrecognized cell command {0}")]
    UnknownCommand(CellCmd),
    /// The cell was well-framed, but one of its fields made no sense.
    #[error("bad message: {0}")]
    BadMessage(&'static str),
    /// A relay body was too long to encode in a 16-bit length field.
    #[error("relay body of {0} bytes is too long")]
    BodyTooLong(usize),
}
