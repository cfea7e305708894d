//! Coding and decoding for the cells that make up the Tor61 protocol
//!
//! A cell is a fixed-format binary record, sent between two routers
//! over a TCP connection.  Every cell is a whole number of 512-byte
//! segments long.  Control cells (`open`, `create`, `destroy`, and
//! friends) are always exactly one segment; relay cells carry a body
//! that can push them across several segments.
//!
//! This crate has three layers:
//!
//!   * [`cell`] declares the identifier types, the command codes, and
//!     the decoded [`Cell`] type.
//!   * [`raw`] holds [`RawCell`], an encoded cell that can be inspected
//!     and renumbered in place while it is routed between connections.
//!   * [`framing`] turns an ordered byte stream back into whole cells.
//!
//! There is no cryptography here: Tor61 cells travel unauthenticated
//! and unencrypted.

#![deny(missing_docs)]

pub mod cell;
pub mod check;
mod err;
pub mod framing;
pub mod raw;
pub mod relay;

pub use cell::{Agent, Cell, CellCmd, CircId, StreamId};
pub use err::Error;
pub use framing::FrameReader;
pub use raw::RawCell;
pub use relay::{RelayCell, RelayCmd, RelayTarget};

/// An error type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
