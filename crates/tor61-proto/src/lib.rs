//! Channels, circuit correlation, and relaying for the Tor61 protocol
//!
//! A [`channel::Channel`] is an authenticated TCP connection between two
//! Tor61 routers.  Once its handshake is done, every channel carries two
//! routing tables:
//!
//!   * A [`channel::CircuitEndpoint`], for the circuits that *we* opened
//!     toward the peer.  It renumbers our cells onto the channel, matches
//!     the peer's answers back to whoever asked, and reports a failure
//!     when an answer never comes.
//!   * A relay router, for the circuits that the *peer* opened toward us.
//!     It either splices their relay cells onto another channel, or, when
//!     we are the last hop, turns them into TCP connections through an
//!     [`exit::ExitConnector`].
//!
//! Channels are normally created and cached by a channel manager; this
//! crate only knows how to run one once it has a byte stream.

#![deny(missing_docs)]

pub mod channel;
pub mod exit;
mod util;

pub use util::err::Error;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
