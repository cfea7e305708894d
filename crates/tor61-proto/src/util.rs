//! Utilities used for the Tor61 protocol.

pub(crate) mod err;
