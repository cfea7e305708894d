//! Helper for unique identifiers for channels.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for allocating unique identifiers for channels.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a channel.
///
/// Used in log messages, and to tell apart the channels that send
/// through a shared [`CircuitEndpoint`](super::CircuitEndpoint).  Circuit
/// IDs can't do that job: every channel has its own circuit ID space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqId(u64);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        UniqId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chan {}", self.0)
    }
}
