//! Declare error types for tor61-circmgr

use tor61_cell::Agent;

use thiserror::Error;

/// An error returned while building a circuit or using its streams.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// We gave up building the circuit.
    #[error("Gave up building circuit after {attempts} attempts")]
    RetriesExhausted {
        /// How many hops we tried to add since the circuit was last
        /// complete.
        attempts: u32,
        /// Why each of them failed, oldest first.
        failures: Vec<BuildFailure>,
    },

    /// The circuit has been closed, and can't be used any more.
    #[error("Circuit closed")]
    CircuitClosed,

    /// The stream has been closed, and can't be used any more.
    #[error("Stream closed")]
    StreamClosed,

    /// Tried to open a stream to a target we can't name in a `begin`.
    #[error("Bad stream target: {0}")]
    BadTarget(String),

    /// Every stream ID on the circuit is in use.
    #[error("Too many streams on circuit")]
    TooManyStreams,

    /// We couldn't encode a cell.
    #[error("Couldn't encode cell: {0}")]
    Cell(#[from] tor61_cell::Error),

    /// A channel refused to send a cell for us.
    #[error("Problem sending on circuit: {0}")]
    Protocol(#[from] tor61_proto::Error),
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Error {
        Error::CircuitClosed
    }
}

/// One failed attempt to add a hop to a circuit.
///
/// Each of these gets the router involved added to the circuit's
/// invalid list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildFailure {
    /// We couldn't get a channel to the first hop.
    #[error("couldn't connect to {0}: {1}")]
    Connect(Agent, String),
    /// The first hop refused to create the circuit.
    #[error("{0} refused to create a circuit")]
    CreateFailed(Agent),
    /// The last hop couldn't extend the circuit to the router.
    #[error("couldn't extend circuit to {0}")]
    ExtendFailed(Agent),
    /// The circuit went away, or timed out, while we were adding the
    /// router.
    #[error("circuit ended while adding {0}")]
    Ended(Agent),
}

impl BuildFailure {
    /// Return the router that this failure is blamed on.
    pub fn router(&self) -> Agent {
        match self {
            BuildFailure::Connect(a, _)
            | BuildFailure::CreateFailed(a)
            | BuildFailure::ExtendFailed(a)
            | BuildFailure::Ended(a) => *a,
        }
    }
}
