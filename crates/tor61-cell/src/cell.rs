//! Identifiers, command codes, and the decoded form of a cell.
//!
//! The wire layout is big-endian throughout:
//!
//! ```text
//! control:  circ_id:2 | cmd:1 | zero padding to 512
//! open:     0:2 | cmd:1 | opener:4 | opened:4 | zero padding to 512
//! relay:    circ_id:2 | cmd:1 | stream_id:2 | 0:2 | 0:4 | body_len:2
//!           | relay_cmd:1 | body | zero padding to a multiple of 512
//! ```

use crate::raw::RawCell;
use crate::relay::RelayCell;
use crate::{Error, Result};

use bytes::{Buf, BufMut, BytesMut};
use caret::caret_int;

use std::fmt::{self, Display, Formatter};

/// The length of one cell segment.  Every cell is a multiple of this.
pub const CELL_LEN: usize = 512;

/// The length of a relay cell's header, before its body starts.
pub const RELAY_HEADER_LEN: usize = 14;

/// The largest relay body that still fits in a single segment.
pub const RELAY_BODY_LEN: usize = CELL_LEN - RELAY_HEADER_LEN;

/// The largest relay body that the 16-bit length field can describe.
pub const MAX_RELAY_BODY_LEN: usize = u16::MAX as usize;

/// Return the total encoded length of a relay cell whose body is
/// `body_len` bytes long.
pub fn relay_cell_len(body_len: usize) -> usize {
    let used = RELAY_HEADER_LEN + body_len;
    let segments = (used + CELL_LEN - 1) / CELL_LEN;
    segments.max(1) * CELL_LEN
}

/// Connection-local identifier for a circuit.
///
/// Circuit IDs are only meaningful for one connection in one
/// direction; a cell that crosses a router gets renumbered.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord, Default)]
pub struct CircId(u16);

impl From<u16> for CircId {
    fn from(item: u16) -> Self {
        Self(item)
    }
}
impl From<CircId> for u16 {
    fn from(id: CircId) -> u16 {
        id.0
    }
}
impl Display for CircId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl CircId {
    /// Return true if this is the zero CircId.
    ///
    /// Zero is never allocated to a real circuit.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Circuit-local identifier for a stream.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(u16);

impl From<u16> for StreamId {
    fn from(item: u16) -> Self {
        Self(item)
    }
}
impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0
    }
}
impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl StreamId {
    /// Return true if this is the zero StreamId, which is used by
    /// relay cells that concern the circuit as a whole.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// The numeric identity of a router.
///
/// An agent packs a 16-bit group number in its high half and a
/// 16-bit instance number in its low half.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct Agent(u32);

impl Agent {
    /// Construct an agent from its group and instance numbers.
    pub fn new(group: u16, instance: u16) -> Self {
        Agent((u32::from(group) << 16) | u32::from(instance))
    }
    /// Return the group half of this agent.
    pub fn group(&self) -> u16 {
        (self.0 >> 16) as u16
    }
    /// Return the instance half of this agent.
    pub fn instance(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl From<u32> for Agent {
    fn from(item: u32) -> Self {
        Self(item)
    }
}
impl From<Agent> for u32 {
    fn from(agent: Agent) -> u32 {
        agent.0
    }
}
impl Display for Agent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

caret_int! {
    /// A CellCmd is the type of a cell.
    pub struct CellCmd(u8) {
        /// Create a new circuit
        CREATE = 1,
        /// Acknowledge a CREATE
        CREATED = 2,
        /// Relay cell, transmitted over a circuit.
        RELAY = 3,
        /// Tear down a circuit
        DESTROY = 4,
        /// Open a connection between two routers
        OPEN = 5,
        /// Accept an OPEN
        OPENED = 6,
        /// Refuse an OPEN
        OPEN_FAILED = 7,
        /// Refuse a CREATE
        CREATE_FAILED = 8,
    }
}

impl CellCmd {
    /// Return true if this command belongs to the connection handshake,
    /// and so carries agents instead of a circuit ID.
    pub fn is_open_family(self) -> bool {
        self == CellCmd::OPEN || self == CellCmd::OPENED || self == CellCmd::OPEN_FAILED
    }
}

/// A decoded cell.
///
/// Cells are built fresh for every send, and then encoded into a
/// [`RawCell`] with [`Cell::encode`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Cell {
    /// Ask the peer to accept a connection from `opener`.
    Open {
        /// The agent that is opening the connection.
        opener: Agent,
        /// The agent that the opener expects to reach.
        opened: Agent,
    },
    /// Accept an [`Cell::Open`].
    Opened {
        /// The agent that opened the connection.
        opener: Agent,
        /// The agent that accepted it.
        opened: Agent,
    },
    /// Refuse an [`Cell::Open`].
    OpenFailed {
        /// The agent that tried to open the connection.
        opener: Agent,
        /// The agent that refused it.
        opened: Agent,
    },
    /// Start a circuit.
    Create(CircId),
    /// Acknowledge a create.
    Created(CircId),
    /// Refuse a create.
    CreateFailed(CircId),
    /// Tear a circuit down.
    Destroy(CircId),
    /// Relay traffic on a circuit.
    Relay(RelayCell),
}

impl Cell {
    /// Return the command for this cell.
    pub fn cmd(&self) -> CellCmd {
        match self {
            Cell::Open { .. } => CellCmd::OPEN,
            Cell::Opened { .. } => CellCmd::OPENED,
            Cell::OpenFailed { .. } => CellCmd::OPEN_FAILED,
            Cell::Create(_) => CellCmd::CREATE,
            Cell::Created(_) => CellCmd::CREATED,
            Cell::CreateFailed(_) => CellCmd::CREATE_FAILED,
            Cell::Destroy(_) => CellCmd::DESTROY,
            Cell::Relay(_) => CellCmd::RELAY,
        }
    }

    /// Return the circuit ID for this cell, if it has one.
    pub fn circ_id(&self) -> Option<CircId> {
        match self {
            Cell::Open { .. } | Cell::Opened { .. } | Cell::OpenFailed { .. } => None,
            Cell::Create(id) | Cell::Created(id) | Cell::CreateFailed(id) | Cell::Destroy(id) => {
                Some(*id)
            }
            Cell::Relay(r) => Some(r.circ_id()),
        }
    }

    /// Encode this cell into its wire form.
    ///
    /// Fails only for relay cells whose body is too long.
    pub fn encode(&self) -> Result<RawCell> {
        let mut buf = BytesMut::with_capacity(CELL_LEN);
        match self {
            Cell::Open { opener, opened }
            | Cell::Opened { opener, opened }
            | Cell::OpenFailed { opener, opened } => {
                buf.put_u16(0);
                buf.put_u8(self.cmd().into());
                buf.put_u32((*opener).into());
                buf.put_u32((*opened).into());
            }
            Cell::Create(id) | Cell::Created(id) | Cell::CreateFailed(id) | Cell::Destroy(id) => {
                buf.put_u16((*id).into());
                buf.put_u8(self.cmd().into());
            }
            Cell::Relay(r) => r.write_onto(&mut buf)?,
        }
        let total = match self {
            Cell::Relay(r) => relay_cell_len(r.body().len()),
            _ => CELL_LEN,
        };
        buf.resize(total, 0);
        Ok(RawCell::from_framed(buf))
    }

    /// Decode a cell from `b`.
    ///
    /// `b` must hold exactly one cell, as a [`FrameReader`](crate::FrameReader)
    /// would deliver it.
    pub fn decode(b: &[u8]) -> Result<Cell> {
        if b.len() < CELL_LEN || b.len() % CELL_LEN != 0 {
            return Err(Error::BadLength(b.len()));
        }
        let cmd: CellCmd = b[2].into();
        if cmd == CellCmd::RELAY {
            return Ok(Cell::Relay(RelayCell::decode(b)?));
        }
        if b.len() != CELL_LEN {
            return Err(Error::BadLength(b.len()));
        }
        let mut r = b;
        let circ_id: CircId = r.get_u16().into();
        r.advance(1);
        let cell = match cmd {
            CellCmd::OPEN | CellCmd::OPENED | CellCmd::OPEN_FAILED => {
                let opener = r.get_u32().into();
                let opened = r.get_u32().into();
                match cmd {
                    CellCmd::OPEN => Cell::Open { opener, opened },
                    CellCmd::OPENED => Cell::Opened { opener, opened },
                    _ => Cell::OpenFailed { opener, opened },
                }
            }
            CellCmd::CREATE => Cell::Create(circ_id),
            CellCmd::CREATED => Cell::Created(circ_id),
            CellCmd::CREATE_FAILED => Cell::CreateFailed(circ_id),
            CellCmd::DESTROY => Cell::Destroy(circ_id),
            _ => return Err(Error::UnknownCommand(cmd)),
        };
        Ok(cell)
    }
}

impl From<RelayCell> for Cell {
    fn from(r: RelayCell) -> Cell {
        Cell::Relay(r)
    }
}

/// How much of a relay body to show when displaying a cell.
const DISPLAY_BODY_LIMIT: usize = 100;

impl Display for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.circ_id() {
            Some(id) => write!(f, "circ 0x{:x}", u16::from(id))?,
            None => write!(f, "no circ")?,
        }
        write!(f, " {}", self.cmd())?;
        match self {
            Cell::Open { opener, opened }
            | Cell::Opened { opener, opened }
            | Cell::OpenFailed { opener, opened } => {
                write!(f, " opener={} opened={}", opener, opened)
            }
            Cell::Relay(r) => {
                write!(
                    f,
                    " stream 0x{:x} {} len={}",
                    u16::from(r.stream_id()),
                    r.cmd(),
                    r.body().len()
                )?;
                if !r.body().is_empty() {
                    let shown = &r.body()[..r.body().len().min(DISPLAY_BODY_LIMIT)];
                    write!(f, " body={:?}", String::from_utf8_lossy(shown))?;
                    if r.body().len() > DISPLAY_BODY_LIMIT {
                        write!(f, "...")?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
