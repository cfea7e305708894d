//! Implementation for parsing and encoding relay cells

use crate::cell::{relay_cell_len, Agent, CellCmd, CircId, StreamId, CELL_LEN, MAX_RELAY_BODY_LEN};
use crate::{Error, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caret::caret_int;

caret_int! {
    /// A command that identifies the type of a relay cell
    pub struct RelayCmd(u8) {
        /// Start a new stream
        BEGIN = 1,
        /// Data on a stream
        DATA = 2,
        /// Close a stream
        END = 3,
        /// Acknowledge a BEGIN; stream is open
        CONNECTED = 4,
        /// Extend a circuit to a new hop
        EXTEND = 6,
        /// Reply to EXTEND
        EXTENDED = 7,
        /// Refuse a BEGIN
        BEGIN_FAILED = 11,
        /// Refuse an EXTEND
        EXTEND_FAILED = 12,
    }
}

/// A relay cell: a message addressed to a stream (or, for circuit
/// management, to stream zero) within a circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayCell {
    /// The circuit this cell travels on.
    circ_id: CircId,
    /// The stream this cell is addressed to.
    stream_id: StreamId,
    /// What kind of relay message this is.
    cmd: RelayCmd,
    /// The body of the message.
    body: Bytes,
}

impl RelayCell {
    /// Construct a new relay cell.
    pub fn new<B: Into<Bytes>>(circ_id: CircId, stream_id: StreamId, cmd: RelayCmd, body: B) -> Self {
        RelayCell {
            circ_id,
            stream_id,
            cmd,
            body: body.into(),
        }
    }

    /// Construct a relay cell with an empty body.
    pub fn empty(circ_id: CircId, stream_id: StreamId, cmd: RelayCmd) -> Self {
        Self::new(circ_id, stream_id, cmd, Bytes::new())
    }

    /// Return the circuit ID of this cell.
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }
    /// Return the stream ID of this cell.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
    /// Return the relay command of this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.cmd
    }
    /// Return the body of this cell.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
    /// Consume this cell and return its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Write the header and body of this cell onto `buf`.  The caller
    /// is responsible for padding.
    pub(crate) fn write_onto(&self, buf: &mut BytesMut) -> Result<()> {
        if self.body.len() > MAX_RELAY_BODY_LEN {
            return Err(Error::BodyTooLong(self.body.len()));
        }
        buf.reserve(relay_cell_len(self.body.len()));
        buf.put_u16(self.circ_id.into());
        buf.put_u8(CellCmd::RELAY.into());
        buf.put_u16(self.stream_id.into());
        // padding, then four reserved bytes.
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u16(self.body.len() as u16);
        buf.put_u8(self.cmd.into());
        buf.put_slice(&self.body[..]);
        Ok(())
    }

    /// Decode a relay cell from `b`, which must hold the whole cell.
    pub(crate) fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < CELL_LEN {
            return Err(Error::Truncated {
                needed: CELL_LEN,
                got: b.len(),
            });
        }
        let mut r = b;
        let circ_id = r.get_u16().into();
        let cmd: CellCmd = r.get_u8().into();
        if cmd != CellCmd::RELAY {
            return Err(Error::BadMessage("not a relay cell"));
        }
        let stream_id = r.get_u16().into();
        r.advance(6);
        let body_len = r.get_u16() as usize;
        let relay_cmd = r.get_u8().into();
        let total = relay_cell_len(body_len);
        if b.len() < total {
            return Err(Error::Truncated {
                needed: total,
                got: b.len(),
            });
        }
        if b.len() > total {
            return Err(Error::BadLength(b.len()));
        }
        let body = Bytes::copy_from_slice(&r[..body_len]);
        Ok(RelayCell {
            circ_id,
            stream_id,
            cmd: relay_cmd,
            body,
        })
    }
}

/// The target of a `begin` or `extend` cell.
///
/// On the wire this is `"host:port\0"`, followed, for `extend`, by the
/// four-byte agent of the router we want to reach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayTarget {
    /// Hostname or address to connect to.
    host: String,
    /// Port to connect to.
    port: u16,
    /// For extends: the agent we expect to find at `host:port`.
    agent: Option<Agent>,
}

impl RelayTarget {
    /// Make a target for a `begin` cell.
    pub fn stream(host: impl Into<String>, port: u16) -> Self {
        RelayTarget {
            host: host.into(),
            port,
            agent: None,
        }
    }
    /// Make a target for an `extend` cell.
    pub fn router(host: impl Into<String>, port: u16, agent: Agent) -> Self {
        RelayTarget {
            host: host.into(),
            port,
            agent: Some(agent),
        }
    }
    /// Return the host of this target.
    pub fn host(&self) -> &str {
        &self.host[..]
    }
    /// Return the port of this target.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Return the agent of this target, if it is a router.
    pub fn agent(&self) -> Option<Agent> {
        self.agent
    }

    /// Encode this target as a relay body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.host.len() + 11);
        buf.put_slice(self.host.as_bytes());
        buf.put_slice(format!(":{}", self.port).as_bytes());
        buf.put_u8(0);
        if let Some(agent) = self.agent {
            buf.put_u32(agent.into());
        }
        buf.freeze()
    }

    /// Split a `host:port\0` prefix off a relay body.  Return the host,
    /// the port text, and whatever followed the terminator.
    fn split_body(body: &[u8]) -> Result<(&str, &str, &[u8])> {
        let nul = body
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::BadMessage("target not NUL-terminated"))?;
        let text = std::str::from_utf8(&body[..nul])
            .map_err(|_| Error::BadMessage("target is not UTF-8"))?;
        let colon = text
            .rfind(':')
            .ok_or(Error::BadMessage("target has no port"))?;
        Ok((&text[..colon], &text[colon + 1..], &body[nul + 1..]))
    }

    /// Parse the body of a `begin` cell.
    ///
    /// A port that is not a decimal number from 0 to 65535 is an error.
    pub fn parse_begin(body: &[u8]) -> Result<Self> {
        let (host, port, _) = Self::split_body(body)?;
        let port = port
            .parse()
            .map_err(|_| Error::BadMessage("bad port in target"))?;
        Ok(Self::stream(host, port))
    }

    /// Parse the body of an `extend` cell.
    pub fn parse_extend(body: &[u8]) -> Result<Self> {
        let (host, port, mut rest) = Self::split_body(body)?;
        let port = port
            .parse()
            .map_err(|_| Error::BadMessage("bad port in target"))?;
        if rest.len() < 4 {
            return Err(Error::BadMessage("extend target has no agent"));
        }
        let agent = rest.get_u32().into();
        Ok(Self::router(host, port, agent))
    }
}
