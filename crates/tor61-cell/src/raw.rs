//! Encoded cells that can be inspected and renumbered in place.
//!
//! Routers forward most cells without decoding them: they read the
//! circuit ID, swap it for the ID used on the next connection, and
//! write the same bytes out again.  [`RawCell`] supports exactly that.

use crate::cell::{Cell, CellCmd, CircId, StreamId, CELL_LEN, RELAY_HEADER_LEN};
use crate::relay::RelayCmd;
use crate::Result;

use bytes::{Bytes, BytesMut};

use std::fmt::{self, Display, Formatter};

/// A cell in its wire form.
///
/// A RawCell always holds at least [`CELL_LEN`] bytes; its accessors
/// never panic.
#[derive(Clone, PartialEq, Eq)]
pub struct RawCell(BytesMut);

impl RawCell {
    /// Wrap a buffer produced by encoding or framing.
    pub(crate) fn from_framed(buf: BytesMut) -> Self {
        debug_assert!(buf.len() >= CELL_LEN && buf.len() % CELL_LEN == 0);
        RawCell(buf)
    }

    /// Wrap an arbitrary buffer, checking only that its length is a
    /// whole number of segments.
    pub fn from_bytes(buf: BytesMut) -> Result<Self> {
        if buf.len() < CELL_LEN || buf.len() % CELL_LEN != 0 {
            return Err(crate::Error::BadLength(buf.len()));
        }
        Ok(RawCell(buf))
    }

    /// Return the total length of this cell.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Return true if this cell has no bytes.  (This never happens.)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the bytes of this cell.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// Consume this cell and return its bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0.freeze()
    }

    /// Return the command of this cell.
    pub fn cmd(&self) -> CellCmd {
        self.0[2].into()
    }

    /// Return the circuit ID field of this cell.
    ///
    /// For the open family this is always zero.
    pub fn circ_id(&self) -> CircId {
        u16::from_be_bytes([self.0[0], self.0[1]]).into()
    }

    /// Overwrite the circuit ID field of this cell.
    pub fn set_circ_id(&mut self, id: CircId) {
        let b = u16::from(id).to_be_bytes();
        self.0[0] = b[0];
        self.0[1] = b[1];
    }

    /// Return true if this is a relay cell.
    pub fn is_relay(&self) -> bool {
        self.cmd() == CellCmd::RELAY
    }

    /// Return the relay command of this cell, if it is a relay cell.
    pub fn relay_cmd(&self) -> Option<RelayCmd> {
        if self.is_relay() {
            Some(self.0[13].into())
        } else {
            None
        }
    }

    /// Return the stream ID of this cell, if it is a relay cell.
    pub fn stream_id(&self) -> Option<StreamId> {
        if self.is_relay() {
            Some(u16::from_be_bytes([self.0[3], self.0[4]]).into())
        } else {
            None
        }
    }

    /// Return the body length field of this cell, if it is a relay cell.
    pub fn body_len(&self) -> Option<usize> {
        if self.is_relay() {
            Some(u16::from_be_bytes([self.0[11], self.0[12]]) as usize)
        } else {
            None
        }
    }

    /// Return the body of this relay cell, clipped to the bytes that
    /// are actually present.
    pub fn relay_body(&self) -> Option<&[u8]> {
        let len = self.body_len()?;
        let end = (RELAY_HEADER_LEN + len).min(self.0.len());
        Some(&self.0[RELAY_HEADER_LEN..end])
    }

    /// Return the two padding bytes that follow a relay cell's stream ID.
    pub fn relay_padding(&self) -> Option<u16> {
        if self.is_relay() {
            Some(u16::from_be_bytes([self.0[5], self.0[6]]))
        } else {
            None
        }
    }

    /// Decode this cell.
    pub fn decode(&self) -> Result<Cell> {
        Cell::decode(self.as_bytes())
    }
}

impl std::fmt::Debug for RawCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCell")
            .field("circ_id", &self.circ_id())
            .field("cmd", &self.cmd())
            .field("relay_cmd", &self.relay_cmd())
            .field("len", &self.len())
            .finish()
    }
}

impl Display for RawCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(cell) => Display::fmt(&cell, f),
            Err(e) => write!(f, "circ 0x{:x} {} ({})", u16::from(self.circ_id()), self.cmd(), e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relay::RelayCell;

    #[test]
    fn accessors() {
        let r = RelayCell::new(0x0102.into(), 0x0304.into(), RelayCmd::BEGIN, &b"a:1\0"[..]);
        let raw = Cell::Relay(r).encode().unwrap();
        assert_eq!(raw.circ_id(), CircId::from(0x0102));
        assert_eq!(raw.cmd(), CellCmd::RELAY);
        assert_eq!(raw.stream_id(), Some(StreamId::from(0x0304)));
        assert_eq!(raw.relay_cmd(), Some(RelayCmd::BEGIN));
        assert_eq!(raw.body_len(), Some(4));
        assert_eq!(raw.relay_body(), Some(&b"a:1\0"[..]));
        assert_eq!(raw.relay_padding(), Some(0));

        let raw = Cell::Destroy(7.into()).encode().unwrap();
        assert_eq!(raw.relay_cmd(), None);
        assert_eq!(raw.stream_id(), None);
        assert_eq!(raw.relay_body(), None);
    }

    #[test]
    fn rewrite_circ_id() {
        let r = RelayCell::new(5.into(), 1.into(), RelayCmd::DATA, &b"hello"[..]);
        let mut raw = Cell::Relay(r).encode().unwrap();
        let before = raw.clone();
        raw.set_circ_id(0xbeef.into());
        assert_eq!(raw.circ_id(), CircId::from(0xbeef));
        assert_eq!(&raw.as_bytes()[..2], &[0xbe, 0xef]);
        // Nothing else moved.
        assert_eq!(&raw.as_bytes()[2..], &before.as_bytes()[2..]);
        match raw.decode().unwrap() {
            Cell::Relay(r) => {
                assert_eq!(r.circ_id(), CircId::from(0xbeef));
                assert_eq!(&r.body()[..], b"hello");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn from_bytes() {
        assert!(RawCell::from_bytes(BytesMut::from(&[0_u8; 511][..])).is_err());
        assert!(RawCell::from_bytes(BytesMut::from(&[0_u8; 1024][..])).is_ok());
    }
}
