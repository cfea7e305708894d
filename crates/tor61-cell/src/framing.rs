//! Turn an ordered byte stream into whole cells.
//!
//! A [`FrameReader`] is fed chunks of bytes as they arrive, in any
//! sizes, and hands back complete cells in arrival order.  Complete
//! cells that nobody has asked for yet are kept, never dropped.  Use
//! a fresh reader for every connection.

use crate::cell::{relay_cell_len, CellCmd, CELL_LEN};
use crate::raw::RawCell;

use bytes::BytesMut;

use std::collections::VecDeque;

/// Return the length of the cell that starts with `header`, which
/// must be at least one segment long.
fn frame_len(header: &[u8]) -> usize {
    if CellCmd::from(header[2]) == CellCmd::RELAY {
        let body_len = u16::from_be_bytes([header[11], header[12]]) as usize;
        relay_cell_len(body_len)
    } else {
        CELL_LEN
    }
}

/// Incremental cell framer for one connection.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Bytes that don't yet make up a whole cell.
    partial: BytesMut,
    /// Whole cells that have not been taken yet.
    ready: VecDeque<RawCell>,
}

impl FrameReader {
    /// Construct a new, empty FrameReader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `chunk` to the end of the stream, and frame as many whole
    /// cells as are now available.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        while self.partial.len() >= CELL_LEN {
            let end = frame_len(&self.partial[..CELL_LEN]);
            if self.partial.len() < end {
                // A multi-segment cell that hasn't fully arrived.
                break;
            }
            let cell = self.partial.split_to(end);
            self.ready.push_back(RawCell::from_framed(cell));
        }
    }

    /// Take the oldest complete cell, if there is one.
    pub fn next_cell(&mut self) -> Option<RawCell> {
        self.ready.pop_front()
    }

    /// Take every complete cell, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = RawCell> + '_ {
        self.ready.drain(..)
    }

    /// Return the number of complete cells waiting to be taken.
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Return the number of bytes held toward an incomplete cell.
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }
}
