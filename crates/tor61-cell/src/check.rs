//! Helpers to validate the consistency, type, and contents of cells.
//!
//! These are best-effort checks, used on handshake and extension
//! replies to notice a peer that is confused or talking about some
//! other circuit.

use crate::cell::{Agent, Cell, CellCmd, CircId, StreamId, CELL_LEN};
use crate::raw::RawCell;
use crate::relay::{RelayCell, RelayCmd};

/// Return true if `cell` is a single-segment open-family cell with
/// command `cmd`, naming `opener` and `opened`.
pub fn is_open_cell(cell: &RawCell, cmd: CellCmd, opener: Agent, opened: Agent) -> bool {
    cell.len() == CELL_LEN
        && cell.cmd() == cmd
        && open_agents(cell) == Some((opener, opened))
}

/// Return the (opener, opened) agents from an open-family cell.
pub fn open_agents(cell: &RawCell) -> Option<(Agent, Agent)> {
    match cell.decode() {
        Ok(Cell::Open { opener, opened })
        | Ok(Cell::Opened { opener, opened })
        | Ok(Cell::OpenFailed { opener, opened }) => Some((opener, opened)),
        _ => None,
    }
}

/// Return true if `cell` is a single-segment `created` for `circ_id`.
pub fn is_created(cell: &RawCell, circ_id: CircId) -> bool {
    cell.len() == CELL_LEN && cell.cmd() == CellCmd::CREATED && cell.circ_id() == circ_id
}

/// Return true if `cell` is an empty relay cell with command `cmd` on
/// `circ_id` and `stream_id`, with clean padding.
pub fn is_empty_relay(cell: &RawCell, circ_id: CircId, stream_id: StreamId, cmd: RelayCmd) -> bool {
    cell.len() % CELL_LEN == 0
        && cell.is_relay()
        && cell.circ_id() == circ_id
        && cell.stream_id() == Some(stream_id)
        && cell.relay_padding() == Some(0)
        && cell.body_len() == Some(0)
        && cell.relay_cmd() == Some(cmd)
}

/// Return true if `cell` is a `connected` reply for the given stream.
pub fn is_connected(cell: &RawCell, circ_id: CircId, stream_id: StreamId) -> bool {
    is_empty_relay(cell, circ_id, stream_id, RelayCmd::CONNECTED)
}

/// Return true if `cell` is an `extended` reply on the given circuit.
pub fn is_extended(cell: &RawCell, circ_id: CircId) -> bool {
    is_empty_relay(cell, circ_id, StreamId::default(), RelayCmd::EXTENDED)
}

/// Return true if every byte after the meaningful part of `cell` is zero.
pub fn has_zero_padding(cell: &RawCell) -> bool {
    let used = match cell.body_len() {
        Some(len) => crate::cell::RELAY_HEADER_LEN + len,
        None if cell.cmd().is_open_family() => 11,
        None => 3,
    };
    cell.as_bytes().iter().skip(used).all(|b| *b == 0)
}

/// Return true if sending `cell` obliges the peer to answer it.
///
/// Only `create` and relay `extend` get a reply that the sender waits
/// for; everything else is fire-and-forget as far as the sender's
/// circuit slot is concerned.
pub fn expects_reply(cell: &RawCell) -> bool {
    match cell.cmd() {
        CellCmd::CREATE => true,
        CellCmd::RELAY => cell.relay_cmd() == Some(RelayCmd::EXTEND),
        _ => false,
    }
}

/// Construct the failure that a peer would send in reply to `request`.
///
/// This is what a router reports locally when it refuses to put a
/// request on the wire.
pub fn matching_failure(request: &RawCell) -> Cell {
    let circ_id = request.circ_id();
    match (request.cmd(), request.relay_cmd()) {
        (CellCmd::CREATE, _) => Cell::CreateFailed(circ_id),
        (_, Some(RelayCmd::BEGIN)) => Cell::Relay(RelayCell::empty(
            circ_id,
            request.stream_id().unwrap_or_default(),
            RelayCmd::BEGIN_FAILED,
        )),
        (_, Some(RelayCmd::EXTEND)) => Cell::Relay(RelayCell::empty(
            circ_id,
            StreamId::default(),
            RelayCmd::EXTEND_FAILED,
        )),
        _ => Cell::Destroy(circ_id),
    }
}
