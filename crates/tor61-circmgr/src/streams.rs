//! Types and code for the streams multiplexed over our circuit.
//!
//! A stream is primed when it is created, and its `begin` cell is
//! computed up front.  Once the circuit is complete, the `begin` goes
//! out and the stream waits for `connected`; after that, whatever the
//! user queued is sent in order.  Every queued cell carries the current
//! circuit ID, and is renumbered when the circuit is rebuilt.

use crate::{Error, Result};
use tor61_cell::cell::MAX_RELAY_BODY_LEN;
use tor61_cell::{Cell, CircId, RawCell, RelayCell, RelayCmd, RelayTarget, StreamId};

use bytes::Bytes;
use futures::channel::mpsc;

use std::collections::{BTreeMap, VecDeque};

/// Where a stream is in its life.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamStatus {
    /// The `begin` has not been sent on the current circuit.
    Primed,
    /// The `begin` was sent; we're waiting for `connected`.
    Waiting,
    /// The stream is connected.
    Ready,
    /// The stream is connected, and an `end` is queued behind whatever
    /// is left to send.
    Ending,
    /// The stream is gone.
    Closed,
}

/// Something that happened on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamEvent {
    /// The exit connected to the destination.
    ///
    /// This can happen more than once, if the circuit is rebuilt.
    Connected,
    /// The destination sent us some bytes.
    Data(Bytes),
    /// The stream is closed; nothing more will happen on it.
    Closed,
}

/// Encode a relay cell for a stream.
pub(crate) fn stream_cell(circ: CircId, id: StreamId, cmd: RelayCmd, body: Bytes) -> Result<RawCell> {
    Ok(Cell::Relay(RelayCell::new(circ, id, cmd, body)).encode()?)
}

/// The circuit's view of one stream.
pub(crate) struct StreamEnt {
    /// Where the stream is in its life.
    status: StreamStatus,
    /// The `begin` cell that opens this stream.
    begin: RawCell,
    /// Cells waiting to be sent once the stream is connected.
    queue: VecDeque<RawCell>,
    /// True once an `end` has been queued.
    end_queued: bool,
    /// Where we tell the user what happened.
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEnt {
    /// Return the status of this stream.
    pub(crate) fn status(&self) -> StreamStatus {
        self.status
    }

    /// Return true if a `data` cell on this stream should be delivered.
    pub(crate) fn accepts_data(&self) -> bool {
        matches!(self.status, StreamStatus::Ready | StreamStatus::Ending)
    }

    /// Tell the user about `event`.
    ///
    /// Returns false if nobody is listening any more.
    pub(crate) fn emit(&self, event: StreamEvent) -> bool {
        self.events.unbounded_send(event).is_ok()
    }

    /// Queue `data`, split into as many `data` cells as it takes.
    ///
    /// Fails once an `end` has been queued.
    pub(crate) fn queue_data(&mut self, circ: CircId, id: StreamId, mut data: Bytes) -> Result<()> {
        if self.end_queued {
            return Err(Error::StreamClosed);
        }
        while !data.is_empty() {
            let n = std::cmp::min(data.len(), MAX_RELAY_BODY_LEN);
            let chunk = data.split_to(n);
            self.queue
                .push_back(stream_cell(circ, id, RelayCmd::DATA, chunk)?);
        }
        Ok(())
    }

    /// Queue an `end` behind whatever is already queued.
    pub(crate) fn queue_end(&mut self, circ: CircId, id: StreamId) -> Result<()> {
        if self.end_queued {
            return Ok(());
        }
        self.queue
            .push_back(stream_cell(circ, id, RelayCmd::END, Bytes::new())?);
        self.end_queued = true;
        if self.status == StreamStatus::Ready {
            self.status = StreamStatus::Ending;
        }
        Ok(())
    }

    /// Note that the exit answered our `begin`.
    ///
    /// Returns false if we weren't waiting for that.
    pub(crate) fn note_connected(&mut self) -> bool {
        if self.status != StreamStatus::Waiting {
            return false;
        }
        self.status = if self.end_queued {
            StreamStatus::Ending
        } else {
            StreamStatus::Ready
        };
        true
    }

    /// Return true if the `begin` for this stream went out on the
    /// current circuit.
    pub(crate) fn has_begun(&self) -> bool {
        !matches!(self.status, StreamStatus::Primed | StreamStatus::Closed)
    }

    /// Send whatever this stream is allowed to send, in order, with
    /// `send`.  `send` returns false if the cell couldn't be sent, which
    /// leaves it at the head of the queue.
    ///
    /// Returns true if the stream has sent its `end`, and is finished.
    pub(crate) fn flush<F>(&mut self, mut send: F) -> bool
    where
        F: FnMut(&RawCell) -> bool,
    {
        match self.status {
            StreamStatus::Primed => {
                if send(&self.begin) {
                    self.status = StreamStatus::Waiting;
                }
                false
            }
            StreamStatus::Waiting | StreamStatus::Closed => false,
            StreamStatus::Ready | StreamStatus::Ending => {
                while let Some(cell) = self.queue.front() {
                    if !send(cell) {
                        return false;
                    }
                    self.queue.pop_front();
                }
                self.status == StreamStatus::Ending
            }
        }
    }

    /// Forget that the `begin` was sent, and label everything for the
    /// circuit `circ`.
    fn reset(&mut self, circ: CircId) {
        self.status = StreamStatus::Primed;
        self.begin.set_circ_id(circ);
        for cell in self.queue.iter_mut() {
            cell.set_circ_id(circ);
        }
    }
}

/// The set of streams on our circuit.
pub(crate) struct StreamMap {
    /// Map from stream ID to stream.  If there is no entry for an ID,
    /// that stream doesn't exist.
    streams: BTreeMap<StreamId, StreamEnt>,
    /// The next stream ID to try.  (0 is not a valid stream ID.)
    next_id: u16,
}

impl StreamMap {
    /// Make a new empty StreamMap.
    pub(crate) fn new() -> Self {
        StreamMap {
            streams: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Add a new primed stream to `target`, labelled for circuit `circ`,
    /// and return its ID.
    pub(crate) fn add(
        &mut self,
        circ: CircId,
        target: &RelayTarget,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<StreamId> {
        let id = self.alloc_id()?;
        let begin = stream_cell(circ, id, RelayCmd::BEGIN, target.encode())?;
        self.streams.insert(
            id,
            StreamEnt {
                status: StreamStatus::Primed,
                begin,
                queue: VecDeque::new(),
                end_queued: false,
                events,
            },
        );
        Ok(id)
    }

    /// Find a stream ID that isn't in use.
    fn alloc_id(&mut self) -> Result<StreamId> {
        for _ in 0..=u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id == 0 {
                continue;
            }
            let id = StreamId::from(id);
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::TooManyStreams)
    }

    /// Return the stream `id`, if it exists.
    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamEnt> {
        self.streams.get_mut(&id)
    }

    /// Remove the stream `id`, and tell its user it's closed.
    ///
    /// Returns the stream if it existed.
    pub(crate) fn close(&mut self, id: StreamId) -> Option<StreamEnt> {
        let mut ent = self.streams.remove(&id)?;
        ent.status = StreamStatus::Closed;
        // The user may have stopped listening; that's fine.
        let _ = ent.emit(StreamEvent::Closed);
        Some(ent)
    }

    /// Close every stream.
    pub(crate) fn close_all(&mut self) {
        for id in self.ids() {
            self.close(id);
        }
    }

    /// Return the ID of every stream, in order.
    pub(crate) fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Return the status of every stream, in order.
    pub(crate) fn statuses(&self) -> Vec<(StreamId, StreamStatus)> {
        self.streams
            .iter()
            .map(|(id, ent)| (*id, ent.status))
            .collect()
    }

    /// Put every stream back to primed, labelled for the circuit `circ`.
    pub(crate) fn reset_all(&mut self, circ: CircId) {
        for ent in self.streams.values_mut() {
            ent.reset(circ);
        }
    }

    /// Return the number of streams.
    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}
