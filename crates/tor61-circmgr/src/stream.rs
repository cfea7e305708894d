//! Handles for the streams on a circuit.
//!
//! A [`DataStream`] is how the rest of the router uses one stream: it
//! can queue bytes, end the stream, or drop it, and it receives
//! [`StreamEvent`]s.  Events are buffered in the stream until they are
//! read, so nothing is lost if nobody is reading yet.

use crate::reactor::CtrlMsg;
use crate::streams::StreamEvent;
use crate::{Error, Result};
use tor61_cell::StreamId;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::StreamExt;

/// A stream over our circuit.
///
/// Use [`DataStream::split`] to read and write from different tasks.
pub struct DataStream {
    /// The reading half.
    reader: StreamReader,
    /// The writing half.
    writer: StreamWriter,
}

/// The reading half of a [`DataStream`].
pub struct StreamReader {
    /// The stream's ID.
    id: StreamId,
    /// Events from the circuit.
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// The writing half of a [`DataStream`].
#[derive(Clone)]
pub struct StreamWriter {
    /// The stream's ID.
    id: StreamId,
    /// Where we send requests for the circuit.
    control: mpsc::UnboundedSender<CtrlMsg>,
}

impl DataStream {
    /// Construct a new DataStream.
    pub(crate) fn new(
        id: StreamId,
        control: mpsc::UnboundedSender<CtrlMsg>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        DataStream {
            reader: StreamReader { id, events },
            writer: StreamWriter { id, control },
        }
    }

    /// Return the ID of this stream on the circuit.
    pub fn id(&self) -> StreamId {
        self.writer.id
    }

    /// Queue `data` to be sent to the destination.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.write(data)
    }

    /// Queue an `end`: once everything queued has been sent, the stream
    /// closes.
    pub fn end(&self) -> Result<()> {
        self.writer.end()
    }

    /// Close this stream right away, dropping anything still queued.
    pub fn close(self) -> Result<()> {
        self.writer.close()
    }

    /// Wait for the next thing that happens on this stream.
    ///
    /// Returns None once the stream is closed and every event has been
    /// read.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.reader.next_event().await
    }

    /// Divide this stream into a reader and a writer.
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl StreamReader {
    /// Return the ID of this stream on the circuit.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Wait for the next thing that happens on this stream.
    ///
    /// Returns None once the stream is closed and every event has been
    /// read.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.next().await
    }
}

impl StreamWriter {
    /// Return the ID of this stream on the circuit.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Send a request about this stream to the circuit.
    fn send(&self, msg: CtrlMsg) -> Result<()> {
        self.control
            .unbounded_send(msg)
            .map_err(|_| Error::CircuitClosed)
    }

    /// Queue `data` to be sent to the destination.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.send(CtrlMsg::Write(self.id, Bytes::copy_from_slice(data)))
    }

    /// Queue an `end`: once everything queued has been sent, the stream
    /// closes.
    pub fn end(&self) -> Result<()> {
        self.send(CtrlMsg::End(self.id))
    }

    /// Close this stream right away, dropping anything still queued.
    pub fn close(&self) -> Result<()> {
        self.send(CtrlMsg::Close(self.id))
    }
}
