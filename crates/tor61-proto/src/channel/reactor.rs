//! Code to handle incoming and outgoing cells on a channel
//!
//! The reactor owns both halves of the channel's stream.  It writes the
//! cells that the routing tables queue, and hands every cell it reads to
//! [`Channel::dispatch`], strictly in arrival order.

use super::handshake::OpenedStream;
use super::io::{write_cell, CellReader};
use super::Channel;
use crate::Result;
use tor61_cell::RawCell;

use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

use std::sync::Arc;

/// Object to handle incoming and outgoing cells on a channel.
///
/// This type is returned when you finish a channel; you need to spawn a
/// new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the channel won't work."]
pub struct Reactor<S> {
    /// The channel we're running for.
    channel: Arc<Channel>,
    /// Cells from the network.
    reader: CellReader<ReadHalf<S>>,
    /// Where we write cells to the network.
    writer: WriteHalf<S>,
    /// Cells that the routing tables want us to send.
    outbound: mpsc::UnboundedReceiver<RawCell>,
    /// A oneshot that fires when the channel is told to close.
    closeflag: oneshot::Receiver<()>,
}

impl<S> Reactor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Construct a new Reactor.
    pub(super) fn new(
        channel: Arc<Channel>,
        opened: OpenedStream<S>,
        outbound: mpsc::UnboundedReceiver<RawCell>,
        closeflag: oneshot::Receiver<()>,
    ) -> Self {
        Reactor {
            channel,
            reader: opened.reader,
            writer: opened.writer,
            outbound,
            closeflag,
        }
    }

    /// Launch the reactor, and run until the channel closes or we
    /// encounter an error.
    ///
    /// Whatever the reason for stopping, the channel's cleanup hook runs
    /// before this returns.
    pub async fn run(mut self) -> Result<()> {
        let unique_id = self.channel.unique_id();
        trace!("{}: running reactor", unique_id);
        let result = self.run_once().await;
        self.channel.shutdown();
        // The peer may already be gone.
        let _ = self.writer.shutdown().await;
        match &result {
            Ok(()) => debug!("{}: reactor finished", unique_id),
            Err(e) => debug!("{}: reactor stopped: {}", unique_id, e),
        }
        result
    }

    /// Helper for run(): move cells until something ends the channel.
    async fn run_once(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = &mut self.closeflag => return Ok(()), // we were asked to close
                cell = self.outbound.next() => match cell {
                    Some(cell) => write_cell(&mut self.writer, &cell).await?,
                    None => return Ok(()),
                },
                cell = self.reader.next_cell() => match cell? {
                    Some(cell) => self.channel.dispatch(cell),
                    None => return Ok(()), // the stream closed.
                },
            }
        }
    }
}
