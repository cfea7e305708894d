//! Exit streams: the TCP connections a last hop makes on behalf of a
//! circuit.
//!
//! A `begin` cell on a circuit that ends at this router asks us to
//! connect to `host:port`.  We open the connection through an
//! [`ExitConnector`], answer `connected` or `begin_failed`, and then move
//! bytes both ways until one side ends the stream.

use crate::channel::CellSender;
use tor61_cell::cell::MAX_RELAY_BODY_LEN;
use tor61_cell::{Cell, CircId, RelayCell, RelayCmd, RelayTarget, StreamId};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use std::io;

/// A byte stream that an exit connection can run over.
pub trait ExitStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ExitStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Something that can open connections to destinations on behalf of
/// circuits that end here.
#[async_trait]
pub trait ExitConnector: Send + Sync {
    /// Open a connection to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn ExitStream>>;
}

/// An [`ExitConnector`] that makes real TCP connections.
#[derive(Clone, Debug, Default)]
pub struct TcpExitConnector;

#[async_trait]
impl ExitConnector for TcpExitConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn ExitStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// A message from a circuit to one of its exit streams.
#[derive(Debug)]
pub(crate) enum ExitMsg {
    /// Bytes to write to the destination.
    Data(Bytes),
    /// The origin ended the stream.
    End,
}

/// Where an exit stream sends its cells, and how it labels them.
pub(crate) struct ExitReplies {
    /// The channel the circuit arrived on.
    pub(crate) sender: CellSender,
    /// The circuit, as numbered on that channel.
    pub(crate) circ_id: CircId,
    /// The stream within the circuit.
    pub(crate) stream_id: StreamId,
}

impl ExitReplies {
    /// Send a relay cell for this stream back toward the origin.
    ///
    /// Returns false if the channel has closed.
    fn send(&self, cmd: RelayCmd, body: Bytes) -> bool {
        let cell = RelayCell::new(self.circ_id, self.stream_id, cmd, body);
        self.sender.send(Cell::Relay(cell)).is_ok()
    }
}

/// Run one exit stream to completion.
///
/// `rx` carries what the origin sends on the stream; everything the
/// destination sends goes back through `replies`.
pub(crate) async fn run_exit(
    connector: std::sync::Arc<dyn ExitConnector>,
    target: RelayTarget,
    replies: ExitReplies,
    mut rx: mpsc::UnboundedReceiver<ExitMsg>,
) {
    let stream = match connector.connect(target.host(), target.port()).await {
        Ok(s) => s,
        Err(e) => {
            debug!(
                "Circuit {} stream {}: can't reach {}:{}: {}",
                replies.circ_id,
                replies.stream_id,
                target.host(),
                target.port(),
                e
            );
            replies.send(RelayCmd::BEGIN_FAILED, Bytes::new());
            return;
        }
    };
    trace!(
        "Circuit {} stream {}: connected to {}:{}",
        replies.circ_id,
        replies.stream_id,
        target.host(),
        target.port()
    );
    if !replies.send(RelayCmd::CONNECTED, Bytes::new()) {
        return;
    }

    let (mut r, mut w) = split(stream);
    let mut buf = vec![0_u8; MAX_RELAY_BODY_LEN];
    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(ExitMsg::Data(data)) => {
                    if let Err(e) = w.write_all(&data[..]).await {
                        debug!("Circuit {} stream {}: write failed: {}", replies.circ_id, replies.stream_id, e);
                        replies.send(RelayCmd::END, Bytes::new());
                        break;
                    }
                }
                Some(ExitMsg::End) | None => {
                    let _ = w.shutdown().await;
                    break;
                }
            },
            n = r.read(&mut buf[..]) => match n {
                Ok(0) | Err(_) => {
                    replies.send(RelayCmd::END, Bytes::new());
                    break;
                }
                Ok(n) => {
                    if !replies.send(RelayCmd::DATA, Bytes::copy_from_slice(&buf[..n])) {
                        break;
                    }
                }
            },
        }
    }
    trace!(
        "Circuit {} stream {}: exit stream closed",
        replies.circ_id,
        replies.stream_id
    );
}
