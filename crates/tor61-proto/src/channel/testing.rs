//! Helpers for testing channels against scripted peers.

pub(crate) use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::io::{write_cell, CellReader};
use super::{
    accept_inbound, connect_outbound, Channel, ChannelConfig, ChannelContext, ChannelProvider,
    Reactor, Response, UniqId,
};
use crate::exit::{ExitConnector, ExitStream};
use crate::{Error, Result};
use tor61_cell::{Agent, Cell};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

use std::io;
use std::sync::{Arc, Mutex, Weak};

/// Return a test agent in group 1.
pub(crate) fn agent(instance: u16) -> Agent {
    Agent::new(1, instance)
}

/// Return a context for `me`, with exits that never connect.
pub(crate) fn context(me: Agent) -> ChannelContext {
    ChannelContext::new(me, ChannelConfig::default(), FakeExits::new().0)
}

/// Wait for the next response on a handler's queue.
pub(crate) async fn next_response(rx: &mut mpsc::UnboundedReceiver<Response>) -> Response {
    rx.next().await.expect("handler dropped")
}

/// The far end of a channel, driven by hand.
pub(crate) struct RawPeer {
    /// Cells from the channel under test.
    reader: CellReader<ReadHalf<DuplexStream>>,
    /// Where we write cells to it.
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    /// Wrap one end of a duplex stream.
    fn new(s: DuplexStream) -> Self {
        let (r, writer) = split(s);
        RawPeer {
            reader: CellReader::new(r),
            writer,
        }
    }

    /// Send a cell to the channel under test.
    pub(crate) async fn send(&mut self, cell: Cell) {
        write_cell(&mut self.writer, &cell.encode().unwrap())
            .await
            .unwrap();
    }

    /// Receive the next cell from the channel under test.
    pub(crate) async fn recv(&mut self) -> Cell {
        let cell = self.reader.next_cell().await.unwrap().expect("closed");
        cell.decode().unwrap()
    }
}

/// Open a channel from `me` to a scripted `peer`.
pub(crate) async fn outbound_to_raw(
    me: Agent,
    peer: Agent,
) -> (Arc<Channel>, Reactor<DuplexStream>, RawPeer) {
    outbound_to_raw_with(me, peer, None, FakeExits::new().0).await
}

/// Open a channel from `me` to a scripted `peer`, with a given
/// provider and exit connector.
pub(crate) async fn outbound_to_raw_with(
    me: Agent,
    peer: Agent,
    provider: Option<Weak<dyn ChannelProvider>>,
    exits: Arc<dyn ExitConnector>,
) -> (Arc<Channel>, Reactor<DuplexStream>, RawPeer) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let mut ctx = ChannelContext::new(me, ChannelConfig::default(), exits);
    if let Some(p) = provider {
        ctx = ctx.with_provider(p);
    }
    let mut raw = RawPeer::new(b);
    let answer = async {
        let open = raw.recv().await;
        assert_eq!(
            open,
            Cell::Open {
                opener: me,
                opened: peer
            }
        );
        raw.send(Cell::Opened {
            opener: me,
            opened: peer,
        })
        .await;
    };
    let (r, ()) = tokio::join!(connect_outbound(a, peer, &ctx), answer);
    let (chan, reactor) = r.unwrap();
    (chan, reactor, raw)
}

/// Accept a channel at `me` from a scripted `peer`.
pub(crate) async fn inbound_from_raw(
    me: Agent,
    peer: Agent,
    provider: Option<Weak<dyn ChannelProvider>>,
) -> (Arc<Channel>, Reactor<DuplexStream>, RawPeer) {
    inbound_from_raw_with(me, peer, provider, FakeExits::new().0).await
}

/// Accept a channel at `me` from a scripted `peer`, with a given exit
/// connector.
pub(crate) async fn inbound_from_raw_with(
    me: Agent,
    peer: Agent,
    provider: Option<Weak<dyn ChannelProvider>>,
    exits: Arc<dyn ExitConnector>,
) -> (Arc<Channel>, Reactor<DuplexStream>, RawPeer) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let mut ctx = ChannelContext::new(me, ChannelConfig::default(), exits);
    if let Some(p) = provider {
        ctx = ctx.with_provider(p);
    }
    let mut raw = RawPeer::new(b);
    raw.send(Cell::Open {
        opener: peer,
        opened: me,
    })
    .await;
    let (chan, reactor) = accept_inbound(a, &ctx, |_| false).await.unwrap();
    assert_eq!(
        raw.recv().await,
        Cell::Opened {
            opener: peer,
            opened: me
        }
    );
    (chan, reactor, raw)
}

/// An exit connector that hands the far end of every connection to
/// the test.  Connections to the host `unreachable` fail.
pub(crate) struct FakeExits {
    /// Where accepted connections go.
    tx: mpsc::UnboundedSender<(String, u16, DuplexStream)>,
}

/// The test's side of a [`FakeExits`].
pub(crate) struct ExitAccepts {
    /// Accepted connections.
    rx: mpsc::UnboundedReceiver<(String, u16, DuplexStream)>,
}

impl FakeExits {
    /// Make a new connector, and the queue its connections arrive on.
    pub(crate) fn new() -> (Arc<FakeExits>, ExitAccepts) {
        let (tx, rx) = mpsc::unbounded();
        (Arc::new(FakeExits { tx }), ExitAccepts { rx })
    }
}

#[async_trait]
impl ExitConnector for FakeExits {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn ExitStream>> {
        if host == "unreachable" {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (near, far) = tokio::io::duplex(1 << 20);
        // The test may not care about this connection.
        let _ = self.tx.unbounded_send((host.to_string(), port, far));
        Ok(Box::new(near))
    }
}

impl ExitAccepts {
    /// Wait for the next connection.
    pub(crate) async fn next_exit(&mut self) -> (String, u16, DuplexStream) {
        self.rx.next().await.expect("connector dropped")
    }
}

/// A channel provider that always hands out the same channel, once it
/// has one.
#[derive(Default)]
pub(crate) struct OneChannelProvider {
    /// The channel to hand out.
    chan: Mutex<Option<Arc<Channel>>>,
    /// Every request we've had.
    asked: Mutex<Vec<(Agent, String, u16)>>,
    /// Every channel that has told us it closed.
    closed: Mutex<Vec<UniqId>>,
}

impl OneChannelProvider {
    /// Make a new provider with no channel.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the channel to hand out.
    pub(crate) fn set(&self, chan: Arc<Channel>) {
        *self.chan.lock().unwrap() = Some(chan);
    }

    /// Return every request we've had.
    pub(crate) fn asked(&self) -> Vec<(Agent, String, u16)> {
        self.asked.lock().unwrap().clone()
    }

    /// Return every channel that has closed.
    pub(crate) fn closed(&self) -> Vec<UniqId> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelProvider for OneChannelProvider {
    async fn get_or_launch(&self, agent: Agent, host: &str, port: u16) -> Result<Arc<Channel>> {
        self.asked
            .lock()
            .unwrap()
            .push((agent, host.to_string(), port));
        self.chan
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::ChanFailed("no channel yet".into()))
    }

    fn channel_closed(&self, channel: &Channel) {
        self.closed.lock().unwrap().push(channel.unique_id());
    }
}
