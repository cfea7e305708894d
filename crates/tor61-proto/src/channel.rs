//! Talking directly (over a TCP connection) to another Tor61 router.
//!
//! A channel starts life as a byte stream.  To turn it into a
//! [`Channel`], run [`connect_outbound`] (if we opened the connection) or
//! [`accept_inbound`] (if the peer did).  Either one performs the
//! open/opened handshake and gives back the channel together with its
//! [`Reactor`], which you must spawn: the reactor is the only thing that
//! reads from or writes to the stream.
//!
//! Every cell that the reactor reads is handed to exactly one of the
//! channel's two routing tables, by circuit ID.  The side that opened the
//! channel allocates odd IDs and the other side even ones.  Cells on IDs
//! from our half go to the [`CircuitEndpoint`]; the rest go to the relay
//! router.
//!
//! When the stream closes for any reason, the channel runs its cleanup
//! hook once: it tells its [`ChannelProvider`] to forget it, and reports
//! every circuit that was still open on it as ended.

mod circmap;
mod endpoint;
mod handshake;
mod io;
mod reactor;
mod relay;
#[cfg(test)]
pub(crate) mod testing;
mod unique_id;

use crate::exit::ExitConnector;
use crate::{Error, Result};
use tor61_cell::{Agent, Cell, CellCmd, RawCell};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

pub use endpoint::{Caller, CircuitEndpoint, Response, ResponseStatus};
pub use reactor::Reactor;
pub use unique_id::UniqId;

/// Timing parameters for a channel.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// How long to wait for the peer's side of the handshake.
    pub handshake_timeout: Duration,
    /// How long to wait for an answer to a `create` or `extend`.
    pub response_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            handshake_timeout: Duration::from_millis(3000),
            response_timeout: Duration::from_millis(5000),
        }
    }
}

/// Something that can give us an open channel to another router.
///
/// The relay router uses this to handle `extend` cells; channels use it
/// to report that they have closed.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Return an open channel to `agent`, which is listening at
    /// `host:port`.  Reuse an existing channel if there is one.
    async fn get_or_launch(&self, agent: Agent, host: &str, port: u16) -> Result<Arc<Channel>>;

    /// Called exactly once, when `channel` has closed.
    fn channel_closed(&self, channel: &Channel);
}

/// The things every channel on this router shares.
#[derive(Clone)]
pub struct ChannelContext {
    /// Our own agent.
    me: Agent,
    /// Timing parameters.
    config: ChannelConfig,
    /// Where to get channels for extending circuits.
    provider: Option<Weak<dyn ChannelProvider>>,
    /// How to open exit connections.
    exits: Arc<dyn ExitConnector>,
}

impl ChannelContext {
    /// Make a new context for channels belonging to `me`.
    ///
    /// Channels made with this context can't extend circuits until a
    /// provider is attached with [`ChannelContext::with_provider`].
    pub fn new(me: Agent, config: ChannelConfig, exits: Arc<dyn ExitConnector>) -> Self {
        ChannelContext {
            me,
            config,
            provider: None,
            exits,
        }
    }

    /// Attach a channel provider to this context.
    pub fn with_provider(mut self, provider: Weak<dyn ChannelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Return the agent that channels made from this context speak for.
    pub fn me(&self) -> Agent {
        self.me
    }

    /// Return the timing parameters of this context.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

/// The sending side of a channel, shared by its routing tables.
///
/// Cells put here are written by the reactor, in order.
#[derive(Clone)]
pub(crate) struct CellSender {
    /// Which channel this sends on, for logging.
    chan: UniqId,
    /// Queue of cells to write.
    tx: mpsc::UnboundedSender<RawCell>,
}

impl CellSender {
    /// Queue an encoded cell.
    pub(crate) fn send_raw(&self, cell: RawCell) -> Result<()> {
        trace!("{}: sending {}", self.chan, cell);
        self.tx
            .unbounded_send(cell)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Encode and queue a cell.
    pub(crate) fn send(&self, cell: Cell) -> Result<()> {
        self.send_raw(cell.encode()?)
    }
}

/// An open channel to another router.
///
/// A channel is always handled through an `Arc`; the reactor holds one,
/// and so does whoever launched it.
pub struct Channel {
    /// A unique identifier for this channel.
    unique_id: UniqId,
    /// The agent at the other end.
    peer: Agent,
    /// True if we opened this channel.
    initiator: bool,
    /// Set once the channel has started to close.
    closing: AtomicBool,
    /// Set once the cleanup hook has run.
    cleaned: AtomicBool,
    /// Used to tell the reactor to stop.
    closeflag: Mutex<Option<oneshot::Sender<()>>>,
    /// Circuits that we opened on this channel.
    endpoint: CircuitEndpoint,
    /// Circuits that the peer opened on this channel.
    relay: relay::RelayRouter,
    /// Who to tell when we close.
    provider: Option<Weak<dyn ChannelProvider>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("unique_id", &self.unique_id)
            .field("peer", &self.peer)
            .field("initiator", &self.initiator)
            .finish()
    }
}

impl Channel {
    /// Construct a channel and its reactor around a stream whose
    /// handshake has finished.
    fn new<S>(
        opened: handshake::OpenedStream<S>,
        initiator: bool,
        ctx: &ChannelContext,
    ) -> (Arc<Self>, Reactor<S>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let unique_id = UniqId::new();
        let (tx, rx) = mpsc::unbounded();
        let sender = CellSender { chan: unique_id, tx };
        let (closeflag, recvclose) = oneshot::channel();

        let endpoint = CircuitEndpoint::new(
            unique_id,
            circmap::CircIdRange::ours(initiator),
            sender.clone(),
            ctx.config.response_timeout,
        );
        let relay = relay::RelayRouter::new(
            unique_id,
            sender,
            ctx.provider.clone(),
            Arc::clone(&ctx.exits),
        );

        let channel = Arc::new(Channel {
            unique_id,
            peer: opened.peer,
            initiator,
            closing: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            closeflag: Mutex::new(Some(closeflag)),
            endpoint,
            relay,
            provider: ctx.provider.clone(),
        });
        debug!(
            "{}: {} channel to {} is open",
            unique_id,
            if initiator { "outbound" } else { "inbound" },
            opened.peer
        );
        let reactor = Reactor::new(Arc::clone(&channel), opened, rx, recvclose);
        (channel, reactor)
    }

    /// Return a process-unique identifier for this channel.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return the agent at the other end of this channel.
    pub fn peer(&self) -> Agent {
        self.peer
    }

    /// Return true if we opened this channel.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Return true if this channel is closed or closing.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Return true if `other` is the same channel as this one.
    pub fn same_channel(&self, other: &Channel) -> bool {
        self.unique_id == other.unique_id
    }

    /// Return the routing table for circuits that we open on this channel.
    pub fn endpoint(&self) -> &CircuitEndpoint {
        &self.endpoint
    }

    /// Ask this channel's reactor to shut down.
    ///
    /// Cleanup happens asynchronously, once the reactor notices.
    pub fn terminate(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let flag = self
            .closeflag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flag) = flag {
            // The reactor may already be gone; that's fine.
            let _ = flag.send(());
        }
    }

    /// Hand a cell that arrived on this channel to the right table.
    pub(crate) fn dispatch(&self, cell: RawCell) {
        trace!("{}: received {}", self.unique_id, cell);
        if cell.cmd().is_open_family() {
            debug!(
                "{}: ignoring {} after handshake was done",
                self.unique_id,
                cell.cmd()
            );
            return;
        }
        let id = cell.circ_id();
        if !circmap::CircIdRange::ours(self.initiator).contains(id) {
            if let Err(e) = self.relay.handle_cell(cell) {
                debug!("{}: error while relaying: {}", self.unique_id, e);
            }
        } else if cell.cmd() == CellCmd::CREATE {
            warn!(
                "{}: {} tried to create circuit {}, which is ours to allocate",
                self.unique_id, self.peer, id
            );
        } else if self.endpoint.is_my_circuit(id) {
            self.endpoint.handle_response(cell);
        } else {
            debug!(
                "{}: dropping {} on circuit {}, which we don't have",
                self.unique_id,
                cell.cmd(),
                id
            );
        }
    }

    /// Run the cleanup hook for this channel, if it hasn't run yet.
    pub(crate) fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: channel to {} closed", self.unique_id, self.peer);
        if let Some(provider) = self.provider.as_ref().and_then(Weak::upgrade) {
            provider.channel_closed(self);
        }
        self.relay.cleanup();
        self.endpoint.cleanup();
    }
}

/// Run the handshake on a connection that we opened to `peer`, and
/// return the resulting channel and reactor.
pub async fn connect_outbound<S>(
    stream: S,
    peer: Agent,
    ctx: &ChannelContext,
) -> Result<(Arc<Channel>, Reactor<S>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let opened = handshake::OutboundHandshake::new(stream, ctx.me, peer)
        .connect(ctx.config.handshake_timeout)
        .await?;
    Ok(Channel::new(opened, true, ctx))
}

/// Run the handshake on a connection that a peer opened to us, and
/// return the resulting channel and reactor.
///
/// `is_known` is asked whether we already have a channel to the agent
/// that is connecting; if we do, the connection is refused.
pub async fn accept_inbound<S, F>(
    stream: S,
    ctx: &ChannelContext,
    is_known: F,
) -> Result<(Arc<Channel>, Reactor<S>)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Fn(Agent) -> bool,
{
    let opened = handshake::InboundHandshake::new(stream, ctx.me)
        .accept(ctx.config.handshake_timeout, is_known)
        .await?;
    Ok(Channel::new(opened, false, ctx))
}
