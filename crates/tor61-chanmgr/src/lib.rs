//! Manage a set of channels to other Tor61 routers.
//!
//! A channel is a connection to another router, authenticated (as far
//! as Tor61 authenticates anything) by the open/opened handshake.  Since
//! a channel can carry any number of circuits in either direction, it's
//! important to reuse channels when possible.  This crate implements a
//! [`ChanMgr`] type that can be used to do that.
//!
//! The manager indexes channels by the peer's [`Agent`], whichever side
//! opened them.  It is also the [`ChannelProvider`] for every channel it
//! creates, so relayed `extend` requests reuse the same registry, and
//! channels remove themselves from it when they close.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod builder;
mod err;
mod mgr;
pub mod transport;

use tor61_cell::Agent;
use tor61_proto::channel::{self, Channel, ChannelConfig, ChannelContext, ChannelProvider};
use tor61_proto::exit::ExitConnector;

use async_trait::async_trait;
use tracing::{debug, warn};

use std::sync::{Arc, Weak};
use std::time::Duration;

pub use err::Error;
pub use transport::{TcpTransport, Transport};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for a [`ChanMgr`].
#[derive(Clone, Debug)]
pub struct ChanMgrConfig {
    /// How long to allow for connecting to a router and completing the
    /// handshake.
    pub connect_timeout: Duration,
}

impl Default for ChanMgrConfig {
    fn default() -> Self {
        ChanMgrConfig {
            connect_timeout: Duration::from_millis(3000),
        }
    }
}

/// A Type that remembers a set of live channels, and launches new
/// ones on request.
///
/// Use the [`ChanMgr::get_or_launch`] function to create a new channel,
/// or get one if it exists.  Hand connections that arrive on the
/// router's listening port to [`ChanMgr::handle_inbound`].
pub struct ChanMgr<TR: Transport> {
    /// Internal channel manager object that does the actual work.
    mgr: mgr::Registry<builder::ChanBuilder<TR>>,
}

impl<TR: Transport> ChanMgr<TR> {
    /// Construct a new channel manager for the router `me`.
    ///
    /// It will use `transport` to open connections, and `exits` to open
    /// exit streams for circuits that end here.
    pub fn new(
        me: Agent,
        transport: TR,
        config: ChanMgrConfig,
        chan_config: ChannelConfig,
        exits: Arc<dyn ExitConnector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let provider: Weak<dyn ChannelProvider> = weak.clone();
            let ctx = ChannelContext::new(me, chan_config, exits).with_provider(provider);
            let builder = builder::ChanBuilder::new(transport, ctx, config.connect_timeout);
            ChanMgr {
                mgr: mgr::Registry::new(builder),
            }
        })
    }

    /// Return the agent this manager makes channels for.
    pub fn me(&self) -> Agent {
        self.mgr.factory().context().me()
    }

    /// Try to get a usable channel to `agent`, which listens at
    /// `host:port`, launching one if one does not exist.
    ///
    /// If there is already a channel launch attempt in progress, this
    /// function will wait until that launch is complete, and succeed
    /// or fail depending on its outcome.
    pub async fn get_or_launch(&self, agent: Agent, host: &str, port: u16) -> Result<Arc<Channel>> {
        let target = builder::TargetInfo {
            agent,
            host: host.to_string(),
            port,
        };
        self.mgr.get_or_launch(&target).await
    }

    /// Return the usable channel to `agent`, if we have one.
    pub fn get_nowait(&self, agent: Agent) -> Option<Arc<Channel>> {
        self.mgr.get_nowait(agent)
    }

    /// Return the number of channels that are open or being launched.
    pub fn n_channels(&self) -> usize {
        self.mgr.n_entries()
    }

    /// Run the handshake on a connection that a peer opened to us.
    ///
    /// The connection is refused if we already have a usable channel to
    /// the peer.  On success, the new channel is recorded (unless a
    /// launch to the same peer is racing with it), and its reactor is
    /// running.
    pub async fn accept_inbound(&self, stream: TR::Connection) -> Result<Arc<Channel>> {
        let ctx = self.mgr.factory().context();
        let is_known = |agent: Agent| self.mgr.is_established(agent);
        let (chan, reactor) = channel::accept_inbound(stream, ctx, is_known).await?;
        if !self.mgr.add_inbound(&chan)? {
            debug!(
                "{}: not recording channel from {}; we have another",
                chan.unique_id(),
                chan.peer()
            );
        }
        builder::spawn_reactor(reactor);
        Ok(chan)
    }

    /// Launch a background task to accept a connection that a peer
    /// opened to us.
    pub fn handle_inbound(self: &Arc<Self>, stream: TR::Connection) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = mgr.accept_inbound(stream).await {
                debug!("Inbound connection failed: {}", e);
            }
        });
    }
}

#[async_trait]
impl<TR: Transport> ChannelProvider for ChanMgr<TR> {
    async fn get_or_launch(
        &self,
        agent: Agent,
        host: &str,
        port: u16,
    ) -> tor61_proto::Result<Arc<Channel>> {
        ChanMgr::get_or_launch(self, agent, host, port)
            .await
            .map_err(|e| tor61_proto::Error::ChanFailed(e.to_string()))
    }

    fn channel_closed(&self, channel: &Channel) {
        if let Err(e) = self.mgr.remove_closed(channel) {
            warn!("{}: couldn't forget channel: {}", channel.unique_id(), e);
        }
    }
}
