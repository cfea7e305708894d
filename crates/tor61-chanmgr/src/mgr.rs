//! The channel registry, apart from how channels are actually built.

use crate::builder::TargetInfo;
use crate::{Error, Result};
use tor61_cell::Agent;

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::future::Shared;
use std::sync::Arc;

mod map;

use map::{ChannelMap, Claim};

/// As much of a channel as the registry needs to know about.
pub(crate) trait AbstractChannel {
    /// Return the agent at the other end.
    fn peer(&self) -> Agent;
    /// Return true if this channel can still carry circuits.
    fn is_usable(&self) -> bool;
}

/// Something that can open a channel and run its handshake.
#[async_trait]
pub(crate) trait ChannelFactory {
    /// The type of channel that this factory builds.
    type Channel: AbstractChannel;

    /// Open a channel to the router described by `target`.
    async fn build_channel(&self, target: &TargetInfo) -> Result<Arc<Self::Channel>>;
}

/// A future that resolves when a launch finishes: to `Some` channel, or
/// to `None` (or cancellation) if it failed.
type Pending<C> = Shared<oneshot::Receiver<Option<Arc<C>>>>;

/// The sender that a launch reports its outcome on.
type Sending<C> = oneshot::Sender<Option<Arc<C>>>;

/// A registry of channels, one per peer agent, that launches channels
/// on demand.
pub(crate) struct Registry<CF: ChannelFactory> {
    /// Used to open new channels.
    factory: CF,
    /// Who we have channels to.
    channels: ChannelMap<CF::Channel>,
}

impl<CF: ChannelFactory> Registry<CF> {
    /// Make a new empty registry.
    pub(crate) fn new(factory: CF) -> Self {
        Registry {
            factory,
            channels: ChannelMap::new(),
        }
    }

    /// Return the factory that this registry builds channels with.
    pub(crate) fn factory(&self) -> &CF {
        &self.factory
    }

    /// Return a usable channel to `target.agent`.
    ///
    /// An existing channel is reused.  If somebody else is launching
    /// one, we share the outcome of their launch.  Otherwise we launch
    /// one ourselves, once.
    pub(crate) async fn get_or_launch(&self, target: &TargetInfo) -> Result<Arc<CF::Channel>> {
        match self.channels.claim(target.agent)? {
            Claim::Use(chan) => Ok(chan),
            Claim::Wait(pending) => match pending.await {
                Ok(Some(chan)) => Ok(chan),
                Ok(None) | Err(_) => Err(Error::PendingFailed),
            },
            Claim::Launch(send) => {
                let outcome = self.factory.build_channel(target).await;
                self.channels
                    .finish_launch(target.agent, outcome.as_ref().ok())?;
                // Nobody may be waiting.
                let _ = send.send(outcome.as_ref().ok().map(Arc::clone));
                outcome
            }
        }
    }

    /// Return the usable channel to `peer`, if we have one.
    pub(crate) fn get_nowait(&self, peer: Agent) -> Option<Arc<CF::Channel>> {
        self.channels.get_open(peer).ok().flatten()
    }

    /// Return true if a handshake from `peer` should be refused, because
    /// we already have a usable channel to it.
    pub(crate) fn is_established(&self, peer: Agent) -> bool {
        self.channels.is_established(peer).unwrap_or(false)
    }

    /// Record a channel that the peer opened to us; see
    /// [`ChannelMap::add_inbound`].
    pub(crate) fn add_inbound(&self, chan: &Arc<CF::Channel>) -> Result<bool> {
        self.channels.add_inbound(chan)
    }

    /// Forget `chan`, which has closed, unless a newer channel to the
    /// same peer has taken its place.
    pub(crate) fn remove_closed(&self, chan: &CF::Channel) -> Result<bool> {
        self.channels.remove_closed(chan)
    }

    /// Return the number of peers with a channel or a launch.
    pub(crate) fn n_entries(&self) -> usize {
        self.channels.len().unwrap_or(0)
    }
}
