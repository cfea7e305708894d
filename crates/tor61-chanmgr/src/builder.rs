//! Implement a concrete type to build channels.

use crate::transport::Transport;
use crate::{Error, Result};
use tor61_cell::Agent;
use tor61_proto::channel::{self, Channel, ChannelContext, Reactor};

use async_trait::async_trait;
use tracing::{debug, info};

use std::sync::Arc;
use std::time::Duration;

/// Transport-based channel builder.
///
/// This is a separate type so that we can keep our channel management
/// code network-agnostic.
pub(crate) struct ChanBuilder<TR> {
    /// Object to open connections.
    transport: TR,
    /// Everything a new channel needs to know about this router.
    ctx: ChannelContext,
    /// How long a connection plus handshake may take.
    connect_timeout: Duration,
}

impl<TR: Transport> ChanBuilder<TR> {
    /// Construct a new ChanBuilder.
    pub(crate) fn new(transport: TR, ctx: ChannelContext, connect_timeout: Duration) -> Self {
        ChanBuilder {
            transport,
            ctx,
            connect_timeout,
        }
    }

    /// Return the context that channels from this builder share.
    pub(crate) fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    /// As build_channel, but don't include a timeout.
    async fn build_channel_notimeout(&self, target: &TargetInfo) -> Result<Arc<Channel>> {
        // 1. Open the connection.
        info!(
            "Connecting to {} at {}:{}",
            target.agent, target.host, target.port
        );
        let stream = self.transport.connect(&target.host, target.port).await?;

        // 2. Set up the channel.
        let (chan, reactor) = channel::connect_outbound(stream, target.agent, &self.ctx).await?;

        // 3. Launch a task to run the channel reactor.
        spawn_reactor(reactor);
        Ok(chan)
    }
}

/// Launch a task to run a channel reactor until the channel closes.
pub(crate) fn spawn_reactor<S>(reactor: Reactor<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = reactor.run().await {
            debug!("Channel reactor exited with error: {}", e);
        }
    });
}

#[async_trait]
impl<TR: Transport> crate::mgr::ChannelFactory for ChanBuilder<TR> {
    type Channel = Channel;

    async fn build_channel(&self, target: &TargetInfo) -> Result<Arc<Channel>> {
        target.check()?;
        tokio::time::timeout(self.connect_timeout, self.build_channel_notimeout(target)).await?
    }
}

impl crate::mgr::AbstractChannel for Channel {
    fn peer(&self) -> Agent {
        Channel::peer(self)
    }
    fn is_usable(&self) -> bool {
        !self.is_closing()
    }
}

/// Where to find a router we want a channel to.
#[derive(Debug, Clone)]
pub(crate) struct TargetInfo {
    /// The router's identity.
    pub(crate) agent: Agent,
    /// The host it listens on.
    pub(crate) host: String,
    /// The port it listens on.
    pub(crate) port: u16,
}

impl TargetInfo {
    /// Return an error if there's no way we could connect to this target.
    fn check(&self) -> Result<()> {
        if self.host.is_empty() {
            Err(Error::UnusableTarget(format!("No host for {}", self.agent)))
        } else if self.port == 0 {
            Err(Error::UnusableTarget(format!("No port for {}", self.agent)))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mgr::ChannelFactory;
    use crate::transport::mem::MemNetwork;
    use tor61_cell::Cell;
    use tor61_proto::channel::ChannelConfig;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn builder(net: &Arc<MemNetwork>, handshake: Duration) -> ChanBuilder<impl Transport> {
        let config = ChannelConfig {
            handshake_timeout: handshake,
            ..ChannelConfig::default()
        };
        let ctx = ChannelContext::new(Agent::new(1, 1), config, Arc::new(net.transport()));
        ChanBuilder::new(net.transport(), ctx, Duration::from_millis(3000))
    }

    fn target(port: u16) -> TargetInfo {
        TargetInfo {
            agent: Agent::new(1, 2),
            host: "router2".into(),
            port,
        }
    }

    #[tokio::test]
    async fn build_ok() {
        let net = MemNetwork::new();
        let mut listener = net.listen("router2", 4000).unwrap();
        let cb = builder(&net, Duration::from_millis(3000));
        assert_eq!(cb.context().me(), Agent::new(1, 1));

        let peer = async move {
            let mut s = listener.accept().await.unwrap();
            let mut buf = [0_u8; 512];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(
                Cell::decode(&buf).unwrap(),
                Cell::Open {
                    opener: Agent::new(1, 1),
                    opened: Agent::new(1, 2)
                }
            );
            let opened = Cell::Opened {
                opener: Agent::new(1, 1),
                opened: Agent::new(1, 2),
            };
            s.write_all(opened.encode().unwrap().as_bytes())
                .await
                .unwrap();
            s
        };
        let t = target(4000);
        let (chan, _s) = tokio::join!(cb.build_channel(&t), peer);
        let chan = chan.unwrap();
        assert_eq!(chan.peer(), Agent::new(1, 2));
        assert!(chan.is_initiator());
    }

    #[tokio::test]
    async fn build_unusable() {
        let net = MemNetwork::new();
        let cb = builder(&net, Duration::from_millis(3000));
        let mut t = target(4000);
        t.host = String::new();
        let r = cb.build_channel(&t).await;
        assert!(matches!(r, Err(Error::UnusableTarget(_))));
        let r = cb.build_channel(&target(0)).await;
        assert!(matches!(r, Err(Error::UnusableTarget(_))));
        let r = cb.build_channel(&target(4000)).await;
        assert!(matches!(r, Err(Error::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn build_timeout() {
        let net = MemNetwork::new();
        let mut listener = net.listen("router2", 4000).unwrap();
        // Make sure the overall limit is the one that fires.
        let cb = builder(&net, Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        let t = target(4000);
        let (r, _s) = tokio::join!(cb.build_channel(&t), listener.accept());
        assert!(matches!(r, Err(Error::ChanTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }
}
