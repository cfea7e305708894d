//! Build a circuit through the Tor61 network, and multiplex streams
//! over it.
//!
//! A Tor61 router keeps a single circuit of its own.  The circuit is
//! built one hop at a time: we get a channel to a random first hop and
//! send it `create`, then ask the last hop to `extend` to another
//! random router until the circuit is long enough.  A router that fails
//! us goes on the circuit's invalid list, and we try another.  If the
//! circuit breaks after it is built, we build a new one.
//!
//! Streams are opened with [`CircuitBuilder::open_stream`].  A stream's
//! `begin` is held back until the circuit is complete, and its data
//! until the exit has connected; when the circuit is rebuilt, every
//! stream is begun again on the new circuit, and whatever it had queued
//! is sent there.
//!
//! # Limitations
//!
//! Paths may contain the same router more than once, and may run
//! through ourself.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod err;
mod reactor;
mod stream;
mod streams;

use reactor::CtrlMsg;
use tor61_cell::{Agent, CircId, RelayTarget, StreamId};
use tor61_dirclient::{DirMgr, RouterInfo, RouterList};
use tor61_proto::channel::ChannelProvider;

use futures::channel::{mpsc, oneshot};

use std::sync::Arc;
use std::time::Duration;

pub use err::{BuildFailure, Error};
pub use stream::{DataStream, StreamReader, StreamWriter};
pub use streams::{StreamEvent, StreamStatus};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for a [`CircuitBuilder`].
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// How many hops a complete circuit has.
    pub length: usize,
    /// How long to wait before each retry after a failure, and before
    /// rebuilding a circuit that broke.
    pub retry_delay: Duration,
    /// How many hops we may try to add before the circuit is complete.
    /// None means we never give up.
    pub max_attempts: Option<u32>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            length: 3,
            retry_delay: Duration::from_millis(100),
            max_attempts: None,
        }
    }
}

/// Something that can choose the routers for a circuit.
pub trait PickRouter: Send + Sync {
    /// Return a router that is not in `invalid`, if there is one, and
    /// our own router otherwise.
    fn pick_router(&self, invalid: &[Agent]) -> RouterInfo;
}

impl PickRouter for RouterList {
    fn pick_router(&self, invalid: &[Agent]) -> RouterInfo {
        self.random_router(invalid, &mut rand::thread_rng())
    }
}

impl PickRouter for DirMgr {
    fn pick_router(&self, invalid: &[Agent]) -> RouterInfo {
        self.routers().pick_router(invalid)
    }
}

/// A report on a circuit.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CircStatus {
    /// The local ID of the circuit.  It changes whenever we start over.
    pub circ_id: CircId,
    /// How many hops the circuit has now.
    pub length: usize,
    /// How many hops it has when it's complete.
    pub target_length: usize,
    /// The routers on the circuit, in order.
    pub hops: Vec<Agent>,
    /// The routers we won't use again.
    pub invalid: Vec<Agent>,
    /// Every failure since the circuit was last complete, oldest first.
    pub failures: Vec<BuildFailure>,
    /// Every stream, and where it is in its life.
    pub streams: Vec<(StreamId, StreamStatus)>,
}

impl CircStatus {
    /// Return true if the circuit is complete.
    pub fn is_complete(&self) -> bool {
        self.length >= self.target_length
    }
}

/// A handle on our circuit.
///
/// The circuit itself is built and run by a background task, which
/// stops once [`CircuitBuilder::close`] is called or every handle
/// (including every stream) is dropped.
#[derive(Clone)]
pub struct CircuitBuilder {
    /// Where we send requests for the circuit.
    control: mpsc::UnboundedSender<CtrlMsg>,
}

impl CircuitBuilder {
    /// Start building a circuit in the background.
    ///
    /// First hops are reached through `provider`; every hop is chosen
    /// by `picker`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(
        provider: Arc<dyn ChannelProvider>,
        picker: Arc<dyn PickRouter>,
        config: CircuitConfig,
    ) -> Self {
        let (control, rx) = mpsc::unbounded();
        let reactor = reactor::Reactor::new(rx, provider, picker, config);
        tokio::spawn(reactor.run());
        CircuitBuilder { control }
    }

    /// Send a request to the circuit.
    fn send(&self, msg: CtrlMsg) -> Result<()> {
        self.control
            .unbounded_send(msg)
            .map_err(|_| Error::CircuitClosed)
    }

    /// Open a stream to `host:port` through the circuit's last hop.
    ///
    /// This returns right away; the stream is begun once the circuit is
    /// complete, and reports [`StreamEvent::Connected`] once the exit has
    /// connected.  Anything written before then is queued.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<DataStream> {
        if host.is_empty() || host.contains('\0') {
            return Err(Error::BadTarget(format!("{:?}", host)));
        }
        let (events_tx, events) = mpsc::unbounded();
        let (tx, rx) = oneshot::channel();
        self.send(CtrlMsg::OpenStream {
            target: RelayTarget::stream(host, port),
            events: events_tx,
            reply: tx,
        })?;
        let id = rx.await??;
        Ok(DataStream::new(id, self.control.clone(), events))
    }

    /// Wait until the circuit is complete.
    ///
    /// Fails if we give up building it, or it's closed first.
    pub async fn wait_ready(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(CtrlMsg::WaitReady(tx))?;
        rx.await?
    }

    /// Return a report on the circuit.
    pub async fn status(&self) -> Result<CircStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(CtrlMsg::Status(tx))?;
        Ok(rx.await?)
    }

    /// Tear down the circuit and close every stream.
    ///
    /// Anything that arrives on the circuit afterwards is ignored.
    pub fn close(&self) {
        // It may already be gone.
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }

    /// Tear down the circuit, and wait until its `destroy` has been
    /// handed to the channel.
    pub async fn shutdown(&self) {
        self.close();
        // Requests are handled in order, so this one is only dropped
        // once the reactor has finished.
        let _ = self.wait_ready().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tor61_cell::Cell;
    use tor61_chanmgr::transport::mem::{MemListener, MemNetwork, MemTransport};
    use tor61_chanmgr::{ChanMgr, ChanMgrConfig};
    use tor61_proto::channel::ChannelConfig;
    use tor61_proto::exit::{ExitConnector, ExitStream};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    fn agent(i: u16) -> Agent {
        Agent::new(3, i)
    }

    fn info(i: u16) -> RouterInfo {
        RouterInfo::new(format!("r{}", i), 6000 + i, agent(i))
    }

    fn config() -> CircuitConfig {
        CircuitConfig {
            max_attempts: Some(20),
            ..CircuitConfig::default()
        }
    }

    fn new_mgr(net: &Arc<MemNetwork>, i: u16) -> Arc<ChanMgr<MemTransport>> {
        ChanMgr::new(
            agent(i),
            net.transport(),
            ChanMgrConfig::default(),
            ChannelConfig::default(),
            Arc::new(net.transport()),
        )
    }

    /// Start a router that listens at `info(i)`.
    fn router(net: &Arc<MemNetwork>, i: u16) -> Arc<ChanMgr<MemTransport>> {
        router_with_exit(net, i, Arc::new(net.transport()))
    }

    /// Start a router that listens at `info(i)`, and opens exit streams
    /// with `exits`.
    fn router_with_exit(
        net: &Arc<MemNetwork>,
        i: u16,
        exits: Arc<dyn ExitConnector>,
    ) -> Arc<ChanMgr<MemTransport>> {
        let mgr = ChanMgr::new(
            agent(i),
            net.transport(),
            ChanMgrConfig::default(),
            ChannelConfig::default(),
            exits,
        );
        let r = info(i);
        let mut listener: MemListener = net.listen(&r.host, r.port).unwrap();
        let m = Arc::clone(&mgr);
        tokio::spawn(async move {
            while let Some(s) = listener.accept().await {
                m.handle_inbound(s);
            }
        });
        mgr
    }

    /// Start a router at `info(i)` that opens channels, then never
    /// answers anything.
    fn mute_router(net: &Arc<MemNetwork>, i: u16) {
        let r = info(i);
        let mut listener = net.listen(&r.host, r.port).unwrap();
        tokio::spawn(async move {
            let mut conns = Vec::new();
            while let Some(mut s) = listener.accept().await {
                let mut buf = [0_u8; 512];
                s.read_exact(&mut buf).await.unwrap();
                if let Cell::Open { opener, opened } = Cell::decode(&buf).unwrap() {
                    let reply = Cell::Opened { opener, opened }.encode().unwrap();
                    s.write_all(reply.as_bytes()).await.unwrap();
                }
                conns.push(s);
            }
        });
    }

    /// Opens exit streams once it has been told to, one per permit.
    struct GatedExit {
        /// Released once per connection we may open.
        gate: Arc<Notify>,
        /// Where the connections go.
        inner: MemTransport,
    }

    #[async_trait]
    impl ExitConnector for GatedExit {
        async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn ExitStream>> {
            self.gate.notified().await;
            ExitConnector::connect(&self.inner, host, port).await
        }
    }

    /// Poll the circuit's status until `pred` holds, and return it.
    async fn wait_for_status<F>(circ: &CircuitBuilder, pred: F) -> CircStatus
    where
        F: Fn(&CircStatus) -> bool,
    {
        loop {
            let status = circ.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Hands out routers from a list, in order.
    struct ScriptedPicker {
        /// The routers still to hand out.
        script: Mutex<VecDeque<RouterInfo>>,
    }

    impl ScriptedPicker {
        fn new(script: Vec<RouterInfo>) -> Arc<Self> {
            Arc::new(ScriptedPicker {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl PickRouter for ScriptedPicker {
        fn pick_router(&self, _invalid: &[Agent]) -> RouterInfo {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("ran out of routers")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn build_with_failures() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        let mut exit = net.listen("example.com", 80).unwrap();
        let origin = new_mgr(&net, 9);
        // 11 and 12 aren't listening.
        let picker = ScriptedPicker::new(vec![info(11), info(1), info(2), info(12), info(3)]);
        let circ = CircuitBuilder::launch(origin, picker, config());

        // A stream opened early waits for the circuit.
        let mut stream = circ.open_stream("example.com", 80).await.unwrap();
        stream.write(b"hello").unwrap();
        circ.wait_ready().await.unwrap();

        let status = circ.status().await.unwrap();
        assert!(status.is_complete());
        assert_eq!(status.hops, vec![agent(1), agent(2), agent(3)]);
        assert_eq!(status.invalid, vec![agent(11), agent(12)]);
        assert!(matches!(
            &status.failures[..],
            [BuildFailure::Connect(a, _), BuildFailure::ExtendFailed(b)]
                if *a == agent(11) && *b == agent(12)
        ));

        let mut conn = exit.accept().await.unwrap();
        assert_eq!(stream.next_event().await, Some(StreamEvent::Connected));
        let status = circ.status().await.unwrap();
        assert_eq!(status.streams, vec![(stream.id(), StreamStatus::Ready)]);
        let mut buf = [0_u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        conn.write_all(b"world").await.unwrap();
        assert_eq!(
            stream.next_event().await,
            Some(StreamEvent::Data(Bytes::from_static(b"world")))
        );

        // The begin went out exactly once.
        assert!(exit.accept().now_or_never().is_none());

        stream.end().unwrap();
        assert_eq!(stream.next_event().await, Some(StreamEvent::Closed));
        assert_eq!(stream.next_event().await, None);
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_after_entry_loss() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        let gate = Arc::new(Notify::new());
        let _gated = router_with_exit(
            &net,
            4,
            Arc::new(GatedExit {
                gate: Arc::clone(&gate),
                inner: net.transport(),
            }),
        );
        let mut exit = net.listen("example.com", 80).unwrap();
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![
            info(1),
            info(2),
            info(3),
            info(1),
            info(2),
            info(4),
        ]);
        let circ = CircuitBuilder::launch(origin.clone(), picker, config());
        circ.wait_ready().await.unwrap();
        let mut stream = circ.open_stream("example.com", 80).await.unwrap();
        let mut conn1 = exit.accept().await.unwrap();
        assert_eq!(stream.next_event().await, Some(StreamEvent::Connected));
        let before = circ.status().await.unwrap();
        assert_eq!(before.streams, vec![(stream.id(), StreamStatus::Ready)]);

        // Break the first hop's channel.  The circuit hasn't heard yet,
        // so both writes are queued on a ready stream.
        origin.get_nowait(agent(1)).unwrap().terminate();
        stream.write(b"one").unwrap();
        stream.write(b"two").unwrap();

        // Once the loss is noticed, the stream is primed again.
        let lost = wait_for_status(&circ, |s| s.hops.is_empty()).await;
        assert_eq!(lost.streams, vec![(stream.id(), StreamStatus::Primed)]);

        // On the new circuit it is begun again, and waits for the exit.
        circ.wait_ready().await.unwrap();
        let rebuilt = circ.status().await.unwrap();
        assert_eq!(rebuilt.hops, vec![agent(1), agent(2), agent(4)]);
        assert_ne!(rebuilt.circ_id, before.circ_id);
        assert!(rebuilt.invalid.is_empty());
        assert_eq!(rebuilt.streams, vec![(stream.id(), StreamStatus::Waiting)]);

        gate.notify_one();
        let mut conn2 = exit.accept().await.unwrap();
        assert_eq!(stream.next_event().await, Some(StreamEvent::Connected));
        let after = circ.status().await.unwrap();
        assert_eq!(after.streams, vec![(stream.id(), StreamStatus::Ready)]);

        // Both writes arrive once, in order, on the new connection.
        let mut buf = [0_u8; 6];
        conn2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"onetwo");
        stream.end().unwrap();
        assert_eq!(stream.next_event().await, Some(StreamEvent::Closed));
        let mut rest = Vec::new();
        conn2.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // Nothing went to the old exit connection, which is now closed.
        let mut rest = Vec::new();
        conn1.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loss_while_waiting_to_retry() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        let origin = new_mgr(&net, 9);
        // 12 isn't listening.
        let picker = ScriptedPicker::new(vec![
            info(1),
            info(2),
            info(12),
            info(1),
            info(2),
            info(3),
        ]);
        let circ = CircuitBuilder::launch(origin.clone(), picker, config());

        // Break the first hop while the failed extend waits for its retry.
        let failed = wait_for_status(&circ, |s| !s.failures.is_empty()).await;
        assert_eq!(failed.hops, vec![agent(1), agent(2)]);
        origin.get_nowait(agent(1)).unwrap().terminate();

        circ.wait_ready().await.unwrap();
        let status = circ.status().await.unwrap();
        assert_eq!(status.hops, vec![agent(1), agent(2), agent(3)]);
        // Only the router that failed is blamed.
        assert_eq!(status.invalid, vec![agent(12)]);
        assert_eq!(status.failures, vec![BuildFailure::ExtendFailed(agent(12))]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_first_hop() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        mute_router(&net, 20);
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![info(20), info(1), info(2), info(3)]);
        let start = Instant::now();
        let circ = CircuitBuilder::launch(origin, picker, config());
        circ.wait_ready().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5000));

        let status = circ.status().await.unwrap();
        assert_eq!(status.hops, vec![agent(1), agent(2), agent(3)]);
        assert_eq!(status.invalid, vec![agent(20)]);
        assert_eq!(status.failures, vec![BuildFailure::Ended(agent(20))]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up() {
        let net = MemNetwork::new();
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![info(11), info(12), info(13)]);
        let cfg = CircuitConfig {
            max_attempts: Some(3),
            ..CircuitConfig::default()
        };
        let circ = CircuitBuilder::launch(origin, picker, cfg);
        let mut stream = circ.open_stream("example.com", 80).await.unwrap();

        match circ.wait_ready().await {
            Err(Error::RetriesExhausted { attempts, failures }) => {
                assert_eq!(attempts, 3);
                let blamed: Vec<_> = failures.iter().map(BuildFailure::router).collect();
                assert_eq!(blamed, vec![agent(11), agent(12), agent(13)]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(stream.next_event().await, Some(StreamEvent::Closed));
        assert!(matches!(
            circ.open_stream("example.com", 80).await,
            Err(Error::CircuitClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn begin_failed_closes_only_the_stream() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        let mut exit = net.listen("example.com", 80).unwrap();
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![info(1), info(2), info(3)]);
        let circ = CircuitBuilder::launch(origin, picker, config());
        circ.wait_ready().await.unwrap();

        // Nobody listens at nowhere.example.
        let mut bad = circ.open_stream("nowhere.example", 80).await.unwrap();
        assert_eq!(bad.next_event().await, Some(StreamEvent::Closed));

        let mut good = circ.open_stream("example.com", 80).await.unwrap();
        let _conn = exit.accept().await.unwrap();
        assert_eq!(good.next_event().await, Some(StreamEvent::Connected));
        assert_ne!(good.id(), bad.id());
        let status = circ.status().await.unwrap();
        assert!(status.is_complete());
        assert_eq!(status.streams, vec![(good.id(), StreamStatus::Ready)]);
    }

    #[tokio::test(start_paused = true)]
    async fn close() {
        let net = MemNetwork::new();
        let _routers: Vec<_> = (1..=3).map(|i| router(&net, i)).collect();
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![info(1), info(2), info(3)]);
        let circ = CircuitBuilder::launch(origin.clone(), picker, config());
        circ.wait_ready().await.unwrap();
        let (mut reader, writer) = circ
            .open_stream("example.com", 80)
            .await
            .unwrap()
            .split();

        circ.close();
        assert_eq!(reader.next_event().await, Some(StreamEvent::Closed));
        assert!(matches!(writer.write(b"x"), Err(Error::CircuitClosed)));
        assert!(matches!(circ.wait_ready().await, Err(Error::CircuitClosed)));

        // The first hop was told to tear down the circuit.
        let chan = origin.get_nowait(agent(1)).unwrap();
        assert_eq!(chan.endpoint().n_circuits(), 0);
    }

    #[tokio::test]
    async fn bad_target() {
        let net = MemNetwork::new();
        let origin = new_mgr(&net, 9);
        let picker = ScriptedPicker::new(vec![info(11)]);
        let cfg = CircuitConfig {
            max_attempts: Some(1),
            ..CircuitConfig::default()
        };
        let circ = CircuitBuilder::launch(origin, picker, cfg);
        assert!(matches!(
            circ.open_stream("", 80).await,
            Err(Error::BadTarget(_))
        ));
        assert!(matches!(
            circ.open_stream("a\0b", 80).await,
            Err(Error::BadTarget(_))
        ));
    }

    #[test]
    fn router_list_picks() {
        let me = info(9);
        let list = RouterList::new(me.clone());
        list.set(vec![info(1), info(2)]);
        for _ in 0..20 {
            assert_eq!(list.pick_router(&[agent(1)]), info(2));
        }
        assert_eq!(list.pick_router(&[agent(1), agent(2)]), me);
    }
}
