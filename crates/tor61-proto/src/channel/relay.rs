//! Routing for circuits that a peer opened toward us.
//!
//! Every circuit here is in one of three states:
//!
//!   * `Primed`: created, and not extended.  We are the last hop, so its
//!     relay cells are for us: streams to open, data for those streams,
//!     or a request to extend.
//!   * `Extending`: we have sent `create` to the next hop and are waiting
//!     for `created`.
//!   * `Spliced`: extended.  Its relay cells are renumbered and passed to
//!     the next hop's channel, and whatever comes back from there is
//!     renumbered and passed back here.

use super::endpoint::{Caller, Response, ResponseStatus};
use super::{CellSender, Channel, ChannelProvider, UniqId};
use crate::exit::{run_exit, ExitConnector, ExitMsg, ExitReplies};
use crate::{Error, Result};
use tor61_cell::{Cell, CellCmd, CircId, RawCell, RelayCell, RelayCmd, RelayTarget, StreamId};

use futures::channel::mpsc;
use tracing::{debug, trace};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// State of one incoming circuit.
enum Incoming {
    /// We are the last hop.
    Primed,
    /// We are waiting for the next hop to answer our `create`.
    Extending,
    /// Cells go to the next hop, on this channel.
    Spliced(Arc<Channel>),
}

/// Our end of one exit stream.
struct ExitHandle {
    /// Tells this handle apart from a later stream that reuses its ID.
    id: u64,
    /// Messages for the stream's task.
    tx: mpsc::UnboundedSender<ExitMsg>,
}

/// Mutable state of a relay router.
struct RelayInner {
    /// Every circuit the peer has created here.
    circuits: HashMap<CircId, Incoming>,
    /// Open exit streams, on circuits for which we are the last hop.
    streams: HashMap<(CircId, StreamId), ExitHandle>,
    /// Identifier for the next exit stream.
    next_exit: u64,
    /// True once the channel has closed.
    closed: bool,
}

/// Shared part of a relay router, also reachable from its handlers
/// and exit tasks.
struct Shared {
    /// The channel this router belongs to.
    unique_id: UniqId,
    /// Where our replies go.
    sender: CellSender,
    /// Where to get channels to the next hop.
    provider: Option<Weak<dyn ChannelProvider>>,
    /// How to open exit streams.
    exits: Arc<dyn ExitConnector>,
    /// The routing table itself.
    inner: Mutex<RelayInner>,
}

/// The table of circuits that the peer opened on a channel.
pub(crate) struct RelayRouter {
    /// The state, shared with callbacks.
    shared: Arc<Shared>,
}

/// What to do once the table lock is released.
enum Action {
    /// Nothing more.
    Nothing,
    /// Reply on our own channel.
    Reply(Cell),
    /// Pass a cell to the next hop.
    Forward(Arc<Channel>, RawCell),
    /// Start an extend.
    Extend(CircId, RelayTarget),
    /// Start an exit stream.
    Begin(CircId, StreamId, RelayTarget, u64, mpsc::UnboundedReceiver<ExitMsg>),
}

/// Return the failure for a relay request that can't be honored.
fn relay_failure(circ: CircId, stream: StreamId, cmd: RelayCmd) -> Cell {
    Cell::Relay(RelayCell::empty(circ, stream, cmd))
}

impl RelayRouter {
    /// Construct a new empty router.
    pub(super) fn new(
        unique_id: UniqId,
        sender: CellSender,
        provider: Option<Weak<dyn ChannelProvider>>,
        exits: Arc<dyn ExitConnector>,
    ) -> Self {
        RelayRouter {
            shared: Arc::new(Shared {
                unique_id,
                sender,
                provider,
                exits,
                inner: Mutex::new(RelayInner {
                    circuits: HashMap::new(),
                    streams: HashMap::new(),
                    next_exit: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Handle a cell that the peer sent on one of its circuits.
    pub(super) fn handle_cell(&self, cell: RawCell) -> Result<()> {
        let action = match cell.cmd() {
            CellCmd::CREATE => self.shared.create(cell.circ_id())?,
            CellCmd::DESTROY => self.shared.destroy(cell)?,
            CellCmd::RELAY => self.shared.relay(cell)?,
            other => {
                debug!(
                    "{}: unexpected {} on circuit {}",
                    self.shared.unique_id,
                    other,
                    cell.circ_id()
                );
                Action::Nothing
            }
        };
        Shared::perform(&self.shared, action)
    }

    /// Tear down every circuit on this router: close their exit
    /// streams, and destroy the circuits they were spliced to.
    pub(super) fn cleanup(&self) {
        let (circuits, streams) = {
            let mut inner = self
                .shared
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            inner.closed = true;
            (
                std::mem::take(&mut inner.circuits),
                std::mem::take(&mut inner.streams),
            )
        };
        drop(streams);
        for (circ, state) in circuits {
            if let Incoming::Spliced(next) = state {
                self.shared.destroy_onward(&next, circ);
            }
        }
    }
}

impl Shared {
    /// Return the caller ID that our circuits use on other channels.
    fn caller(&self) -> Caller {
        Caller::Channel(self.unique_id)
    }

    /// Handle a `create`.
    fn create(&self, circ: CircId) -> Result<Action> {
        let mut inner = self.inner.lock()?;
        if circ.is_zero() || inner.closed || inner.circuits.contains_key(&circ) {
            debug!("{}: refusing create on circuit {}", self.unique_id, circ);
            return Ok(Action::Reply(Cell::CreateFailed(circ)));
        }
        inner.circuits.insert(circ, Incoming::Primed);
        trace!("{}: circuit {} primed", self.unique_id, circ);
        Ok(Action::Reply(Cell::Created(circ)))
    }

    /// Handle a `destroy`.
    fn destroy(&self, cell: RawCell) -> Result<Action> {
        let circ = cell.circ_id();
        let mut inner = self.inner.lock()?;
        inner.streams.retain(|(c, _), _| *c != circ);
        match inner.circuits.remove(&circ) {
            Some(Incoming::Spliced(next)) => Ok(Action::Forward(next, cell)),
            Some(_) => Ok(Action::Nothing),
            None => {
                debug!("{}: destroy for unknown circuit {}", self.unique_id, circ);
                Ok(Action::Nothing)
            }
        }
    }

    /// Handle a relay cell.
    fn relay(&self, cell: RawCell) -> Result<Action> {
        let circ = cell.circ_id();
        let stream = cell.stream_id().unwrap_or_default();
        let cmd = match cell.relay_cmd() {
            Some(cmd) => cmd,
            None => return Ok(Action::Nothing),
        };
        let mut inner = self.inner.lock()?;

        let extending = match inner.circuits.get(&circ) {
            Some(Incoming::Spliced(next)) => return Ok(Action::Forward(Arc::clone(next), cell)),
            Some(Incoming::Extending) => true,
            Some(Incoming::Primed) => false,
            None => {
                debug!("{}: {} on unknown circuit {}", self.unique_id, cmd, circ);
                return Ok(match cmd {
                    RelayCmd::BEGIN => {
                        Action::Reply(relay_failure(circ, stream, RelayCmd::BEGIN_FAILED))
                    }
                    RelayCmd::EXTEND => Action::Reply(relay_failure(
                        circ,
                        StreamId::default(),
                        RelayCmd::EXTEND_FAILED,
                    )),
                    _ => Action::Nothing,
                });
            }
        };

        // We are the last hop on this circuit.
        let body = cell.relay_body().unwrap_or_default();
        let action = match cmd {
            RelayCmd::BEGIN => {
                let target = RelayTarget::parse_begin(body);
                match target {
                    Ok(target) if !inner.streams.contains_key(&(circ, stream)) => {
                        let (tx, rx) = mpsc::unbounded();
                        let id = inner.next_exit;
                        inner.next_exit += 1;
                        inner.streams.insert((circ, stream), ExitHandle { id, tx });
                        Action::Begin(circ, stream, target, id, rx)
                    }
                    Ok(_) => {
                        debug!(
                            "{}: circuit {} already has a stream {}",
                            self.unique_id, circ, stream
                        );
                        Action::Reply(relay_failure(circ, stream, RelayCmd::BEGIN_FAILED))
                    }
                    Err(e) => {
                        debug!("{}: bad begin on circuit {}: {}", self.unique_id, circ, e);
                        Action::Reply(relay_failure(circ, stream, RelayCmd::BEGIN_FAILED))
                    }
                }
            }
            RelayCmd::DATA => {
                match inner.streams.get(&(circ, stream)) {
                    Some(h) => {
                        let data = bytes::Bytes::copy_from_slice(body);
                        if h.tx.unbounded_send(ExitMsg::Data(data)).is_err() {
                            inner.streams.remove(&(circ, stream));
                        }
                    }
                    None => debug!(
                        "{}: data for unknown stream {} on circuit {}",
                        self.unique_id, stream, circ
                    ),
                }
                Action::Nothing
            }
            RelayCmd::END => {
                if let Some(h) = inner.streams.remove(&(circ, stream)) {
                    let _ = h.tx.unbounded_send(ExitMsg::End);
                }
                Action::Nothing
            }
            RelayCmd::EXTEND => {
                let target = RelayTarget::parse_extend(body);
                match target {
                    Ok(target) if !extending && target.agent().is_some() => {
                        inner.circuits.insert(circ, Incoming::Extending);
                        Action::Extend(circ, target)
                    }
                    Ok(_) => {
                        debug!(
                            "{}: circuit {} is already being extended",
                            self.unique_id, circ
                        );
                        Action::Reply(relay_failure(
                            circ,
                            StreamId::default(),
                            RelayCmd::EXTEND_FAILED,
                        ))
                    }
                    Err(e) => {
                        debug!("{}: bad extend on circuit {}: {}", self.unique_id, circ, e);
                        Action::Reply(relay_failure(
                            circ,
                            StreamId::default(),
                            RelayCmd::EXTEND_FAILED,
                        ))
                    }
                }
            }
            other => {
                debug!(
                    "{}: ignoring {} on circuit {} that ends here",
                    self.unique_id, other, circ
                );
                Action::Nothing
            }
        };
        Ok(action)
    }

    /// Carry out `action`.  Never called with the table locked.
    fn perform(this: &Arc<Shared>, action: Action) -> Result<()> {
        match action {
            Action::Nothing => Ok(()),
            Action::Reply(cell) => this.sender.send(cell),
            Action::Forward(next, cell) => next.endpoint().send_cell(this.caller(), cell),
            Action::Extend(circ, target) => {
                let shared = Arc::clone(this);
                tokio::spawn(async move {
                    shared.finish_extend(circ, target).await;
                });
                Ok(())
            }
            Action::Begin(circ, stream, target, id, rx) => {
                let replies = ExitReplies {
                    sender: this.sender.clone(),
                    circ_id: circ,
                    stream_id: stream,
                };
                let exits = Arc::clone(&this.exits);
                let weak = Arc::downgrade(this);
                tokio::spawn(async move {
                    run_exit(exits, target, replies, rx).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.exit_finished(circ, stream, id);
                    }
                });
                Ok(())
            }
        }
    }

    /// Forget exit stream `id`, if it's still registered.
    fn exit_finished(&self, circ: CircId, stream: StreamId, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.streams.get(&(circ, stream)).map(|h| h.id) == Some(id) {
            inner.streams.remove(&(circ, stream));
        }
    }

    /// Get a channel to the next hop of `circ`, and send it `create`.
    async fn finish_extend(self: Arc<Self>, circ: CircId, target: RelayTarget) {
        if let Err(e) = self.try_extend(circ, &target).await {
            debug!(
                "{}: can't extend circuit {} to {}:{}: {}",
                self.unique_id,
                circ,
                target.host(),
                target.port(),
                e
            );
            self.extend_failed(circ);
        }
    }

    /// Helper for finish_extend().
    async fn try_extend(self: &Arc<Self>, circ: CircId, target: &RelayTarget) -> Result<()> {
        let provider = self
            .provider
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ChanFailed("no channel provider".into()))?;
        let agent = target
            .agent()
            .ok_or_else(|| Error::InternalError("extend target without agent".into()))?;
        let next = provider
            .get_or_launch(agent, target.host(), target.port())
            .await?;

        let caller = self.caller();
        let weak_self = Arc::downgrade(self);
        let weak_next = Arc::downgrade(&next);
        next.endpoint()
            .register_handler(caller, circ, move |resp| {
                Shared::next_hop_response(&weak_self, &weak_next, caller, circ, resp)
            })?;
        next.endpoint()
            .send_cell(caller, Cell::Create(circ).encode()?)?;
        trace!(
            "{}: extending circuit {} over {}",
            self.unique_id,
            circ,
            next.unique_id()
        );
        Ok(())
    }

    /// Put `circ` back into the primed state, and tell the origin that
    /// its extend failed.
    fn extend_failed(&self, circ: CircId) {
        let revert = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match inner.circuits.get_mut(&circ) {
                Some(state @ Incoming::Extending) => {
                    *state = Incoming::Primed;
                    true
                }
                _ => false,
            }
        };
        if revert {
            let failed = relay_failure(circ, StreamId::default(), RelayCmd::EXTEND_FAILED);
            if let Err(e) = self.sender.send(failed) {
                debug!("{}: can't report extend failure: {}", self.unique_id, e);
            }
        }
    }

    /// Tell the next hop that our circuit `circ` is gone.
    fn destroy_onward(&self, next: &Channel, circ: CircId) {
        let r = Cell::Destroy(circ)
            .encode()
            .map_err(Error::from)
            .and_then(|cell| next.endpoint().send_cell(self.caller(), cell));
        if let Err(e) = r {
            debug!(
                "{}: can't destroy circuit {} onward: {}",
                self.unique_id, circ, e
            );
        }
    }

    /// Handle an event on the next hop's part of our circuit `circ`.
    fn next_hop_response(
        weak_self: &Weak<Shared>,
        weak_next: &Weak<Channel>,
        caller: Caller,
        circ: CircId,
        resp: Response,
    ) {
        let this = match weak_self.upgrade() {
            Some(s) => s,
            None => {
                // Our channel is gone.  Don't leave the next hop's
                // circuit dangling.
                if resp.cell.cmd() == CellCmd::CREATED {
                    if let (Some(next), Ok(cell)) = (weak_next.upgrade(), Cell::Destroy(circ).encode()) {
                        let _ = next.endpoint().send_cell(caller, cell);
                    }
                }
                return;
            }
        };

        let failed_create = resp.cell.cmd() == CellCmd::CREATE_FAILED;
        if resp.status == ResponseStatus::Ended || failed_create {
            this.next_hop_ended(weak_next, circ);
            return;
        }

        if resp.cell.cmd() == CellCmd::CREATED {
            let next = weak_next.upgrade();
            let promoted = {
                let mut inner = this.inner.lock().unwrap_or_else(PoisonError::into_inner);
                match (inner.circuits.get_mut(&circ), next.as_ref()) {
                    (Some(state @ Incoming::Extending), Some(next)) => {
                        *state = Incoming::Spliced(Arc::clone(next));
                        true
                    }
                    _ => false,
                }
            };
            if promoted {
                trace!("{}: circuit {} extended", this.unique_id, circ);
                let extended = relay_failure(circ, StreamId::default(), RelayCmd::EXTENDED);
                if let Err(e) = this.sender.send(extended) {
                    debug!("{}: can't report extension: {}", this.unique_id, e);
                }
            } else if let Some(next) = next {
                debug!(
                    "{}: circuit {} went away while extending",
                    this.unique_id, circ
                );
                this.destroy_onward(&next, circ);
            }
            return;
        }

        // Anything else travels back toward the origin.
        let mut cell = resp.cell;
        cell.set_circ_id(circ);
        if let Err(e) = this.sender.send_raw(cell) {
            debug!("{}: can't relay back on circuit {}: {}", this.unique_id, circ, e);
        }
    }

    /// The next hop's part of `circ` has ended.
    fn next_hop_ended(&self, weak_next: &Weak<Channel>, circ: CircId) {
        enum Outcome {
            Revert,
            Destroy,
            Nothing,
        }
        let outcome = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = match inner.circuits.get(&circ) {
                Some(Incoming::Extending) => Outcome::Revert,
                Some(Incoming::Spliced(next))
                    if weak_next
                        .upgrade()
                        .map_or(true, |n| n.same_channel(next)) =>
                {
                    Outcome::Destroy
                }
                _ => Outcome::Nothing,
            };
            if let Outcome::Destroy = outcome {
                inner.circuits.remove(&circ);
                inner.streams.retain(|(c, _), _| *c != circ);
            }
            outcome
        };
        match outcome {
            Outcome::Revert => self.extend_failed(circ),
            Outcome::Destroy => {
                debug!("{}: next hop of circuit {} is gone", self.unique_id, circ);
                if let Err(e) = self.sender.send(Cell::Destroy(circ)) {
                    debug!("{}: can't destroy circuit {}: {}", self.unique_id, circ, e);
                }
            }
            Outcome::Nothing => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::testing::*;
    use super::*;

    fn relay(circ: u16, stream: u16, cmd: RelayCmd, body: &[u8]) -> Cell {
        Cell::Relay(RelayCell::new(
            circ.into(),
            stream.into(),
            cmd,
            bytes::Bytes::copy_from_slice(body),
        ))
    }

    fn empty(circ: u16, stream: u16, cmd: RelayCmd) -> Cell {
        relay(circ, stream, cmd, b"")
    }

    #[tokio::test]
    async fn create_twice() {
        let (_chan, reactor, mut peer) = inbound_from_raw(agent(2), agent(1), None).await;
        tokio::spawn(reactor.run());
        peer.send(Cell::Create(1.into())).await;
        assert_eq!(peer.recv().await, Cell::Created(1.into()));
        peer.send(Cell::Create(1.into())).await;
        assert_eq!(peer.recv().await, Cell::CreateFailed(1.into()));
        peer.send(Cell::Create(0.into())).await;
        assert_eq!(peer.recv().await, Cell::CreateFailed(0.into()));
    }

    #[tokio::test]
    async fn unknown_circuit() {
        let (_chan, reactor, mut peer) = inbound_from_raw(agent(2), agent(1), None).await;
        tokio::spawn(reactor.run());
        peer.send(relay(5, 0, RelayCmd::DATA, b"dropped")).await;
        peer.send(relay(5, 3, RelayCmd::BEGIN, b"a:80\0")).await;
        assert_eq!(peer.recv().await, empty(5, 3, RelayCmd::BEGIN_FAILED));
        peer.send(relay(
            5,
            0,
            RelayCmd::EXTEND,
            &RelayTarget::router("h", 1, agent(3)).encode(),
        ))
        .await;
        assert_eq!(peer.recv().await, empty(5, 0, RelayCmd::EXTEND_FAILED));
    }

    #[tokio::test]
    async fn exit_stream() {
        let (exits, mut accepted) = FakeExits::new();
        let (_chan, reactor, mut peer) = inbound_from_raw_with(agent(2), agent(1), None, exits).await;
        tokio::spawn(reactor.run());
        peer.send(Cell::Create(3.into())).await;
        assert_eq!(peer.recv().await, Cell::Created(3.into()));

        // Ports that don't parse, and hosts that can't be reached.
        peer.send(relay(3, 1, RelayCmd::BEGIN, b"example.com:http\0")).await;
        assert_eq!(peer.recv().await, empty(3, 1, RelayCmd::BEGIN_FAILED));
        peer.send(relay(3, 2, RelayCmd::BEGIN, b"unreachable:80\0")).await;
        assert_eq!(peer.recv().await, empty(3, 2, RelayCmd::BEGIN_FAILED));

        peer.send(relay(3, 7, RelayCmd::BEGIN, b"example.com:80\0")).await;
        assert_eq!(peer.recv().await, empty(3, 7, RelayCmd::CONNECTED));
        let (host, port, mut far) = accepted.next_exit().await;
        assert_eq!((host.as_str(), port), ("example.com", 80));

        // Same stream again: refused.
        peer.send(relay(3, 7, RelayCmd::BEGIN, b"example.com:80\0")).await;
        assert_eq!(peer.recv().await, empty(3, 7, RelayCmd::BEGIN_FAILED));

        peer.send(relay(3, 7, RelayCmd::DATA, b"GET / HTTP/1.0\r\n\r\n")).await;
        let mut got = vec![0_u8; 18];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], b"GET / HTTP/1.0\r\n\r\n");

        far.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        assert_eq!(
            peer.recv().await,
            relay(3, 7, RelayCmd::DATA, b"HTTP/1.0 200 OK\r\n")
        );

        // The destination closes: the origin hears `end`.
        drop(far);
        assert_eq!(peer.recv().await, empty(3, 7, RelayCmd::END));
    }

    #[tokio::test]
    async fn end_and_destroy_close_exits() {
        let (exits, mut accepted) = FakeExits::new();
        let (_chan, reactor, mut peer) = inbound_from_raw_with(agent(2), agent(1), None, exits).await;
        tokio::spawn(reactor.run());
        peer.send(Cell::Create(3.into())).await;
        assert_eq!(peer.recv().await, Cell::Created(3.into()));
        peer.send(relay(3, 1, RelayCmd::BEGIN, b"a:1\0")).await;
        assert_eq!(peer.recv().await, empty(3, 1, RelayCmd::CONNECTED));
        peer.send(relay(3, 2, RelayCmd::BEGIN, b"b:2\0")).await;
        assert_eq!(peer.recv().await, empty(3, 2, RelayCmd::CONNECTED));
        let (_, _, mut far1) = accepted.next_exit().await;
        let (_, _, mut far2) = accepted.next_exit().await;

        peer.send(empty(3, 1, RelayCmd::END)).await;
        let mut rest = Vec::new();
        far1.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        peer.send(Cell::Destroy(3.into())).await;
        far2.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn extend_and_splice() {
        // p -> x -> q, with x under test.
        let provider = OneChannelProvider::new();
        let weak: Weak<dyn ChannelProvider> = Arc::downgrade(&provider) as _;
        let (_x_in, reactor, mut p) = inbound_from_raw(agent(2), agent(1), Some(weak.clone())).await;
        tokio::spawn(reactor.run());
        let (x_out, reactor_out, mut q) =
            outbound_to_raw_with(agent(2), agent(3), Some(weak), FakeExits::new().0).await;
        tokio::spawn(reactor_out.run());
        provider.set(Arc::clone(&x_out));

        p.send(Cell::Create(1.into())).await;
        assert_eq!(p.recv().await, Cell::Created(1.into()));
        let target = RelayTarget::router("q.example", 4000, agent(3)).encode();
        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;

        // x asks q for a circuit, with its own ID.
        let hop = match q.recv().await {
            Cell::Create(id) => id,
            other => panic!("{}", other),
        };
        assert_eq!(hop, CircId::from(1));
        assert_eq!(provider.asked(), vec![(agent(3), "q.example".to_string(), 4000)]);

        // A second extend while the first is pending is refused.
        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTEND_FAILED));

        q.send(Cell::Created(hop)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTENDED));

        // Relay cells both ways, renumbered.
        p.send(relay(1, 4, RelayCmd::BEGIN, b"example.com:80\0")).await;
        assert_eq!(q.recv().await, relay(hop.into(), 4, RelayCmd::BEGIN, b"example.com:80\0"));
        q.send(empty(hop.into(), 4, RelayCmd::CONNECTED)).await;
        assert_eq!(p.recv().await, empty(1, 4, RelayCmd::CONNECTED));

        // Destroy from the far side comes back to p.
        q.send(Cell::Destroy(hop)).await;
        assert_eq!(p.recv().await, Cell::Destroy(1.into()));
        assert_eq!(x_out.endpoint().n_circuits(), 0);
    }

    #[tokio::test]
    async fn extend_failures() {
        let provider = OneChannelProvider::new();
        let weak: Weak<dyn ChannelProvider> = Arc::downgrade(&provider) as _;
        let (_x_in, reactor, mut p) = inbound_from_raw(agent(2), agent(1), Some(weak.clone())).await;
        tokio::spawn(reactor.run());

        p.send(Cell::Create(1.into())).await;
        assert_eq!(p.recv().await, Cell::Created(1.into()));
        let target = RelayTarget::router("q.example", 4000, agent(3)).encode();

        // No channel to be had.
        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTEND_FAILED));

        // The next hop refuses the create; the circuit stays usable.
        let (x_out, reactor_out, mut q) =
            outbound_to_raw_with(agent(2), agent(3), Some(weak), FakeExits::new().0).await;
        tokio::spawn(reactor_out.run());
        provider.set(Arc::clone(&x_out));
        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;
        let hop = match q.recv().await {
            Cell::Create(id) => id,
            other => panic!("{}", other),
        };
        q.send(Cell::CreateFailed(hop)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTEND_FAILED));

        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;
        let hop = match q.recv().await {
            Cell::Create(id) => id,
            other => panic!("{}", other),
        };
        q.send(Cell::Created(hop)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTENDED));

        // p tears the circuit down; q hears about it.
        p.send(Cell::Destroy(1.into())).await;
        assert_eq!(q.recv().await, Cell::Destroy(hop));
    }

    #[tokio::test]
    async fn closing_channel_destroys_onward() {
        let provider = OneChannelProvider::new();
        let weak: Weak<dyn ChannelProvider> = Arc::downgrade(&provider) as _;
        let (x_in, reactor, mut p) = inbound_from_raw(agent(2), agent(1), Some(weak.clone())).await;
        let h = tokio::spawn(reactor.run());
        let (x_out, reactor_out, mut q) =
            outbound_to_raw_with(agent(2), agent(3), Some(weak), FakeExits::new().0).await;
        tokio::spawn(reactor_out.run());
        provider.set(Arc::clone(&x_out));

        p.send(Cell::Create(1.into())).await;
        assert_eq!(p.recv().await, Cell::Created(1.into()));
        let target = RelayTarget::router("q.example", 4000, agent(3)).encode();
        p.send(relay(1, 0, RelayCmd::EXTEND, &target)).await;
        let hop = match q.recv().await {
            Cell::Create(id) => id,
            other => panic!("{}", other),
        };
        q.send(Cell::Created(hop)).await;
        assert_eq!(p.recv().await, empty(1, 0, RelayCmd::EXTENDED));

        x_in.terminate();
        h.await.unwrap().unwrap();
        assert_eq!(q.recv().await, Cell::Destroy(hop));
        assert_eq!(provider.closed(), vec![x_in.unique_id()]);
    }
}
