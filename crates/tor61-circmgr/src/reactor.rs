//! The task that builds our circuit and runs its streams.
//!
//! Everything about the circuit lives here, and is touched only from
//! this task.  The [`CircuitBuilder`](crate::CircuitBuilder) and stream
//! handles talk to it with [`CtrlMsg`]s; channel launches and the
//! circuit's response handler report back with [`Update`]s.
//!
//! Every attempt at a first hop gets a new local circuit ID and a new
//! generation number.  Updates from an older generation are about a
//! circuit we've already given up on, and are ignored.

use crate::err::BuildFailure;
use crate::streams::{self, StreamEvent, StreamMap};
use crate::{CircStatus, CircuitConfig, Error, PickRouter, Result};
use tor61_cell::{Cell, CellCmd, CircId, RawCell, RelayCell, RelayCmd, RelayTarget, StreamId};
use tor61_dirclient::RouterInfo;
use tor61_proto::channel::{Caller, Channel, ChannelProvider, Response, ResponseStatus};

use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use std::sync::Arc;

/// A message telling the reactor to do something.
pub(crate) enum CtrlMsg {
    /// Open a stream to `target`, and report what happens on it to
    /// `events`.
    OpenStream {
        /// Where the stream goes.
        target: RelayTarget,
        /// Where its events go.
        events: mpsc::UnboundedSender<StreamEvent>,
        /// Where to send the new stream's ID.
        reply: oneshot::Sender<Result<StreamId>>,
    },
    /// Queue bytes on a stream.
    Write(StreamId, Bytes),
    /// Queue an `end` on a stream.
    End(StreamId),
    /// Drop a stream right away.
    Close(StreamId),
    /// Tell us when the circuit is complete.
    WaitReady(oneshot::Sender<Result<()>>),
    /// Report on the circuit.
    Status(oneshot::Sender<CircStatus>),
    /// Shut down the reactor.
    Shutdown,
}

/// News for the reactor from the tasks and handlers it started.
pub(crate) enum Update {
    /// A channel launch for the first hop finished.
    Launched {
        /// The generation that asked for the channel.
        gen: u64,
        /// The channel, or why we couldn't get one.
        result: tor61_proto::Result<Arc<Channel>>,
    },
    /// Something happened on our circuit.
    Response {
        /// The generation whose handler saw this.
        gen: u64,
        /// What happened.
        response: Response,
    },
}

/// The request that we're waiting on, if any.
enum Pending {
    /// Nothing: the circuit is complete, or we're waiting to retry.
    Idle,
    /// Getting a channel to a first hop.
    Connecting(RouterInfo),
    /// We sent `create`, and we're waiting for `created`.
    Creating(RouterInfo),
    /// We sent `extend`, and we're waiting for `extended`.
    Extending(RouterInfo),
}

/// What to do when the retry timer fires.
#[derive(Copy, Clone, Debug)]
enum Step {
    /// Start over from the first hop.
    FirstHop,
    /// Try to add another hop to what we have.
    Extend,
}

/// Send `cell` on our circuit over `entry`.
///
/// Returns false if it couldn't be sent.
fn send_cell(entry: &Channel, cell: &RawCell) -> bool {
    match entry.endpoint().send_cell(Caller::Origin, cell.clone()) {
        Ok(()) => true,
        Err(e) => {
            debug!("{}: couldn't send {}: {}", entry.unique_id(), cell.cmd(), e);
            false
        }
    }
}

/// Object that builds a circuit and runs its streams.
///
/// You need to spawn a task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the circuit won't get built."]
pub(crate) struct Reactor {
    /// Requests from the circuit and stream handles.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// News from channel launches and response handlers.
    updates: mpsc::UnboundedReceiver<Update>,
    /// A sender for `updates`, to hand out.
    update_tx: mpsc::UnboundedSender<Update>,
    /// Where we get channels to first hops.
    provider: Arc<dyn ChannelProvider>,
    /// Where we get routers to add.
    picker: Arc<dyn PickRouter>,
    /// Our configuration.
    config: CircuitConfig,
    /// The local ID of the circuit we're building or using.
    circ_id: CircId,
    /// Generation of the current first-hop attempt.
    gen: u64,
    /// The channel to the first hop, once we have one.
    entry: Option<Arc<Channel>>,
    /// The routers confirmed on the circuit, in order.
    hops: Vec<RouterInfo>,
    /// The request we're waiting on.
    pending: Pending,
    /// When to retry, and what.
    retry: Option<(Instant, Step)>,
    /// Routers that have failed us.  They stay here for as long as the
    /// circuit exists.
    invalid: Vec<tor61_cell::Agent>,
    /// How many hops we've tried to add since the circuit was last
    /// complete.
    attempts: u32,
    /// Why those attempts failed.
    failures: Vec<BuildFailure>,
    /// The streams on this circuit.
    streams: StreamMap,
    /// Everybody waiting for the circuit to be complete.
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Reactor {
    /// Construct a new reactor.
    pub(crate) fn new(
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        provider: Arc<dyn ChannelProvider>,
        picker: Arc<dyn PickRouter>,
        config: CircuitConfig,
    ) -> Self {
        let (update_tx, updates) = mpsc::unbounded();
        Reactor {
            control,
            updates,
            update_tx,
            provider,
            picker,
            config,
            circ_id: CircId::default(),
            gen: 0,
            entry: None,
            hops: Vec::new(),
            pending: Pending::Idle,
            retry: None,
            invalid: Vec::new(),
            attempts: 0,
            failures: Vec::new(),
            streams: StreamMap::new(),
            waiters: Vec::new(),
        }
    }

    /// Build the circuit, and keep it built, until we're told to stop
    /// or we run out of attempts.
    pub(crate) async fn run(mut self) {
        let reason = match self.launch_first_hop() {
            Ok(()) => self.run_loop().await,
            Err(e) => e,
        };
        self.shut_down(reason);
    }

    /// Helper for run(): handle events until something ends the circuit.
    async fn run_loop(&mut self) -> Error {
        loop {
            let retry_at = self.retry.map(|(when, _)| when);
            let wake = retry_at.unwrap_or_else(Instant::now);
            let outcome = tokio::select! {
                biased;
                Some(update) = self.updates.next() => self.handle_update(update),
                msg = self.control.next() => match msg {
                    Some(msg) => self.handle_ctrl(msg),
                    None => Err(Error::CircuitClosed), // every handle is gone.
                },
                _ = sleep_until(wake), if retry_at.is_some() => self.retry_now(),
            };
            if let Err(e) = outcome {
                return e;
            }
        }
    }

    /// Return the number of hops a complete circuit has.
    fn target_len(&self) -> usize {
        std::cmp::max(self.config.length, 1)
    }

    /// Return true if the circuit is complete.
    fn is_complete(&self) -> bool {
        self.hops.len() >= self.target_len()
    }

    /// Return a report on the circuit.
    fn status(&self) -> CircStatus {
        CircStatus {
            circ_id: self.circ_id,
            length: self.hops.len(),
            target_length: self.target_len(),
            hops: self.hops.iter().map(|r| r.agent).collect(),
            invalid: self.invalid.clone(),
            failures: self.failures.clone(),
            streams: self.streams.statuses(),
        }
    }

    /// Handle a request from a handle.
    fn handle_ctrl(&mut self, msg: CtrlMsg) -> Result<()> {
        match msg {
            CtrlMsg::OpenStream {
                target,
                events,
                reply,
            } => {
                let r = self.streams.add(self.circ_id, &target, events);
                if let Ok(id) = r {
                    debug!(
                        "Circ {}: stream {} to {}:{}",
                        self.circ_id,
                        id,
                        target.host(),
                        target.port()
                    );
                    self.flush_stream(id);
                }
                // The caller may have given up.
                let _ = reply.send(r);
            }
            CtrlMsg::Write(id, data) => {
                let circ = self.circ_id;
                let r = match self.streams.get_mut(id) {
                    Some(ent) => ent.queue_data(circ, id, data),
                    None => Err(Error::StreamClosed),
                };
                match r {
                    Ok(()) => self.flush_stream(id),
                    Err(e) => debug!("Circ {}: not writing on stream {}: {}", circ, id, e),
                }
            }
            CtrlMsg::End(id) => {
                let circ = self.circ_id;
                let r = match self.streams.get_mut(id) {
                    Some(ent) => ent.queue_end(circ, id),
                    None => Err(Error::StreamClosed),
                };
                match r {
                    Ok(()) => self.flush_stream(id),
                    Err(e) => debug!("Circ {}: can't end stream {}: {}", circ, id, e),
                }
            }
            CtrlMsg::Close(id) => self.close_stream(id),
            CtrlMsg::WaitReady(tx) => {
                if self.is_complete() {
                    let _ = tx.send(Ok(()));
                } else {
                    self.waiters.push(tx);
                }
            }
            CtrlMsg::Status(tx) => {
                let _ = tx.send(self.status());
            }
            CtrlMsg::Shutdown => return Err(Error::CircuitClosed),
        }
        Ok(())
    }

    /// Handle news from a channel launch or from the circuit.
    fn handle_update(&mut self, update: Update) -> Result<()> {
        match update {
            Update::Launched { gen, result } if gen == self.gen => self.channel_launched(result),
            Update::Response { gen, response } if gen == self.gen => {
                self.handle_response(response)
            }
            _ => {
                trace!("Circ {}: ignoring news about an old circuit", self.circ_id);
                Ok(())
            }
        }
    }

    /// Give up if we've made as many attempts as we're allowed.
    fn check_attempts(&self) -> Result<()> {
        match self.config.max_attempts {
            Some(max) if self.attempts >= std::cmp::max(max, 1) => Err(Error::RetriesExhausted {
                attempts: self.attempts,
                failures: self.failures.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Count an attempt to add a hop, or give up if we've made too many.
    fn note_attempt(&mut self) -> Result<()> {
        self.check_attempts()?;
        self.attempts += 1;
        Ok(())
    }

    /// Throw away whatever circuit we have, and start a new one at a
    /// first hop.
    fn launch_first_hop(&mut self) -> Result<()> {
        self.note_attempt()?;
        self.destroy_current();
        self.hops.clear();
        self.entry = None;
        self.gen += 1;
        self.circ_id = match u16::from(self.circ_id).wrapping_add(1) {
            0 => 1.into(),
            n => n.into(),
        };
        self.streams.reset_all(self.circ_id);

        let router = self.picker.pick_router(&self.invalid);
        debug!(
            "Circ {}: trying {} at {}:{} as first hop",
            self.circ_id, router.agent, router.host, router.port
        );
        self.pending = Pending::Connecting(router.clone());

        let provider = Arc::clone(&self.provider);
        let tx = self.update_tx.clone();
        let gen = self.gen;
        tokio::spawn(async move {
            let result = provider
                .get_or_launch(router.agent, &router.host, router.port)
                .await;
            // The reactor may be gone.
            let _ = tx.unbounded_send(Update::Launched { gen, result });
        });
        Ok(())
    }

    /// Called when we have (or failed to get) a channel to the first hop.
    fn channel_launched(&mut self, result: tor61_proto::Result<Arc<Channel>>) -> Result<()> {
        let router = match std::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Connecting(router) => router,
            other => {
                self.pending = other;
                return Ok(());
            }
        };
        let chan = match result {
            Ok(chan) => chan,
            Err(e) => {
                return self.build_failed(
                    BuildFailure::Connect(router.agent, e.to_string()),
                    Step::FirstHop,
                )
            }
        };
        self.entry = Some(Arc::clone(&chan));
        if let Err(e) = self.send_create(&chan) {
            return self.build_failed(
                BuildFailure::Connect(router.agent, e.to_string()),
                Step::FirstHop,
            );
        }
        self.pending = Pending::Creating(router);
        Ok(())
    }

    /// Register for responses on `chan`, and send our `create`.
    fn send_create(&self, chan: &Channel) -> Result<()> {
        let tx = self.update_tx.clone();
        let gen = self.gen;
        chan.endpoint()
            .register_handler(Caller::Origin, self.circ_id, move |response| {
                // The reactor may be gone.
                let _ = tx.unbounded_send(Update::Response { gen, response });
            })?;
        let create = Cell::Create(self.circ_id).encode()?;
        chan.endpoint().send_cell(Caller::Origin, create)?;
        Ok(())
    }

    /// Try to add one more hop to the circuit.
    fn launch_extend(&mut self) -> Result<()> {
        let entry = match &self.entry {
            Some(entry) => Arc::clone(entry),
            None => return self.launch_first_hop(),
        };
        self.note_attempt()?;
        let router = self.picker.pick_router(&self.invalid);
        debug!(
            "Circ {}: extending to {} at {}:{}",
            self.circ_id, router.agent, router.host, router.port
        );
        let target = RelayTarget::router(router.host.clone(), router.port, router.agent);
        let extend = RelayCell::new(
            self.circ_id,
            StreamId::default(),
            RelayCmd::EXTEND,
            target.encode(),
        );
        let cell = match Cell::Relay(extend).encode() {
            Ok(cell) => cell,
            Err(e) => {
                warn!("Circ {}: can't encode extend: {}", self.circ_id, e);
                return self.build_failed(BuildFailure::ExtendFailed(router.agent), Step::Extend);
            }
        };
        self.pending = Pending::Extending(router);
        // If this fails, the circuit is gone, and its handler will say so.
        send_cell(&entry, &cell);
        Ok(())
    }

    /// Blame a router for a failed attempt, and schedule another.
    fn build_failed(&mut self, failure: BuildFailure, step: Step) -> Result<()> {
        info!("Circ {}: {}", self.circ_id, failure);
        let agent = failure.router();
        if !self.invalid.contains(&agent) {
            self.invalid.push(agent);
        }
        self.failures.push(failure);
        self.pending = Pending::Idle;
        self.schedule(step)
    }

    /// Arrange to take `step` once the retry delay has passed.
    fn schedule(&mut self, step: Step) -> Result<()> {
        self.check_attempts()?;
        self.retry = Some((Instant::now() + self.config.retry_delay, step));
        Ok(())
    }

    /// Called when the retry timer fires.
    fn retry_now(&mut self) -> Result<()> {
        match self.retry.take() {
            Some((_, Step::FirstHop)) => self.launch_first_hop(),
            Some((_, Step::Extend)) => self.launch_extend(),
            None => Ok(()),
        }
    }

    /// Tell the first hop to tear down our circuit, if it still has it.
    fn destroy_current(&mut self) {
        if let Some(entry) = self.entry.take() {
            if entry.endpoint().lookup(Caller::Origin, self.circ_id).is_some() {
                if let Ok(cell) = Cell::Destroy(self.circ_id).encode() {
                    send_cell(&entry, &cell);
                }
            }
        }
    }

    /// Handle something that happened on the circuit.
    fn handle_response(&mut self, response: Response) -> Result<()> {
        let cell = response.cell;
        trace!(
            "Circ {}: {:?} response: {}",
            self.circ_id,
            response.status,
            cell
        );
        if response.status == ResponseStatus::Ended {
            return self.circuit_ended(&cell);
        }
        match cell.cmd() {
            CellCmd::CREATED => match std::mem::replace(&mut self.pending, Pending::Idle) {
                Pending::Creating(router) => {
                    debug!("Circ {}: first hop {} is up", self.circ_id, router.agent);
                    self.hops.push(router);
                    self.advance()
                }
                other => {
                    self.pending = other;
                    debug!("Circ {}: unexpected created", self.circ_id);
                    Ok(())
                }
            },
            // We only see this when the endpoint refused a second create.
            CellCmd::CREATE_FAILED => match std::mem::replace(&mut self.pending, Pending::Idle) {
                Pending::Creating(router) => {
                    self.build_failed(BuildFailure::CreateFailed(router.agent), Step::FirstHop)
                }
                other => {
                    self.pending = other;
                    Ok(())
                }
            },
            CellCmd::RELAY => self.handle_relay(&cell),
            other => {
                debug!("Circ {}: unexpected {} cell", self.circ_id, other);
                Ok(())
            }
        }
    }

    /// Handle a relay cell on the circuit.
    ///
    /// Stream zero carries the replies to our `extend`s.
    fn handle_relay(&mut self, cell: &RawCell) -> Result<()> {
        let (id, cmd) = match (cell.stream_id(), cell.relay_cmd()) {
            (Some(id), Some(cmd)) => (id, cmd),
            _ => return Ok(()),
        };
        if !id.is_zero() {
            self.stream_cell(id, cmd, cell);
            return Ok(());
        }
        match (cmd, std::mem::replace(&mut self.pending, Pending::Idle)) {
            (RelayCmd::EXTENDED, Pending::Extending(router)) => {
                debug!("Circ {}: extended to {}", self.circ_id, router.agent);
                self.hops.push(router);
                self.advance()
            }
            (RelayCmd::EXTEND_FAILED, Pending::Extending(router)) => {
                self.build_failed(BuildFailure::ExtendFailed(router.agent), Step::Extend)
            }
            (cmd, other) => {
                self.pending = other;
                debug!("Circ {}: unexpected {} on stream 0", self.circ_id, cmd);
                Ok(())
            }
        }
    }

    /// Called when the circuit is gone: the first hop destroyed it or
    /// refused it, a request timed out, or the channel closed.
    ///
    /// If we were still waiting on a router we were adding, it is blamed.
    /// Either way, every stream goes back to primed, and we start over.
    fn circuit_ended(&mut self, cell: &RawCell) -> Result<()> {
        let pending = std::mem::replace(&mut self.pending, Pending::Idle);
        let was_complete = self.is_complete();
        // The endpoint has already forgotten the circuit.
        self.entry = None;
        self.retry = None;
        let blamed = match pending {
            Pending::Connecting(r) | Pending::Creating(r) | Pending::Extending(r) => Some(r.agent),
            // Waiting out a retry: the router we tried last is already
            // invalid, and the hops we have did nothing wrong.
            Pending::Idle => None,
        };
        self.hops.clear();
        self.streams.reset_all(self.circ_id);

        if was_complete {
            info!("Circ {}: circuit lost; rebuilding", self.circ_id);
            self.failures.clear();
            return self.schedule(Step::FirstHop);
        }
        match blamed {
            Some(agent) if cell.cmd() == CellCmd::CREATE_FAILED => {
                self.build_failed(BuildFailure::CreateFailed(agent), Step::FirstHop)
            }
            Some(agent) => self.build_failed(BuildFailure::Ended(agent), Step::FirstHop),
            None => self.schedule(Step::FirstHop),
        }
    }

    /// Called when a hop has been added: extend again, or, if the
    /// circuit is complete, start sending.
    fn advance(&mut self) -> Result<()> {
        if !self.is_complete() {
            return self.launch_extend();
        }
        let path: Vec<String> = self.hops.iter().map(|r| r.agent.to_string()).collect();
        info!(
            "Circ {}: circuit complete through {}",
            self.circ_id,
            path.join(", ")
        );
        self.attempts = 0;
        for w in self.waiters.drain(..) {
            let _ = w.send(Ok(()));
        }
        self.flush_all();
        Ok(())
    }

    /// Handle a relay cell for stream `id`.
    fn stream_cell(&mut self, id: StreamId, cmd: RelayCmd, cell: &RawCell) {
        let circ = self.circ_id;
        let ent = match self.streams.get_mut(id) {
            Some(ent) => ent,
            None => {
                debug!("Circ {}: {} on unknown stream {}", circ, cmd, id);
                return;
            }
        };
        match cmd {
            RelayCmd::CONNECTED => {
                if !ent.note_connected() {
                    debug!("Circ {}: unexpected connected on stream {}", circ, id);
                    return;
                }
                debug!("Circ {}: stream {} connected", circ, id);
                if ent.emit(StreamEvent::Connected) {
                    self.flush_stream(id);
                } else {
                    self.close_stream(id);
                }
            }
            RelayCmd::DATA => {
                if !ent.accepts_data() {
                    debug!(
                        "Circ {}: dropping data on stream {} in state {:?}",
                        circ,
                        id,
                        ent.status()
                    );
                    return;
                }
                let body = Bytes::copy_from_slice(cell.relay_body().unwrap_or(&[]));
                if !ent.emit(StreamEvent::Data(body)) {
                    self.close_stream(id);
                }
            }
            RelayCmd::END | RelayCmd::BEGIN_FAILED => {
                debug!("Circ {}: exit closed stream {} ({})", circ, id, cmd);
                self.streams.close(id);
            }
            other => debug!("Circ {}: unexpected {} on stream {}", circ, other, id),
        }
    }

    /// Send whatever stream `id` may send now.
    fn flush_stream(&mut self, id: StreamId) {
        let entry = match &self.entry {
            Some(entry) if self.is_complete() && !entry.is_closing() => Arc::clone(entry),
            _ => return,
        };
        let finished = match self.streams.get_mut(id) {
            Some(ent) => ent.flush(|cell| send_cell(&entry, cell)),
            None => return,
        };
        if finished {
            debug!("Circ {}: stream {} finished", self.circ_id, id);
            self.streams.close(id);
        }
    }

    /// Send whatever every stream may send now.
    fn flush_all(&mut self) {
        for id in self.streams.ids() {
            self.flush_stream(id);
        }
    }

    /// Drop stream `id`, telling the exit if it knows about the stream.
    fn close_stream(&mut self, id: StreamId) {
        let begun = match self.streams.get_mut(id) {
            Some(ent) => ent.has_begun(),
            None => return,
        };
        self.streams.close(id);
        debug!("Circ {}: closed stream {}", self.circ_id, id);
        if let (true, Some(entry)) = (begun, &self.entry) {
            if let Ok(end) = streams::stream_cell(self.circ_id, id, RelayCmd::END, Bytes::new()) {
                send_cell(entry, &end);
            }
        }
    }

    /// Tear everything down, because of `reason`.
    fn shut_down(mut self, reason: Error) {
        match &reason {
            Error::CircuitClosed => info!("Circ {}: closing", self.circ_id),
            e => warn!("Circ {}: {}", self.circ_id, e),
        }
        self.destroy_current();
        self.streams.close_all();
        for w in self.waiters.drain(..) {
            let e = match &reason {
                Error::RetriesExhausted { attempts, failures } => Error::RetriesExhausted {
                    attempts: *attempts,
                    failures: failures.clone(),
                },
                _ => Error::CircuitClosed,
            };
            let _ = w.send(Err(e));
        }
    }
}
