//! Outgoing circuit correlation for one channel.
//!
//! A [`CircuitEndpoint`] holds every circuit that we opened toward the
//! peer of its channel.  The "caller" of a circuit is whoever owns the
//! other side of it: the local circuit builder, or another channel whose
//! circuit we are extending.  Callers keep using their own circuit IDs;
//! the endpoint renumbers cells on the way out and hands the peer's
//! replies back to the caller's handler.
//!
//! At most one request that needs an answer (a `create`, or an `extend`)
//! can be outstanding on a circuit.  While one is, the circuit has an
//! armed timer; if the timer fires first, the circuit is dropped and its
//! handler is told it has ended.

use super::circmap::{CircIdRange, CircMap, Timer};
use super::{CellSender, UniqId};
use crate::{Error, Result};
use tor61_cell::check::{expects_reply, matching_failure};
use tor61_cell::{Cell, CellCmd, CircId, RawCell};

use tracing::{debug, warn};

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Who a circuit on an endpoint belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Caller {
    /// The circuit was opened by this router's own circuit builder.
    Origin,
    /// The circuit extends a circuit that arrived on another channel.
    Channel(UniqId),
}

/// What kind of event a [`Response`] reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The peer sent us a cell on this circuit.
    Success,
    /// We refused to send a request, because another one was still
    /// outstanding.  The cell is the failure the peer would have sent.
    Failure,
    /// The circuit is gone: the peer destroyed it or refused to create
    /// it, the request timed out, or the channel closed.
    Ended,
}

/// An event on an outgoing circuit, as given to its handler.
#[derive(Clone, Debug)]
pub struct Response {
    /// What happened.
    pub status: ResponseStatus,
    /// The cell that describes it.  Its circuit ID is the one used on
    /// this channel, not the caller's.
    pub cell: RawCell,
}

/// A callback that receives every [`Response`] for one circuit.
pub(super) type ResponseHandler = Box<dyn FnMut(Response) + Send>;

/// The table of circuits that we opened on a channel.
#[derive(Clone)]
pub struct CircuitEndpoint {
    /// Shared state, also reachable from timer tasks.
    inner: Arc<EndpointInner>,
}

/// Implementation type for a [`CircuitEndpoint`].
struct EndpointInner {
    /// The channel this endpoint sends on, for logging.
    unique_id: UniqId,
    /// Where outgoing cells go.
    sender: CellSender,
    /// How long to wait for an answer to a request.
    timeout: Duration,
    /// The circuits themselves.
    map: Mutex<CircMap>,
}

/// Give `response` to `handler`.
///
/// Must never be called while holding the map lock.
fn deliver(handler: &Mutex<ResponseHandler>, response: Response) {
    let mut h = handler.lock().unwrap_or_else(PoisonError::into_inner);
    (*h)(response);
}

/// Build the notification that tells a handler its circuit `hop` ended.
fn ended(hop: CircId) -> Option<Response> {
    match Cell::Destroy(hop).encode() {
        Ok(cell) => Some(Response {
            status: ResponseStatus::Ended,
            cell,
        }),
        Err(_) => None,
    }
}

impl CircuitEndpoint {
    /// Construct an empty endpoint for the channel `unique_id`.
    pub(super) fn new(
        unique_id: UniqId,
        range: CircIdRange,
        sender: CellSender,
        timeout: Duration,
    ) -> Self {
        CircuitEndpoint {
            inner: Arc::new(EndpointInner {
                unique_id,
                sender,
                timeout,
                map: Mutex::new(CircMap::new(range)),
            }),
        }
    }

    /// Register `handler` to receive everything that happens on a new
    /// circuit for `caller`'s circuit `prior`, and return the ID that the
    /// circuit will have on this channel.
    ///
    /// If `caller` already had a circuit here for `prior`, it is replaced.
    pub fn register_handler<F>(&self, caller: Caller, prior: CircId, handler: F) -> Result<CircId>
    where
        F: FnMut(Response) + Send + 'static,
    {
        let mut map = self.inner.map.lock()?;
        if map.closed {
            return Err(Error::ChannelClosed);
        }
        let id = map.add_ent(caller, prior, Box::new(handler))?;
        debug!(
            "{}: circuit {} for {:?} circuit {}",
            self.inner.unique_id, id, caller, prior
        );
        Ok(id)
    }

    /// Return the ID that `caller`'s circuit `prior` has on this channel.
    pub fn lookup(&self, caller: Caller, prior: CircId) -> Option<CircId> {
        self.inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(caller, prior)
    }

    /// Return the number of circuits open on this endpoint.
    pub fn n_circuits(&self) -> usize {
        self.inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send `cell` for `caller`.
    ///
    /// The cell carries the caller's circuit ID; it goes out with the ID
    /// that was registered for it here.  A `destroy` removes the circuit
    /// once it is sent.
    ///
    /// If the cell needs an answer and another request on the same
    /// circuit is still waiting for one, the cell is not sent: the
    /// circuit's handler gets a [`ResponseStatus::Failure`] instead.
    pub fn send_cell(&self, caller: Caller, mut cell: RawCell) -> Result<()> {
        let prior = cell.circ_id();
        let mut map = self.inner.map.lock()?;
        let hop = match map.lookup(caller, prior) {
            Some(hop) => hop,
            None => {
                warn!(
                    "{}: no circuit for {:?} circuit {}: not sending {}",
                    self.inner.unique_id,
                    caller,
                    prior,
                    cell.cmd()
                );
                return Err(Error::UnmappedCircuit(prior));
            }
        };
        cell.set_circ_id(hop);

        if expects_reply(&cell) {
            let seq = map.next_seq();
            let slot = map
                .get_mut(hop)
                .ok_or_else(|| Error::InternalError("mapped circuit has no slot".into()))?;
            if slot.timer.is_some() {
                let handler = Arc::clone(&slot.handler);
                drop(map);
                debug!(
                    "{}: circuit {} is busy; refusing to send {}",
                    self.inner.unique_id, hop, cell
                );
                let failure = matching_failure(&cell).encode()?;
                deliver(
                    &handler,
                    Response {
                        status: ResponseStatus::Failure,
                        cell: failure,
                    },
                );
                return Ok(());
            }
            let handle = self.arm_timer(hop, seq);
            slot.timer = Some(Timer::new(handle, seq));
        }

        let is_destroy = cell.cmd() == CellCmd::DESTROY;
        self.inner.sender.send_raw(cell)?;
        if is_destroy {
            map.remove(hop);
        }
        Ok(())
    }

    /// Start a timer that ends circuit `hop` unless it is cancelled.
    fn arm_timer(&self, hop: CircId, seq: u64) -> tokio::task::JoinHandle<()> {
        let weak: Weak<EndpointInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.timeout_fired(hop, seq);
            }
        })
    }

    /// Return true if `id` is a circuit that we opened on this channel.
    pub(crate) fn is_my_circuit(&self, id: CircId) -> bool {
        self.inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Handle a cell that the peer sent on one of our circuits.
    pub(crate) fn handle_response(&self, cell: RawCell) {
        let hop = cell.circ_id();
        let ends = cell.cmd() == CellCmd::DESTROY || cell.cmd() == CellCmd::CREATE_FAILED;
        let mut map = self
            .inner
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handler = if ends {
            map.remove(hop).map(|slot| slot.handler)
        } else {
            map.get_mut(hop).map(|slot| {
                slot.cancel_timer();
                Arc::clone(&slot.handler)
            })
        };
        drop(map);

        let handler = match handler {
            Some(h) => h,
            None => {
                debug!(
                    "{}: {} on circuit {} that is already gone",
                    self.inner.unique_id,
                    cell.cmd(),
                    hop
                );
                return;
            }
        };
        let status = if ends {
            ResponseStatus::Ended
        } else {
            ResponseStatus::Success
        };
        deliver(&handler, Response { status, cell });
    }

    /// Tell every circuit on this endpoint that it has ended, and refuse
    /// any new ones.
    pub(crate) fn cleanup(&self) {
        let drained = {
            let mut map = self
                .inner
                .map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.closed = true;
            map.drain()
        };
        for (hop, slot) in drained {
            if let Some(resp) = ended(hop) {
                deliver(&slot.handler, resp);
            }
        }
    }
}

impl EndpointInner {
    /// Called when the timer for circuit `hop` fires.
    fn timeout_fired(&self, hop: CircId, seq: u64) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let current = match map.get_mut(hop) {
            Some(slot) if slot.timer.as_ref().map(|t| t.seq) == Some(seq) => {
                // Don't abort the task we're running in.
                slot.timer.take();
                true
            }
            _ => false,
        };
        if !current {
            return;
        }
        let slot = map.remove(hop);
        drop(map);
        debug!(
            "{}: no answer on circuit {}; giving up on it",
            self.unique_id, hop
        );
        if let (Some(slot), Some(resp)) = (slot, ended(hop)) {
            deliver(&slot.handler, resp);
        }
    }
}
