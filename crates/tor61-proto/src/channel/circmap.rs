//! Types and code to map outgoing circuit IDs to their owners.
//!
//! Each channel has one [`CircMap`], owned by its
//! [`CircuitEndpoint`](super::CircuitEndpoint).  An entry is an arena
//! record for one outgoing circuit: who asked for it, where its replies
//! go, and the timer for the request that is currently outstanding.

use super::endpoint::{Caller, ResponseHandler};
use crate::{Error, Result};
use tor61_cell::CircId;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Which group of circuit IDs are we allowed to allocate in this map?
///
/// The side that opened the channel uses odd circuit IDs; the side
/// that accepted it uses even ones.  That way the two ends can never
/// pick the same ID for different circuits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum CircIdRange {
    /// 1, 3, 5, ...
    Odd,
    /// 2, 4, 6, ...
    Even,
}

impl CircIdRange {
    /// Return the range that our side of a channel allocates from.
    pub(super) fn ours(initiator: bool) -> Self {
        if initiator {
            CircIdRange::Odd
        } else {
            CircIdRange::Even
        }
    }

    /// Return true if `id` is a (nonzero) ID in this range.
    pub(super) fn contains(self, id: CircId) -> bool {
        let id = u16::from(id);
        id != 0 && (id % 2 == 1) == (self == CircIdRange::Odd)
    }

    /// Return the first ID to hand out in this range.
    fn first(self) -> u16 {
        match self {
            CircIdRange::Odd => 1,
            CircIdRange::Even => 2,
        }
    }
}

/// A timer armed for an outstanding request.
#[derive(Debug)]
pub(super) struct Timer {
    /// The task that will fire the timeout.
    handle: JoinHandle<()>,
    /// Which arming of the timer this is, so a timer that fires just
    /// as it is cancelled can tell that it is stale.
    pub(super) seq: u64,
}

impl Timer {
    /// Wrap a running timer task.
    pub(super) fn new(handle: JoinHandle<()>, seq: u64) -> Self {
        Timer { handle, seq }
    }
}

/// An entry in the circuit map.
pub(super) struct Slot {
    /// Who registered this circuit.
    caller: Caller,
    /// The caller's own circuit ID for this circuit.
    prior: CircId,
    /// Where replies go.
    pub(super) handler: Arc<Mutex<ResponseHandler>>,
    /// Set while a request on this circuit is waiting for an answer.
    pub(super) timer: Option<Timer>,
}

impl Slot {
    /// Cancel this slot's timer, if it has one.
    pub(super) fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.handle.abort();
        }
    }
}

/// A map from outgoing circuit IDs to circuit entries.
pub(super) struct CircMap {
    /// Map from circuit IDs to entries.
    slots: HashMap<CircId, Slot>,
    /// Map from (caller, caller's circuit ID) to our circuit ID.
    outgoing: HashMap<(Caller, CircId), CircId>,
    /// The next circuit ID we'll try to hand out.
    next_id: u16,
    /// Counter for timer arming.
    next_seq: u64,
    /// True once the channel has closed; nothing new may be added.
    pub(super) closed: bool,
}

impl CircMap {
    /// Make a new empty CircMap
    pub(super) fn new(range: CircIdRange) -> Self {
        CircMap {
            slots: HashMap::new(),
            outgoing: HashMap::new(),
            next_id: range.first(),
            next_seq: 0,
            closed: false,
        }
    }

    /// Allocate a fresh circuit ID, skipping zero and IDs in use.
    fn alloc_id(&mut self) -> Result<CircId> {
        // Half of the 16-bit space belongs to each side.
        const N_IDS: usize = 1 << 15;
        for _ in 0..N_IDS {
            let id = CircId::from(self.next_id);
            self.next_id = self.next_id.wrapping_add(2);
            if self.next_id == 0 {
                self.next_id = 2;
            }
            if !self.slots.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::IdRangeFull)
    }

    /// Add a new entry for `caller`'s circuit `prior`, and return the
    /// circuit ID it will use on this channel.
    ///
    /// If `caller` already had an entry for `prior`, that entry is
    /// replaced, and its handler will hear nothing more.
    pub(super) fn add_ent(
        &mut self,
        caller: Caller,
        prior: CircId,
        handler: ResponseHandler,
    ) -> Result<CircId> {
        if let Some(old) = self.outgoing.get(&(caller, prior)).copied() {
            self.remove(old);
        }
        let id = self.alloc_id()?;
        self.slots.insert(
            id,
            Slot {
                caller,
                prior,
                handler: Arc::new(Mutex::new(handler)),
                timer: None,
            },
        );
        self.outgoing.insert((caller, prior), id);
        Ok(id)
    }

    /// Return our circuit ID for `caller`'s circuit `prior`, if any.
    pub(super) fn lookup(&self, caller: Caller, prior: CircId) -> Option<CircId> {
        self.outgoing.get(&(caller, prior)).copied()
    }

    /// Return true if `id` is one of our outgoing circuits.
    pub(super) fn contains(&self, id: CircId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Return the entry for `id` in this map, if any.
    pub(super) fn get_mut(&mut self, id: CircId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    /// Return a new sequence number for arming a timer.
    pub(super) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Remove the entry for `id`, cancelling its timer.
    pub(super) fn remove(&mut self, id: CircId) -> Option<Slot> {
        let mut slot = self.slots.remove(&id)?;
        slot.cancel_timer();
        if self.outgoing.get(&(slot.caller, slot.prior)) == Some(&id) {
            self.outgoing.remove(&(slot.caller, slot.prior));
        }
        Some(slot)
    }

    /// Remove every entry, cancelling every timer.
    pub(super) fn drain(&mut self) -> Vec<(CircId, Slot)> {
        self.outgoing.clear();
        let mut all: Vec<_> = self.slots.drain().collect();
        for (_, slot) in all.iter_mut() {
            slot.cancel_timer();
        }
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Return the number of entries in this map.
    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }
}
