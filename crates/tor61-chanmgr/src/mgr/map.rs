//! The registry of channels, indexed by the agent at the far end.
//!
//! There is at most one entry per peer: either a channel whose
//! handshake is done, or a launch that hasn't finished.  Every
//! operation here runs under one lock, so deciding what to do about a
//! peer and recording that decision happen together.

use super::{AbstractChannel, Pending, Sending};
use crate::Result;
use tor61_cell::Agent;

use futures::channel::oneshot;
use futures::future::FutureExt;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What the registry knows about one peer.
enum Entry<C> {
    /// A channel that finished its handshake.
    Open(Arc<C>),
    /// A launch that hasn't reported back yet.
    Launching(Pending<C>),
}

/// What a caller who wants a channel to some peer should do next.
pub(crate) enum Claim<C> {
    /// Use this channel.
    Use(Arc<C>),
    /// Wait for somebody else's launch to finish.
    Wait(Pending<C>),
    /// Launch a channel, then call [`ChannelMap::finish_launch`] and
    /// report the result on this sender.
    Launch(Sending<C>),
}

/// A map from peer agent to channel, or to a launch in progress.
pub(crate) struct ChannelMap<C> {
    /// The entries.
    ///
    /// (This is a blocking mutex close to async code.  It must never be
    /// held across an await point.)
    entries: Mutex<HashMap<Agent, Entry<C>>>,
}

impl<C: AbstractChannel> ChannelMap<C> {
    /// Create a new empty ChannelMap.
    pub(crate) fn new() -> Self {
        ChannelMap {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Decide how a caller gets a channel to `peer`.
    ///
    /// If we have to launch one, a launch entry is recorded before this
    /// returns, so that later callers wait for it.
    pub(crate) fn claim(&self, peer: Agent) -> Result<Claim<C>> {
        let mut map = self.entries.lock()?;
        match map.get(&peer) {
            Some(Entry::Open(chan)) if chan.is_usable() => return Ok(Claim::Use(Arc::clone(chan))),
            Some(Entry::Launching(pending)) => {
                // A launch that has already resolved here was abandoned
                // by whoever started it.
                if pending.clone().now_or_never().is_none() {
                    return Ok(Claim::Wait(pending.clone()));
                }
            }
            Some(Entry::Open(_)) | None => {}
        }
        let (send, recv) = oneshot::channel();
        map.insert(peer, Entry::Launching(recv.shared()));
        Ok(Claim::Launch(send))
    }

    /// Record how a launch to `peer` came out: `Some` channel, or `None`
    /// if it failed.
    pub(crate) fn finish_launch(&self, peer: Agent, outcome: Option<&Arc<C>>) -> Result<()> {
        let mut map = self.entries.lock()?;
        match outcome {
            Some(chan) => {
                map.insert(peer, Entry::Open(Arc::clone(chan)));
            }
            None => {
                if matches!(map.get(&peer), Some(Entry::Launching(_))) {
                    map.remove(&peer);
                }
            }
        }
        Ok(())
    }

    /// Return the usable channel to `peer`, if there is one.
    pub(crate) fn get_open(&self, peer: Agent) -> Result<Option<Arc<C>>> {
        let map = self.entries.lock()?;
        Ok(match map.get(&peer) {
            Some(Entry::Open(chan)) if chan.is_usable() => Some(Arc::clone(chan)),
            _ => None,
        })
    }

    /// Return true if we hold an established, usable channel to `peer`.
    ///
    /// A second peer claiming the same agent is refused in that case.
    pub(crate) fn is_established(&self, peer: Agent) -> Result<bool> {
        Ok(self.get_open(peer)?.is_some())
    }

    /// Record a channel that the peer opened to us.
    ///
    /// It's recorded only if we have neither a usable channel to that
    /// peer nor a launch in progress; returns true if it was recorded.
    pub(crate) fn add_inbound(&self, chan: &Arc<C>) -> Result<bool> {
        let peer = chan.peer();
        let mut map = self.entries.lock()?;
        let free = match map.get(&peer) {
            Some(Entry::Open(old)) => !old.is_usable(),
            Some(Entry::Launching(_)) => false,
            None => true,
        };
        if free {
            map.insert(peer, Entry::Open(Arc::clone(chan)));
        }
        Ok(free)
    }

    /// Forget `chan`, which has closed.
    ///
    /// Only an entry holding this very channel is removed; returns true
    /// if there was one.
    pub(crate) fn remove_closed(&self, chan: &C) -> Result<bool> {
        let peer = chan.peer();
        let mut map = self.entries.lock()?;
        let ours = matches!(
            map.get(&peer),
            Some(Entry::Open(c)) if std::ptr::eq(Arc::as_ptr(c), chan)
        );
        if ours {
            map.remove(&peer);
        }
        Ok(ours)
    }

    /// Return the number of peers with a channel or a launch.
    pub(crate) fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FakeChannel {
        peer: Agent,
        closing: AtomicBool,
    }

    impl AbstractChannel for FakeChannel {
        fn peer(&self) -> Agent {
            self.peer
        }
        fn is_usable(&self) -> bool {
            !self.closing.load(Ordering::SeqCst)
        }
    }

    fn agent(i: u16) -> Agent {
        Agent::new(4, i)
    }

    fn chan(i: u16) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            peer: agent(i),
            closing: AtomicBool::new(false),
        })
    }

    #[test]
    fn launch_then_use() {
        let map = ChannelMap::new();
        let send = match map.claim(agent(1)).unwrap() {
            Claim::Launch(send) => send,
            _ => panic!("expected to launch"),
        };
        assert!(matches!(map.claim(agent(1)).unwrap(), Claim::Wait(_)));
        assert!(!map.is_established(agent(1)).unwrap());
        assert_eq!(map.len().unwrap(), 1);

        let c1 = chan(1);
        map.finish_launch(agent(1), Some(&c1)).unwrap();
        let _ = send.send(Some(Arc::clone(&c1)));
        match map.claim(agent(1)).unwrap() {
            Claim::Use(c) => assert!(Arc::ptr_eq(&c, &c1)),
            _ => panic!("expected a channel"),
        }
        assert!(map.is_established(agent(1)).unwrap());
        assert!(!map.is_established(agent(2)).unwrap());
    }

    #[test]
    fn failed_and_abandoned_launches() {
        let map: ChannelMap<FakeChannel> = ChannelMap::new();
        let _send = match map.claim(agent(1)).unwrap() {
            Claim::Launch(send) => send,
            _ => panic!("expected to launch"),
        };
        map.finish_launch(agent(1), None).unwrap();
        assert_eq!(map.len().unwrap(), 0);

        // A launcher that went away without a word doesn't block the
        // next caller.
        match map.claim(agent(2)).unwrap() {
            Claim::Launch(send) => drop(send),
            _ => panic!("expected to launch"),
        }
        assert!(matches!(map.claim(agent(2)).unwrap(), Claim::Launch(_)));
    }

    #[test]
    fn inbound() {
        let map = ChannelMap::new();
        let c5 = chan(5);
        assert!(map.add_inbound(&c5).unwrap());
        // A usable channel isn't replaced.
        assert!(!map.add_inbound(&chan(5)).unwrap());
        assert!(map.is_established(agent(5)).unwrap());

        // Neither is a launch in progress.
        let _send = map.claim(agent(6)).unwrap();
        assert!(!map.add_inbound(&chan(6)).unwrap());

        // A closing channel is.
        c5.closing.store(true, Ordering::SeqCst);
        assert!(!map.is_established(agent(5)).unwrap());
        let c5b = chan(5);
        assert!(map.add_inbound(&c5b).unwrap());
        assert!(Arc::ptr_eq(&map.get_open(agent(5)).unwrap().unwrap(), &c5b));
    }

    #[test]
    fn remove_only_same_channel() {
        let map = ChannelMap::new();
        let old = chan(3);
        let new = chan(3);
        assert!(map.add_inbound(&new).unwrap());
        assert!(!map.remove_closed(&old).unwrap());
        assert!(map.get_open(agent(3)).unwrap().is_some());
        assert!(map.remove_closed(&new).unwrap());
        assert!(map.get_open(agent(3)).unwrap().is_none());
        assert_eq!(map.len().unwrap(), 0);
    }
}
