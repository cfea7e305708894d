//! The set of routers we currently know about.

use crate::RouterInfo;
use tor61_cell::Agent;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use std::sync::{PoisonError, RwLock};

/// A list of the other routers on the network.
///
/// Our own router is never part of the list; it is only handed out when
/// nothing else is available.
pub struct RouterList {
    /// Our own router.
    me: RouterInfo,
    /// Everybody else.
    routers: RwLock<Vec<RouterInfo>>,
}

impl RouterList {
    /// Make a new, empty, list for the router `me`.
    pub fn new(me: RouterInfo) -> Self {
        RouterList {
            me,
            routers: RwLock::new(Vec::new()),
        }
    }

    /// Return our own router.
    pub fn me(&self) -> &RouterInfo {
        &self.me
    }

    /// Replace the contents of this list with `routers`.
    pub fn set(&self, mut routers: Vec<RouterInfo>) {
        routers.retain(|r| r.agent != self.me.agent);
        info!("Know about {} other routers", routers.len());
        for r in &routers {
            info!(
                "\tGroup: 0x{:04x}, ID: 0x{:04x}, Address: {}:{}",
                r.agent.group(),
                r.agent.instance(),
                r.host,
                r.port
            );
        }
        *self.routers.write().unwrap_or_else(PoisonError::into_inner) = routers;
    }

    /// Return a copy of every router in the list.
    pub fn all(&self) -> Vec<RouterInfo> {
        self.routers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return the number of routers in the list.
    pub fn len(&self) -> usize {
        self.routers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Return true if we know about no other routers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Choose a random router whose agent isn't in `invalid`.
    ///
    /// If there's no such router, we return our own: a circuit through
    /// ourself is better than none.
    pub fn random_router<R: Rng>(&self, invalid: &[Agent], rng: &mut R) -> RouterInfo {
        let routers = self.routers.read().unwrap_or_else(PoisonError::into_inner);
        let useful: Vec<&RouterInfo> = routers
            .iter()
            .filter(|r| !invalid.contains(&r.agent))
            .collect();
        match useful.choose(rng) {
            Some(r) => (*r).clone(),
            None => {
                info!("No routers available; using ourself");
                self.me.clone()
            }
        }
    }
}
