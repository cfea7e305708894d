//! Find other Tor61 routers.
//!
//! Tor61 routers find each other through a registration service: each
//! router records its address and agent under a name of the form
//! `Tor61Router-GGGG-IIII`, and fetches the records of the others by
//! name prefix.  This crate implements a client for that service
//! ([`RegistrationClient`]), a fixed stand-in for it
//! ([`StaticDirectory`]), the list of known routers that circuits pick
//! their hops from ([`RouterList`]), and a [`DirMgr`] that keeps the
//! registration alive and the list fresh.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

mod err;
mod list;
mod mgr;
mod proto;
mod regclient;

use tor61_cell::Agent;

use async_trait::async_trait;

use std::time::Duration;

pub use err::Error;
pub use list::RouterList;
pub use mgr::DirMgr;
pub use proto::RegCmd;
pub use regclient::RegistrationClient;

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Where to find a router, and who it is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterInfo {
    /// The host the router listens on.
    pub host: String,
    /// The port the router listens on.
    pub port: u16,
    /// The router's identity.
    pub agent: Agent,
}

impl RouterInfo {
    /// Construct a new RouterInfo.
    pub fn new(host: String, port: u16, agent: Agent) -> Self {
        RouterInfo { host, port, agent }
    }
}

/// Return the name under which the router `agent` registers.
pub fn router_name(agent: Agent) -> String {
    format!("Tor61Router-{:04x}-{:04x}", agent.group(), agent.instance())
}

/// Return the prefix to fetch routers with.
///
/// If `only_my_group` is set, only routers in the same group as `agent`
/// match.
pub fn fetch_prefix(agent: Agent, only_my_group: bool) -> String {
    if only_my_group {
        format!("Tor61Router-{:04x}", agent.group())
    } else {
        "Tor61Router-".to_string()
    }
}

/// Something that can record our router, and tell us about others.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Record the router `agent` listening on `port` under `name`.
    ///
    /// Returns how long the record lasts.  A zero duration means it
    /// never needs renewing.
    async fn register(&self, port: u16, agent: Agent, name: &str) -> Result<Duration>;

    /// Return every router whose name starts with `prefix`.
    async fn fetch(&self, prefix: &str) -> Result<Vec<RouterInfo>>;

    /// Forget the router we recorded on `port`.
    async fn unregister(&self, port: u16) -> Result<()>;
}

/// A [`Directory`] with a fixed list of routers, for networks without a
/// registration service.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    /// Every router on the network.
    routers: Vec<RouterInfo>,
}

impl StaticDirectory {
    /// Make a directory that always answers with `routers`.
    pub fn new(routers: Vec<RouterInfo>) -> Self {
        StaticDirectory { routers }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn register(&self, _port: u16, _agent: Agent, _name: &str) -> Result<Duration> {
        Ok(Duration::from_secs(0))
    }

    async fn fetch(&self, prefix: &str) -> Result<Vec<RouterInfo>> {
        Ok(self
            .routers
            .iter()
            .filter(|r| router_name(r.agent).starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn unregister(&self, _port: u16) -> Result<()> {
        Ok(())
    }
}

/// Configuration for a [`DirMgr`] and its [`RegistrationClient`].
#[derive(Clone, Debug)]
pub struct DirConfig {
    /// How often to fetch a new router list.
    pub refresh: Duration,
    /// How many times in a row we may fail to reach the directory at
    /// startup.
    pub max_failures: u32,
    /// How long to wait for each reply from the registration service.
    pub request_timeout: Duration,
    /// How many times to send each request to the registration service.
    pub request_attempts: u32,
}

impl Default for DirConfig {
    fn default() -> Self {
        DirConfig {
            refresh: Duration::from_secs(300),
            max_failures: 3,
            request_timeout: Duration::from_secs(3),
            request_attempts: 3,
        }
    }
}
