//! Keep our registration alive and our router list fresh.

use crate::{fetch_prefix, router_name, DirConfig, Directory, Error, Result, RouterInfo, RouterList};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A directory manager: registers this router with the directory, and
/// keeps a [`RouterList`] of the others up-to-date.
pub struct DirMgr {
    /// Configuration.
    config: DirConfig,
    /// If true, we only want routers in our own group.
    only_my_group: bool,
    /// The directory we talk to.
    directory: Arc<dyn Directory>,
    /// What we know about the other routers.
    routers: RouterList,
    /// When we should renew our registration, if ever.
    renew_at: Mutex<Option<Instant>>,
    /// Set once we've been told to stop.
    stopping: AtomicBool,
    /// Wakes up [`DirMgr::run`] when we're told to stop.
    stop: Notify,
}

impl DirMgr {
    /// Make a new directory manager for the router `me`.
    pub fn new(
        me: RouterInfo,
        only_my_group: bool,
        config: DirConfig,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        Arc::new(DirMgr {
            config,
            only_my_group,
            directory,
            routers: RouterList::new(me),
            renew_at: Mutex::new(None),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    /// Return the list of routers we know about.
    pub fn routers(&self) -> &RouterList {
        &self.routers
    }

    /// Register with the directory, and fetch the first list of routers.
    ///
    /// Each failed attempt is retried right away; after
    /// `max_failures` failures in a row we give up.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut failures = 0;
        loop {
            match self.register().await {
                Ok(()) => match self.refresh().await {
                    Ok(n) => {
                        info!("Directory bootstrapped with {} routers", n);
                        return Ok(());
                    }
                    Err(e) => warn!("Initial router fetch failed: {}", e),
                },
                Err(e) => warn!("Unable to reach registration service: {}", e),
            }
            failures += 1;
            if failures >= self.config.max_failures {
                return Err(Error::BootstrapFailed(failures));
            }
            info!("Retrying directory bootstrap");
        }
    }

    /// Record ourself with the directory.
    async fn register(&self) -> Result<()> {
        let me = self.routers.me();
        let lifetime = self
            .directory
            .register(me.port, me.agent, &router_name(me.agent))
            .await?;
        debug!("Registered for {:?}", lifetime);
        let renew = if lifetime > Duration::from_secs(0) {
            Some(Instant::now() + lifetime / 2)
        } else {
            None
        };
        *self.renew_at.lock().unwrap_or_else(PoisonError::into_inner) = renew;
        Ok(())
    }

    /// Fetch a new router list, and return the number of routers in it.
    ///
    /// On failure the old list is kept.
    async fn refresh(&self) -> Result<usize> {
        let prefix = fetch_prefix(self.routers.me().agent, self.only_my_group);
        let routers = self.directory.fetch(&prefix).await?;
        self.routers.set(routers);
        Ok(self.routers.len())
    }

    /// Run forever (or until [`DirMgr::shutdown`]), renewing our
    /// registration before it lapses and refreshing the router list
    /// every `refresh` interval.
    pub async fn run(self: Arc<Self>) {
        let mut next_refresh = Instant::now() + self.config.refresh;
        loop {
            let renew_at = *self.renew_at.lock().unwrap_or_else(PoisonError::into_inner);
            let wake = match renew_at {
                Some(t) if t < next_refresh => t,
                _ => next_refresh,
            };
            tokio::select! {
                _ = self.stop.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                debug!("Directory updater stopping");
                return;
            }

            let now = Instant::now();
            if matches!(renew_at, Some(t) if t <= now) {
                if let Err(e) = self.register().await {
                    warn!("Couldn't renew registration: {}. Will retry later", e);
                    *self.renew_at.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(now + self.config.refresh);
                }
            }
            if next_refresh <= now {
                if let Err(e) = self.refresh().await {
                    warn!("Router fetch failed: {}. Keeping the old list", e);
                }
                next_refresh = now + self.config.refresh;
            }
        }
    }

    /// Stop [`DirMgr::run`], and remove our registration.
    pub async fn shutdown(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        self.directory.unregister(self.routers.me().port).await
    }
}
