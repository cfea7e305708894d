//! A Tor61 onion router.
//!
//! This binary runs one router: it registers with the directory,
//! accepts channels from other routers and relays their circuits, builds
//! a circuit of its own, and runs an HTTP proxy on localhost that sends
//! browser traffic over that circuit.
//!
//! This is a demo; you get no stability guarantee.

#![warn(missing_docs)]

mod cmdline;
mod exit;
mod proxy;

use tor61_cell::Agent;
use tor61_chanmgr::{ChanMgr, ChanMgrConfig, TcpTransport};
use tor61_circmgr::{CircuitBuilder, CircuitConfig};
use tor61_dirclient::{
    DirConfig, DirMgr, Directory, RegistrationClient, RouterInfo, StaticDirectory,
};
use tor61_proto::channel::ChannelConfig;
use tor61_proto::exit::TcpExitConnector;

use anyhow::{Context, Result};
use argh::FromArgs;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs, Debug, Clone)]
/// Run a Tor61 router, and open an HTTP proxy port that sends traffic
/// through it.
///
/// This is a demo; you get no stability guarantee.
struct Args {
    /// read configuration from this file (may be given more than once)
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
}

/// Default options to use for our configuration.
const TOR61_DEFAULTS: &str = include_str!("./tor61_defaults.toml");

/// Structure to hold our configuration options, whether from a
/// configuration file or the command line.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Port to listen on (at localhost) for browser connections.
    proxy_port: u16,
    /// Port to listen on for other routers.
    relay_port: u16,
    /// Our group number.
    group: u16,
    /// Our instance number within the group.
    instance: u16,
    /// Log filter to use when RUST_LOG isn't set.
    log_level: String,
    /// Whether to build circuits only through routers in our group.
    only_my_group: bool,

    /// How to find other routers.
    directory: DirectorySection,
    /// Channel timeouts.
    channel: ChannelSection,
    /// How to build our circuit.
    circuit: CircuitSection,
}

/// Configuration for finding other routers.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DirectorySection {
    /// `host:port` of the registration service.
    server: Option<String>,
    /// Routers to use when there's no registration service.
    routers: Vec<RouterEntry>,
    /// How often to fetch a new router list.
    refresh_secs: u64,
    /// How many times in a row we may fail to reach the directory at
    /// startup.
    max_failures: u32,
}

/// One router in a static router list.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RouterEntry {
    /// Host the router listens on.
    host: String,
    /// Port the router listens on.
    port: u16,
    /// The router's agent number.
    agent: u32,
}

/// Channel timeouts, in milliseconds.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    /// How long to wait for the peer's side of the handshake.
    handshake_timeout_ms: u64,
    /// How long to wait for an answer to a `create` or `extend`.
    response_timeout_ms: u64,
    /// How long to allow for opening a connection and its handshake.
    connect_timeout_ms: u64,
}

/// How to build our circuit.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CircuitSection {
    /// Number of hops.
    length: usize,
    /// Delay before retrying after a failed hop.
    retry_delay_ms: u64,
    /// Give up after this many failed hops in a row.
    max_attempts: Option<u32>,
}

impl RelayConfig {
    /// Return our agent.
    fn agent(&self) -> Agent {
        Agent::new(self.group, self.instance)
    }

    /// Return the configuration for our directory manager.
    fn dir_config(&self) -> DirConfig {
        DirConfig {
            refresh: Duration::from_secs(self.directory.refresh_secs),
            max_failures: self.directory.max_failures,
            ..DirConfig::default()
        }
    }

    /// Return the routers listed in the configuration.
    fn static_routers(&self) -> Vec<RouterInfo> {
        self.directory
            .routers
            .iter()
            .map(|r| RouterInfo::new(r.host.clone(), r.port, r.agent.into()))
            .collect()
    }

    /// Return the timing configuration for channels.
    fn chan_config(&self) -> ChannelConfig {
        ChannelConfig {
            handshake_timeout: Duration::from_millis(self.channel.handshake_timeout_ms),
            response_timeout: Duration::from_millis(self.channel.response_timeout_ms),
        }
    }

    /// Return the configuration for our channel manager.
    fn chanmgr_config(&self) -> ChanMgrConfig {
        ChanMgrConfig {
            connect_timeout: Duration::from_millis(self.channel.connect_timeout_ms),
        }
    }

    /// Return the configuration for our circuit.
    fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            length: self.circuit.length,
            retry_delay: Duration::from_millis(self.circuit.retry_delay_ms),
            max_attempts: self.circuit.max_attempts,
        }
    }
}

/// Load a configuration from the built-in defaults, then `files`, then
/// the command-line options in `opts`.
fn load_config(files: &[String], opts: &[String]) -> Result<RelayConfig> {
    let mut cfg = config::Config::new();
    cfg.merge(config::File::from_str(
        TOR61_DEFAULTS,
        config::FileFormat::Toml,
    ))?;
    for f in files {
        let f: config::File<_> = Path::new(f).into();
        cfg.merge(f.format(config::FileFormat::Toml))?;
    }
    let mut cmdline = cmdline::CmdLine::new();
    for opt in opts {
        cmdline.push_toml_line(opt.clone());
    }
    cfg.merge(cmdline)?;

    Ok(cfg.try_into()?)
}

/// Install a log subscriber that writes to stderr.
///
/// RUST_LOG takes priority over `level`.
fn setup_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(level).context("Bad log_level")?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Accept connections from other routers forever.
async fn accept_routers(listener: TcpListener, chanmgr: Arc<ChanMgr<TcpTransport>>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Router connection from {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Can't set nodelay: {}", e);
                }
                chanmgr.handle_inbound(stream);
            }
            Err(e) => warn!("Couldn't accept a router connection: {}", e),
        }
    }
}

/// Run the router until we're told to stop.
async fn run(config: RelayConfig) -> Result<()> {
    let me = config.agent();
    let dircfg = config.dir_config();
    info!("Starting Tor61 router {}", me);

    let (host, directory): (String, Arc<dyn Directory>) = match &config.directory.server {
        Some(server) => {
            let client =
                RegistrationClient::connect(server, dircfg.request_timeout, dircfg.request_attempts)
                    .await
                    .with_context(|| format!("Couldn't reach registration service {}", server))?;
            let host = client.local_addr()?.ip().to_string();
            let directory: Arc<dyn Directory> = Arc::new(client);
            (host, directory)
        }
        None => {
            info!("No registration service configured; using the static router list.");
            let directory: Arc<dyn Directory> =
                Arc::new(StaticDirectory::new(config.static_routers()));
            ("127.0.0.1".to_string(), directory)
        }
    };

    let listener = TcpListener::bind(("0.0.0.0", config.relay_port))
        .await
        .with_context(|| format!("Can't listen for routers on port {}", config.relay_port))?;
    info!("Listening for routers on port {}.", config.relay_port);
    let chanmgr = ChanMgr::new(
        me,
        TcpTransport,
        config.chanmgr_config(),
        config.chan_config(),
        Arc::new(TcpExitConnector),
    );
    tokio::spawn(accept_routers(listener, Arc::clone(&chanmgr)));

    let dirmgr = DirMgr::new(
        RouterInfo::new(host, config.relay_port, me),
        config.only_my_group,
        dircfg,
        directory,
    );
    dirmgr
        .bootstrap()
        .await
        .context("Couldn't bootstrap the router list")?;
    tokio::spawn(Arc::clone(&dirmgr).run());

    let circuit = CircuitBuilder::launch(chanmgr, dirmgr.clone(), config.circuit_config());

    tokio::select! {
        r = proxy::run_http_proxy(circuit.clone(), config.proxy_port) => r?,
        r = exit::wait_for_ctrl_c() => r?,
    }

    info!("Cleaning up Tor61 connections");
    if let Err(e) = dirmgr.shutdown().await {
        warn!("Couldn't unregister: {}", e);
    }
    circuit.shutdown().await;
    info!("Exiting");
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = load_config(&args.rc, &args.cfg)?;
    setup_logging(&config.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Couldn't start the runtime")?;
    runtime.block_on(run(config))
}
