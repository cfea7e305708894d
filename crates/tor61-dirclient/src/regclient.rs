//! A client for the UDP registration service.

use crate::proto::Msg;
use crate::{Directory, Error, Result, RouterInfo};
use tor61_cell::Agent;

use async_trait::async_trait;
use futures::lock::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Largest datagram we expect to receive.
const MAX_DATAGRAM: usize = 65536;

/// A connection to the registration service.
///
/// Requests are sent one at a time; each is retried a few times if no
/// reply with a matching sequence number arrives.  While the client
/// exists, it also answers the service's liveness probes, which arrive
/// on the port just above the one we send from.
pub struct RegistrationClient {
    /// Socket connected to the service.
    socket: UdpSocket,
    /// The address we register under.
    local_ip: Ipv4Addr,
    /// How long to wait for each reply.
    timeout: Duration,
    /// How many times to send each request.
    attempts: u32,
    /// The last sequence number we used.
    ///
    /// Holding this lock is what serializes requests.
    seq: Mutex<u8>,
    /// Task that answers probes, if we could start one.
    probes: Option<JoinHandle<()>>,
}

impl RegistrationClient {
    /// Connect to the registration service at `server` (a `host:port`
    /// string).
    pub async fn connect(server: &str, timeout: Duration, attempts: u32) -> Result<Self> {
        let addr = tokio::net::lookup_host(server)
            .await
            .map_err(|_| Error::BadAddress(server.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::BadAddress(server.to_string()))?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(addr).await?;
        let local = socket.local_addr()?;
        let local_ip = match local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        debug!("Talking to registration service at {} from {}", addr, local);

        let probe_port = local.port().wrapping_add(1);
        let probes = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, probe_port)).await {
            Ok(s) => Some(tokio::spawn(answer_probes(s))),
            Err(e) => {
                warn!("Can't listen for probes on port {}: {}", probe_port, e);
                None
            }
        };

        Ok(RegistrationClient {
            socket,
            local_ip,
            timeout,
            attempts: attempts.max(1),
            seq: Mutex::new(0),
            probes,
        })
    }

    /// Return the address we send requests from.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `msg` and wait for its reply.
    async fn request(&self, msg: &Msg) -> Result<Msg> {
        let mut last_seq = self.seq.lock().await;
        *last_seq = last_seq.wrapping_add(1);
        let seq = *last_seq;
        let out = msg.encode(seq)?;
        let mut buf = vec![0_u8; MAX_DATAGRAM];

        for attempt in 1..=self.attempts {
            trace!("Sending {} #{} (attempt {})", msg.cmd(), seq, attempt);
            self.socket.send(&out[..]).await?;
            match tokio::time::timeout(self.timeout, self.recv_reply(seq, &mut buf)).await {
                Ok(reply) => return reply,
                Err(_) => debug!("No reply to {} #{}", msg.cmd(), seq),
            }
        }
        Err(Error::Timeout)
    }

    /// Wait for a well-formed reply numbered `seq`.
    async fn recv_reply(&self, seq: u8, buf: &mut [u8]) -> Result<Msg> {
        loop {
            let n = self.socket.recv(buf).await?;
            match Msg::decode(&buf[..n]) {
                Ok((s, msg)) if s == seq => return Ok(msg),
                Ok((s, msg)) => debug!("Ignoring {} #{} while waiting for #{}", msg.cmd(), s, seq),
                Err(e) => debug!("Ignoring bad datagram: {}", e),
            }
        }
    }
}

impl Drop for RegistrationClient {
    fn drop(&mut self) {
        if let Some(probes) = self.probes.take() {
            probes.abort();
        }
    }
}

#[async_trait]
impl Directory for RegistrationClient {
    async fn register(&self, port: u16, agent: Agent, name: &str) -> Result<Duration> {
        let msg = Msg::Register {
            ip: self.local_ip,
            port,
            data: agent.into(),
            name: name.to_string(),
        };
        match self.request(&msg).await? {
            Msg::Registered { lifetime } => Ok(Duration::from_secs(lifetime.into())),
            other => Err(Error::Unexpected(other.cmd())),
        }
    }

    async fn fetch(&self, prefix: &str) -> Result<Vec<RouterInfo>> {
        let msg = Msg::Fetch {
            prefix: prefix.to_string(),
        };
        match self.request(&msg).await? {
            Msg::FetchResponse { entries } => Ok(entries),
            other => Err(Error::Unexpected(other.cmd())),
        }
    }

    async fn unregister(&self, port: u16) -> Result<()> {
        let msg = Msg::Unregister {
            ip: self.local_ip,
            port,
        };
        match self.request(&msg).await? {
            Msg::Ack => Ok(()),
            other => Err(Error::Unexpected(other.cmd())),
        }
    }
}

/// Answer every probe that arrives on `socket` until the task is
/// aborted.
async fn answer_probes(socket: UdpSocket) {
    let mut buf = [0_u8; 64];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("Probe socket failed: {}", e);
                return;
            }
        };
        match Msg::decode(&buf[..n]) {
            Ok((seq, Msg::Probe)) => {
                trace!("Answering probe #{} from {}", seq, from);
                if let Ok(ack) = Msg::Ack.encode(seq) {
                    if let Err(e) = socket.send_to(&ack[..], from).await {
                        debug!("Couldn't answer probe: {}", e);
                    }
                }
            }
            Ok((_, msg)) => debug!("Ignoring {} on probe port", msg.cmd()),
            Err(e) => debug!("Ignoring bad datagram on probe port: {}", e),
        }
    }
}
