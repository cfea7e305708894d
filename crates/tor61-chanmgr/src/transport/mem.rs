//! An in-memory network, for running several routers in one process
//! without sockets.
//!
//! Listeners are registered under a `(host, port)` name.  Connecting to
//! a name hands one end of a fresh in-memory pipe to the listener, and
//! returns the other.  The same network can stand in for destination
//! servers, since [`MemTransport`] also implements [`ExitConnector`].

use super::Transport;
use tor61_proto::exit::{ExitConnector, ExitStream};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use tokio::io::DuplexStream;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// How much data a pipe buffers in each direction.
const PIPE_BUFFER: usize = 1 << 16;

/// A set of named listeners.
#[derive(Default)]
pub struct MemNetwork {
    /// Map from listening name to the queue its connections arrive on.
    listeners: Mutex<HashMap<(String, u16), mpsc::UnboundedSender<DuplexStream>>>,
}

/// A listener on a [`MemNetwork`].
pub struct MemListener {
    /// Incoming connections.
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

/// A [`Transport`] that connects to listeners on a [`MemNetwork`].
#[derive(Clone)]
pub struct MemTransport {
    /// The network we connect on.
    net: Arc<MemNetwork>,
}

impl MemNetwork {
    /// Make a new network with no listeners.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start listening on `host:port`.
    ///
    /// Fails if somebody is already listening there.
    pub fn listen(&self, host: &str, port: u16) -> io::Result<MemListener> {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = (host.to_string(), port);
        if matches!(listeners.get(&key), Some(tx) if !tx.is_closed()) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{}:{} already in use", host, port),
            ));
        }
        let (tx, rx) = mpsc::unbounded();
        listeners.insert(key, tx);
        Ok(MemListener { rx })
    }

    /// Return a transport that connects over this network.
    pub fn transport(self: &Arc<Self>) -> MemTransport {
        MemTransport {
            net: Arc::clone(self),
        }
    }

    /// Open a pipe to the listener at `host:port`.
    fn connect(&self, host: &str, port: u16) -> io::Result<DuplexStream> {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = (host.to_string(), port);
        let (near, far) = tokio::io::duplex(PIPE_BUFFER);
        let delivered = match listeners.get(&key) {
            Some(tx) => tx.unbounded_send(far).is_ok(),
            None => false,
        };
        if delivered {
            Ok(near)
        } else {
            listeners.remove(&key);
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {}:{}", host, port),
            ))
        }
    }
}

impl MemListener {
    /// Wait for the next incoming connection.
    ///
    /// Returns None if the network has gone away.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.next().await
    }
}

#[async_trait]
impl Transport for MemTransport {
    type Connection = DuplexStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<DuplexStream> {
        self.net.connect(host, port)
    }
}

#[async_trait]
impl ExitConnector for MemTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn ExitStream>> {
        let stream = self.net.connect(host, port)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_and_refuse() {
        let net = MemNetwork::new();
        let mut listener = net.listen("example.com", 80).unwrap();
        assert!(net.listen("example.com", 80).is_err());

        let tr = net.transport();
        let mut near = Transport::connect(&tr, "example.com", 80).await.unwrap();
        let mut far = listener.accept().await.unwrap();
        near.write_all(b"hello").await.unwrap();
        let mut buf = [0_u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let e = Transport::connect(&tr, "example.com", 81).await.unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);

        // Once the listener is gone, connections are refused and the
        // name is free again.
        drop(listener);
        let e = ExitConnector::connect(&tr, "example.com", 80)
            .await
            .err()
            .unwrap();
        assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
        assert!(net.listen("example.com", 80).is_ok());
    }
}
