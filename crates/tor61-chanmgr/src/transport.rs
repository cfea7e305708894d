//! Types for opening connections to other routers

pub mod mem;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use std::io;

/// A Transport knows how to open a byte stream to a router's listening
/// address.
///
/// Nothing is expected of the stream beyond ordered, reliable delivery:
/// the router at the other end is identified later, by the channel
/// handshake.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The type that will be returned by this transport, and that
    /// inbound connections arrive as.
    type Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Try to connect to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<Self::Connection>;
}

/// A [`Transport`] that makes plain TCP connections.
#[derive(Clone, Debug, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Connection = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
