//! Implementations for the channel handshake
//!
//! The side that opened the connection sends `open(me, peer)` and waits
//! for `opened(me, peer)`.  The side that accepted it reads the `open`,
//! checks that it is addressed to us and that we don't already have a
//! channel to the opener, and answers `opened` or `open_failed`.

use super::io::{write_cell, CellReader};
use crate::{Error, Result};
use tor61_cell::check::{is_open_cell, open_agents};
use tor61_cell::{Agent, Cell, CellCmd};

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use std::time::Duration;

/// A stream whose handshake has succeeded.
pub(crate) struct OpenedStream<S> {
    /// The agent at the other end.
    pub(crate) peer: Agent,
    /// Reading half, with any cells that arrived right after the handshake.
    pub(crate) reader: CellReader<ReadHalf<S>>,
    /// Writing half.
    pub(crate) writer: WriteHalf<S>,
}

/// A connection that we opened, on which nothing has been sent yet.
pub(crate) struct OutboundHandshake<S> {
    /// The connection.
    stream: S,
    /// Our own agent.
    me: Agent,
    /// The agent we think is at the other end.
    peer: Agent,
}

impl<S> OutboundHandshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Construct a new OutboundHandshake.
    pub(crate) fn new(stream: S, me: Agent, peer: Agent) -> Self {
        OutboundHandshake { stream, me, peer }
    }

    /// Send our `open`, and wait up to `timeout` for the answer.
    pub(crate) async fn connect(self, timeout: Duration) -> Result<OpenedStream<S>> {
        let OutboundHandshake { stream, me, peer } = self;
        let (r, mut writer) = split(stream);
        let mut reader = CellReader::new(r);

        let open = Cell::Open {
            opener: me,
            opened: peer,
        }
        .encode()?;
        write_cell(&mut writer, &open).await?;

        let reply = match tokio::time::timeout(timeout, reader.next_cell()).await {
            Ok(r) => r?,
            Err(_) => {
                debug!("No answer from {} to our open", peer);
                return Err(Error::HandshakeTimeout);
            }
        };
        let reply =
            reply.ok_or_else(|| Error::ChanProto("connection closed during handshake".into()))?;

        if is_open_cell(&reply, CellCmd::OPENED, me, peer) {
            Ok(OpenedStream {
                peer,
                reader,
                writer,
            })
        } else if reply.cmd() == CellCmd::OPEN_FAILED {
            Err(Error::HandshakeRejected(peer))
        } else {
            Err(Error::ChanProto(format!(
                "unexpected answer to open: {}",
                reply
            )))
        }
    }
}

/// A connection that a peer opened to us, on which nothing has been
/// read yet.
pub(crate) struct InboundHandshake<S> {
    /// The connection.
    stream: S,
    /// Our own agent.
    me: Agent,
}

impl<S> InboundHandshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Construct a new InboundHandshake.
    pub(crate) fn new(stream: S, me: Agent) -> Self {
        InboundHandshake { stream, me }
    }

    /// Wait up to `timeout` for the peer's `open`, and answer it.
    ///
    /// We refuse the open if it isn't addressed to us, or if `is_known`
    /// says we already have a channel to the opener.
    pub(crate) async fn accept<F>(self, timeout: Duration, is_known: F) -> Result<OpenedStream<S>>
    where
        F: Fn(Agent) -> bool,
    {
        let InboundHandshake { stream, me } = self;
        let (r, mut writer) = split(stream);
        let mut reader = CellReader::new(r);

        let first = match tokio::time::timeout(timeout, reader.next_cell()).await {
            Ok(r) => r?,
            Err(_) => return Err(Error::HandshakeTimeout),
        };
        let first =
            first.ok_or_else(|| Error::ChanProto("connection closed during handshake".into()))?;

        let (opener, opened) = match open_agents(&first) {
            Some(agents) if first.cmd() == CellCmd::OPEN => agents,
            _ => {
                return Err(Error::ChanProto(format!(
                    "expected open, got {}",
                    first
                )))
            }
        };

        if is_open_cell(&first, CellCmd::OPEN, opener, me) && !is_known(opener) {
            let reply = Cell::Opened { opener, opened: me }.encode()?;
            write_cell(&mut writer, &reply).await?;
            Ok(OpenedStream {
                peer: opener,
                reader,
                writer,
            })
        } else {
            debug!(
                "Refusing open from {} (addressed to {})",
                opener, opened
            );
            let reply = Cell::OpenFailed { opener, opened }.encode()?;
            write_cell(&mut writer, &reply).await?;
            // The connection is going away regardless.
            let _ = writer.shutdown().await;
            Err(Error::HandshakeRejected(opener))
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::testing::*;
    use super::*;
    use tor61_cell::RawCell;

    use tokio::io::AsyncReadExt;

    async fn read_one(s: &mut tokio::io::DuplexStream) -> RawCell {
        let mut reader = CellReader::new(s);
        reader.next_cell().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn outbound_ok() {
        let (a, mut b) = tokio::io::duplex(8192);
        let hs = OutboundHandshake::new(a, agent(1), agent(2));
        let peer = async move {
            let open = read_one(&mut b).await;
            assert_eq!(
                open.decode().unwrap(),
                Cell::Open {
                    opener: agent(1),
                    opened: agent(2)
                }
            );
            // Answer, and send a create in the same write.
            let mut both = Cell::Opened {
                opener: agent(1),
                opened: agent(2),
            }
            .encode()
            .unwrap()
            .as_bytes()
            .to_vec();
            both.extend_from_slice(Cell::Create(2.into()).encode().unwrap().as_bytes());
            b.write_all(&both).await.unwrap();
            b
        };
        let (opened, _b) = tokio::join!(hs.connect(Duration::from_secs(3)), peer);
        let mut opened = opened.unwrap();
        assert_eq!(opened.peer, agent(2));
        // The create that arrived with the opened is still there.
        let next = opened.reader.next_cell().await.unwrap().unwrap();
        assert_eq!(next.decode().unwrap(), Cell::Create(2.into()));
    }

    #[tokio::test]
    async fn outbound_mismatch() {
        for reply in vec![
            Cell::Opened {
                opener: agent(2),
                opened: agent(1),
            },
            Cell::Opened {
                opener: agent(1),
                opened: agent(3),
            },
            Cell::Created(1.into()),
        ] {
            let (a, mut b) = tokio::io::duplex(8192);
            let hs = OutboundHandshake::new(a, agent(1), agent(2));
            let peer = async move {
                read_one(&mut b).await;
                b.write_all(reply.encode().unwrap().as_bytes())
                    .await
                    .unwrap();
                b
            };
            let (r, _b) = tokio::join!(hs.connect(Duration::from_secs(3)), peer);
            assert!(matches!(r, Err(Error::ChanProto(_))));
        }
    }

    #[tokio::test]
    async fn outbound_rejected() {
        let (a, mut b) = tokio::io::duplex(8192);
        let hs = OutboundHandshake::new(a, agent(1), agent(2));
        let peer = async move {
            read_one(&mut b).await;
            let reply = Cell::OpenFailed {
                opener: agent(1),
                opened: agent(2),
            };
            b.write_all(reply.encode().unwrap().as_bytes())
                .await
                .unwrap();
            b
        };
        let (r, _b) = tokio::join!(hs.connect(Duration::from_secs(3)), peer);
        assert!(matches!(r, Err(Error::HandshakeRejected(a)) if a == agent(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_timeout() {
        let (a, _b) = tokio::io::duplex(8192);
        let start = tokio::time::Instant::now();
        let hs = OutboundHandshake::new(a, agent(1), agent(2));
        let r = hs.connect(Duration::from_millis(3000)).await;
        assert!(matches!(r, Err(Error::HandshakeTimeout)));
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn inbound_ok_and_known() {
        for known in [false, true].iter() {
            let (a, mut b) = tokio::io::duplex(8192);
            let hs = InboundHandshake::new(a, agent(2));
            let open = Cell::Open {
                opener: agent(1),
                opened: agent(2),
            };
            b.write_all(open.encode().unwrap().as_bytes())
                .await
                .unwrap();
            let known = *known;
            let r = hs
                .accept(Duration::from_secs(3), |who| known && who == agent(1))
                .await;
            let reply = read_one(&mut b).await.decode().unwrap();
            if known {
                assert!(matches!(r, Err(Error::HandshakeRejected(_))));
                assert_eq!(
                    reply,
                    Cell::OpenFailed {
                        opener: agent(1),
                        opened: agent(2)
                    }
                );
                // And then the connection closes.
                let mut rest = Vec::new();
                b.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());
            } else {
                assert_eq!(r.unwrap().peer, agent(1));
                assert_eq!(
                    reply,
                    Cell::Opened {
                        opener: agent(1),
                        opened: agent(2)
                    }
                );
            }
        }
    }

    #[tokio::test]
    async fn inbound_wrong_target() {
        let (a, mut b) = tokio::io::duplex(8192);
        let hs = InboundHandshake::new(a, agent(2));
        let open = Cell::Open {
            opener: agent(1),
            opened: agent(9),
        };
        b.write_all(open.encode().unwrap().as_bytes())
            .await
            .unwrap();
        let r = hs.accept(Duration::from_secs(3), |_| false).await;
        assert!(matches!(r, Err(Error::HandshakeRejected(_))));
        let reply = read_one(&mut b).await.decode().unwrap();
        assert_eq!(
            reply,
            Cell::OpenFailed {
                opener: agent(1),
                opened: agent(9)
            }
        );
    }
}
