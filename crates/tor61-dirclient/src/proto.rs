//! Wire format for the registration service.
//!
//! Every message is a UDP datagram starting with a four-byte header:
//! the magic number `0xC461`, a one-byte sequence number that a reply
//! echoes, and a one-byte command.  All integers are big-endian.

use crate::{Error, Result, RouterInfo};
use tor61_cell::Agent;

use bytes::{Buf, BufMut, BytesMut};
use caret::caret_int;

use std::convert::TryFrom;
use std::net::Ipv4Addr;

/// The first two bytes of every message.
pub(crate) const MAGIC: u16 = 0xC461;

/// Length of a message header.
const HEADER_LEN: usize = 4;

/// Length of one entry in a fetch response.
const ENTRY_LEN: usize = 10;

caret_int! {
    /// The command byte of a registration message.
    pub struct RegCmd(u8) {
        /// Ask the service to record us.
        REGISTER = 1,
        /// The service recorded us.
        REGISTERED = 2,
        /// Ask for every record whose name starts with a prefix.
        FETCH = 3,
        /// The records that matched a fetch.
        FETCH_RESPONSE = 4,
        /// Ask the service to forget us.
        UNREGISTER = 5,
        /// The service checking that we're still alive.
        PROBE = 6,
        /// Acknowledge an unregister or a probe.
        ACK = 7,
    }
}

/// A decoded registration message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Msg {
    /// Record a service.
    Register {
        /// Address of the service.
        ip: Ipv4Addr,
        /// Port of the service.
        port: u16,
        /// Opaque service data: for us, the agent.
        data: u32,
        /// Name to record the service under.
        name: String,
    },
    /// The service was recorded for `lifetime` seconds.
    Registered {
        /// Seconds until the record expires.
        lifetime: u16,
    },
    /// Find services by name prefix.
    Fetch {
        /// The prefix to match.
        prefix: String,
    },
    /// Services that matched a fetch.
    FetchResponse {
        /// The matching services.
        entries: Vec<RouterInfo>,
    },
    /// Forget a service.
    Unregister {
        /// Address of the service.
        ip: Ipv4Addr,
        /// Port of the service.
        port: u16,
    },
    /// Are you there?
    Probe,
    /// Yes.
    Ack,
}

impl Msg {
    /// Return the command byte for this message.
    pub(crate) fn cmd(&self) -> RegCmd {
        match self {
            Msg::Register { .. } => RegCmd::REGISTER,
            Msg::Registered { .. } => RegCmd::REGISTERED,
            Msg::Fetch { .. } => RegCmd::FETCH,
            Msg::FetchResponse { .. } => RegCmd::FETCH_RESPONSE,
            Msg::Unregister { .. } => RegCmd::UNREGISTER,
            Msg::Probe => RegCmd::PROBE,
            Msg::Ack => RegCmd::ACK,
        }
    }

    /// Encode this message as a datagram with sequence number `seq`.
    pub(crate) fn encode(&self, seq: u8) -> Result<BytesMut> {
        let mut b = BytesMut::with_capacity(64);
        b.put_u16(MAGIC);
        b.put_u8(seq);
        b.put_u8(self.cmd().into());
        match self {
            Msg::Register {
                ip,
                port,
                data,
                name,
            } => {
                b.put_slice(&ip.octets());
                b.put_u16(*port);
                b.put_u32(*data);
                put_string(&mut b, name, "service name")?;
            }
            Msg::Registered { lifetime } => b.put_u16(*lifetime),
            Msg::Fetch { prefix } => put_string(&mut b, prefix, "fetch prefix")?,
            Msg::FetchResponse { entries } => {
                let n =
                    u16::try_from(entries.len()).map_err(|_| Error::TooLong("fetch response"))?;
                b.put_u16(n);
                for e in entries {
                    let ip: Ipv4Addr = e
                        .host
                        .parse()
                        .map_err(|_| Error::BadMessage("entry host is not an IPv4 address"))?;
                    b.put_slice(&ip.octets());
                    b.put_u16(e.port);
                    b.put_u32(e.agent.into());
                }
            }
            Msg::Unregister { ip, port } => {
                b.put_slice(&ip.octets());
                b.put_u16(*port);
            }
            Msg::Probe | Msg::Ack => {}
        }
        Ok(b)
    }

    /// Decode a datagram, returning its sequence number and message.
    pub(crate) fn decode(mut b: &[u8]) -> Result<(u8, Msg)> {
        if b.len() < HEADER_LEN {
            return Err(Error::BadMessage("short header"));
        }
        if b.get_u16() != MAGIC {
            return Err(Error::BadMessage("bad magic number"));
        }
        let seq = b.get_u8();
        let cmd: RegCmd = b.get_u8().into();
        let msg = match cmd {
            RegCmd::REGISTER => {
                need(b, 4 + 2 + 4 + 1)?;
                let ip = get_ip(&mut b);
                let port = b.get_u16();
                let data = b.get_u32();
                let name = get_string(&mut b)?;
                Msg::Register {
                    ip,
                    port,
                    data,
                    name,
                }
            }
            RegCmd::REGISTERED => {
                need(b, 2)?;
                Msg::Registered {
                    lifetime: b.get_u16(),
                }
            }
            RegCmd::FETCH => Msg::Fetch {
                prefix: get_string(&mut b)?,
            },
            RegCmd::FETCH_RESPONSE => {
                need(b, 2)?;
                let n = b.get_u16() as usize;
                need(b, n * ENTRY_LEN)?;
                let entries = (0..n)
                    .map(|_| {
                        let ip = get_ip(&mut b);
                        let port = b.get_u16();
                        let agent = Agent::from(b.get_u32());
                        RouterInfo::new(ip.to_string(), port, agent)
                    })
                    .collect();
                Msg::FetchResponse { entries }
            }
            RegCmd::UNREGISTER => {
                need(b, 4 + 2)?;
                let ip = get_ip(&mut b);
                let port = b.get_u16();
                Msg::Unregister { ip, port }
            }
            RegCmd::PROBE => Msg::Probe,
            RegCmd::ACK => Msg::Ack,
            _ => return Err(Error::BadMessage("unrecognized command")),
        };
        Ok((seq, msg))
    }
}

/// Helper: return an error unless `b` holds at least `n` more bytes.
fn need(b: &[u8], n: usize) -> Result<()> {
    if b.len() < n {
        Err(Error::BadMessage("message truncated"))
    } else {
        Ok(())
    }
}

/// Helper: read an IPv4 address.  The caller has checked the length.
fn get_ip(b: &mut &[u8]) -> Ipv4Addr {
    let mut octets = [0_u8; 4];
    b.copy_to_slice(&mut octets);
    Ipv4Addr::from(octets)
}

/// Helper: read a string with a one-byte length prefix.
fn get_string(b: &mut &[u8]) -> Result<String> {
    need(*b, 1)?;
    let len = b.get_u8() as usize;
    need(*b, len)?;
    let s = String::from_utf8(b[..len].to_vec()).map_err(|_| Error::BadMessage("bad string"))?;
    b.advance(len);
    Ok(s)
}

/// Helper: write a string with a one-byte length prefix.
fn put_string(b: &mut BytesMut, s: &str, what: &'static str) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return Err(Error::TooLong(what));
    }
    b.put_u8(s.len() as u8);
    b.put_slice(s.as_bytes());
    Ok(())
}
