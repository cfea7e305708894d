//! Implement a simple HTTP proxy that relays browser connections over
//! our circuit.
//!
//! A proxy is launched with [`run_http_proxy()`], which listens for new
//! connections and handles each one in its own task.  Every connection
//! gets a stream of its own.  `CONNECT` requests become tunnels; any
//! other request is sent on as HTTP/1.0, so that both ends close the
//! connection when the response is done.

use tor61_circmgr::{CircuitBuilder, StreamEvent, StreamReader, StreamWriter};

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Longest request or response header we'll look at.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Reply to a `CONNECT` once the tunnel is open.
const CONNECT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Reply when we can't reach the destination.
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Reply when we can't make sense of the request.
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

/// Return the length of the header at the start of `buf`, including the
/// blank line that ends it, if the whole header is there.
fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// If `line` is a header called `name`, return its value.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (n, v) = line.split_once(':')?;
    if n.trim().eq_ignore_ascii_case(name) {
        Some(v.trim())
    } else {
        None
    }
}

/// Return true if `line` is a header that says whether to keep the
/// connection open.
fn is_connection_header(line: &str) -> bool {
    header_value(line, "connection").is_some() || header_value(line, "proxy-connection").is_some()
}

/// Parse a port number.
fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .with_context(|| format!("Bad port number {:?}", s))
}

/// Split `host[:port]` (or `[v6addr][:port]`) into a host and an
/// optional port.
fn split_host_port(s: &str) -> Result<(&str, Option<u16>)> {
    let s = s.trim();
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("Unterminated address in {:?}", s))?;
        match after.strip_prefix(':') {
            Some(p) => (host, Some(parse_port(p)?)),
            None if after.is_empty() => (host, None),
            None => bail!("Junk after address in {:?}", s),
        }
    } else {
        match s.rsplit_once(':') {
            Some((host, p)) => (host, Some(parse_port(p)?)),
            None => (s, None),
        }
    };
    if host.is_empty() {
        bail!("No host in {:?}", s);
    }
    Ok((host, port))
}

/// Split an absolute request target into its scheme and authority.
///
/// Targets like `/index.html` have neither.
fn split_target(target: &str) -> (Option<&str>, Option<&str>) {
    match target.split_once("://") {
        Some((scheme, rest)) => {
            let authority = rest
                .split(|c: char| c == '/' || c == '?' || c == '#')
                .next()
                .unwrap_or(rest);
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let authority = if authority.is_empty() {
                None
            } else {
                Some(authority)
            };
            (Some(scheme), authority)
        }
        None => (None, None),
    }
}

/// Change the version at the end of a request line to HTTP/1.0.
fn downgrade_request_line(line: &str) -> String {
    match line.rsplit_once(' ') {
        Some((start, version)) if version.starts_with("HTTP/") => format!("{} HTTP/1.0", start),
        _ => line.to_string(),
    }
}

/// Rewrite the header `head` so that nobody keeps the connection open.
///
/// If `request` is set, the first line is a request line, and its
/// version is changed to HTTP/1.0.
fn rewrite_head(head: &str, request: bool) -> String {
    let mut out = String::with_capacity(head.len());
    for (i, line) in head.split("\r\n").enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        if i == 0 && request {
            out.push_str(&downgrade_request_line(line));
        } else if i > 0 && is_connection_header(line) {
            let name = line.split(':').next().unwrap_or(line).trim();
            out.push_str(name);
            out.push_str(": close");
        } else {
            out.push_str(line);
        }
    }
    out
}

/// A request from a browser, as far as we need to understand it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    /// The request method.
    method: String,
    /// Host to connect to.
    host: String,
    /// Port to connect to.
    port: u16,
    /// The header to send on to the destination.  Unused for `CONNECT`.
    head: String,
}

impl Request {
    /// Parse the request header `head`, and work out where it's going.
    fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head).context("Request header isn't UTF-8")?;
        let request_line = text.split("\r\n").next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(_), None) => (m, t),
            _ => bail!("Malformed request line {:?}", request_line),
        };
        let connect = method.eq_ignore_ascii_case("CONNECT");

        let host_header = text
            .split("\r\n")
            .skip(1)
            .find_map(|l| header_value(l, "host"))
            .filter(|h| !h.is_empty())
            .map(split_host_port)
            .transpose()?;
        let (scheme, authority) = if connect {
            (None, Some(target))
        } else {
            split_target(target)
        };
        let from_target = authority.map(split_host_port).transpose()?;

        // A CONNECT names its destination in the request line; anything
        // else should have a Host header.
        let (first, second) = if connect {
            (from_target, host_header)
        } else {
            (host_header, from_target)
        };
        let host = match first.or(second) {
            Some((host, _)) => host.to_string(),
            None => bail!("No destination host in request"),
        };
        let https = connect || scheme.map_or(false, |s| s.eq_ignore_ascii_case("https"));
        let port = first
            .and_then(|(_, p)| p)
            .or_else(|| second.and_then(|(_, p)| p))
            .unwrap_or(if https { 443 } else { 80 });

        let head = if connect {
            String::new()
        } else {
            rewrite_head(text, true)
        };
        Ok(Request {
            method: method.to_string(),
            host,
            port,
            head,
        })
    }

    /// Return true if this request asks for a tunnel.
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Rewrites the first response header that passes through it, so that
/// the browser closes the connection when the response is done.
struct ResponseRewriter {
    /// Data held back until we've seen the whole header.
    buf: Vec<u8>,
    /// Set once there's nothing more to rewrite.
    done: bool,
}

impl ResponseRewriter {
    /// Make a new rewriter.  If `active` is false, everything passes
    /// through unchanged.
    fn new(active: bool) -> Self {
        ResponseRewriter {
            buf: Vec::new(),
            done: !active,
        }
    }

    /// Take in `data`, and return whatever should be passed on now.
    fn push(&mut self, data: &[u8]) -> Vec<u8> {
        if self.done {
            return data.to_vec();
        }
        self.buf.extend_from_slice(data);
        if let Some(n) = head_len(&self.buf) {
            self.done = true;
            let rest = self.buf.split_off(n);
            let head = std::mem::take(&mut self.buf);
            let mut out = match String::from_utf8(head) {
                Ok(text) => rewrite_head(&text, false).into_bytes(),
                Err(e) => e.into_bytes(),
            };
            out.extend_from_slice(&rest);
            out
        } else if self.buf.len() > MAX_HEAD_LEN {
            self.finish()
        } else {
            Vec::new()
        }
    }

    /// Return anything still held back.
    fn finish(&mut self) -> Vec<u8> {
        self.done = true;
        std::mem::take(&mut self.buf)
    }
}

/// Copy everything from the browser into the stream, and end the
/// stream when the browser is done.
async fn copy_to_stream<R>(mut reader: R, writer: StreamWriter) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0_u8; 4096];
    loop {
        match reader.read(&mut buf[..]).await {
            Ok(0) => {
                writer.end()?;
                return Ok(());
            }
            Ok(n) => writer.write(&buf[..n])?,
            Err(e) => {
                let _ = writer.close();
                return Err(e).context("Error reading from browser");
            }
        }
    }
}

/// Copy everything that arrives on the stream to the browser, until the
/// stream closes.
async fn copy_from_stream<W>(
    mut reader: StreamReader,
    mut writer: W,
    mut rewriter: ResponseRewriter,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = reader.next_event().await {
        match event {
            StreamEvent::Data(data) => {
                let out = rewriter.push(&data[..]);
                if !out.is_empty() {
                    writer
                        .write_all(&out[..])
                        .await
                        .context("Error writing to browser")?;
                }
            }
            // We might get this again if the circuit is rebuilt.
            StreamEvent::Connected => {}
            StreamEvent::Closed => break,
            other => debug!("Ignoring unrecognized stream event {:?}", other),
        }
    }
    let rest = rewriter.finish();
    if !rest.is_empty() {
        writer.write_all(&rest[..]).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Given a just-received connection from a browser, read its request
/// and relay the connection over our circuit.
async fn handle_browser_conn<S>(circuit: CircuitBuilder, conn: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut browser_r, mut browser_w) = tokio::io::split(conn);

    // Part 1: read the request header, to learn where we're going.
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let len = loop {
        let n = browser_r
            .read(&mut chunk[..])
            .await
            .context("Error while reading request header")?;
        if n == 0 {
            debug!("Browser closed the connection before finishing a request");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(len) = head_len(&buf) {
            break len;
        }
        if buf.len() > MAX_HEAD_LEN {
            browser_w.write_all(BAD_REQUEST).await?;
            bail!("Request header too long");
        }
    };
    let body = buf.split_off(len);
    let request = match Request::parse(&buf) {
        Ok(r) => r,
        Err(e) => {
            browser_w.write_all(BAD_REQUEST).await?;
            return Err(e);
        }
    };
    info!(
        "Got a proxy request: {} {}:{}",
        request.method, request.host, request.port
    );

    // Part 2: open a stream, and wait for the exit to connect.
    let stream = match circuit.open_stream(&request.host, request.port).await {
        Ok(s) => s,
        Err(e) => {
            browser_w.write_all(BAD_GATEWAY).await?;
            return Err(e).context("Couldn't open a stream");
        }
    };
    let (mut stream_r, stream_w) = stream.split();
    match stream_r.next_event().await {
        Some(StreamEvent::Connected) => {}
        _ => {
            info!("Couldn't reach {}:{}", request.host, request.port);
            browser_w
                .write_all(BAD_GATEWAY)
                .await
                .context("Couldn't write proxy reply")?;
            return Ok(());
        }
    }
    info!("Got a stream for {}:{}", request.host, request.port);

    if request.is_connect() {
        browser_w
            .write_all(CONNECT_OK)
            .await
            .context("Couldn't write proxy reply")?;
    } else {
        stream_w.write(request.head.as_bytes())?;
    }
    stream_w.write(&body[..])?;

    // Part 3: relay traffic both ways, until the stream closes.
    let upstream = copy_to_stream(browser_r, stream_w.clone());
    let downstream = copy_from_stream(
        stream_r,
        browser_w,
        ResponseRewriter::new(!request.is_connect()),
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);
    let mut upstream_done = false;
    let result = loop {
        tokio::select! {
            r = &mut upstream, if !upstream_done => {
                upstream_done = true;
                if let Err(e) = r {
                    debug!("{:#}", e);
                }
            }
            r = &mut downstream => break r,
        }
    };
    if !upstream_done {
        // It may already be closed.
        let _ = stream_w.close();
    }
    result
}

/// Launch an HTTP proxy to listen on a given localhost port, and run
/// indefinitely.
///
/// Every connection is relayed over `circuit`.
pub(crate) async fn run_http_proxy(circuit: CircuitBuilder, proxy_port: u16) -> Result<()> {
    let mut listeners = Vec::new();

    // We actually listen on two ports: one for ipv4 and one for ipv6.
    let localhosts: [IpAddr; 2] = [Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()];

    for localhost in &localhosts {
        let addr: SocketAddr = (*localhost, proxy_port).into();
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Listening on {:?}.", addr);
                listeners.push(listener);
            }
            Err(e) => warn!("Can't listen on {:?}: {}", addr, e),
        }
    }
    if listeners.is_empty() {
        error!("Couldn't open any listeners.");
        bail!("No proxy port available");
    }

    // One stream of incoming connections, selected across all the
    // listeners.
    let mut incoming = futures::stream::select_all(listeners.into_iter().map(|listener| {
        Box::pin(futures::stream::unfold(listener, |listener| async move {
            let conn = listener.accept().await;
            Some((conn, listener))
        }))
    }));

    while let Some(conn) = incoming.next().await {
        let (stream, addr) = match conn {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to accept a browser connection: {}", e);
                continue;
            }
        };
        debug!("Browser connection from {}", addr);
        let circuit = circuit.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_browser_conn(circuit, stream).await {
                warn!("Connection from {} failed: {:#}", addr, e);
            }
        });
    }

    Ok(())
}
