//! HTTP/1.1 Upgrade handshake (RFC 6455 section 4)
//!
//! The client sends an Upgrade request carrying a random base64 key and
//! validates the `Sec-WebSocket-Accept` header of the 101 response against
//! the SHA-1 transform over the well-known GUID. The server half of the
//! exchange is implemented too, so both codec roles can be exercised
//! end to end.

use std::collections::HashMap;

use base64::Engine;
use bytes::BytesMut;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::constants::{MAX_HANDSHAKE_HEAD_SIZE, WS_GUID, WS_VERSION};
use crate::error::{Result, SockletError};

/// A parsed ws:// or wss:// target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Request path including the query string
    pub resource: String,
    pub tls: bool,
}

impl Target {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| SockletError::Handshake(format!("invalid URL '{}': {}", input, e)))?;

        let tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(SockletError::Handshake(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| SockletError::Handshake("URL has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SockletError::Handshake("URL has no usable port".to_string()))?;

        let resource = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            host,
            port,
            resource,
            tls,
        })
    }

    /// Host header value; elides the port when it is the scheme default
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Generate the random 16-byte base64 client key
pub fn generate_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill(&mut key[..]);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// The Sec-WebSocket-Accept transform: base64(SHA-1(key + GUID))
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Status line (or request line) plus case-folded headers
#[derive(Debug)]
struct HttpHead {
    start_line: String,
    headers: HashMap<String, String>,
}

impl HttpHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Read from the stream until the blank line ending the HTTP head.
///
/// Returns the head and any bytes read past it; those belong to the frame
/// stream and must seed the caller's read buffer.
async fn read_head<S>(stream: &mut S) -> Result<(HttpHead, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(SockletError::Transport)?;
        if n == 0 {
            return Err(SockletError::Handshake(
                "connection closed before handshake headers completed".to_string(),
            ));
        }
        if let Some(end) = find_head_end(&buf) {
            let head_bytes = buf.split_to(end);
            let head = parse_head(&head_bytes)?;
            return Ok((head, buf));
        }
        if buf.len() > MAX_HANDSHAKE_HEAD_SIZE {
            return Err(SockletError::Handshake(format!(
                "handshake headers exceed {} bytes",
                MAX_HANDSHAKE_HEAD_SIZE
            )));
        }
    }
}

/// Offset one past the CRLFCRLF terminator, if present
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(bytes: &[u8]) -> Result<HttpHead> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SockletError::Handshake("handshake head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| SockletError::Handshake("empty handshake head".to_string()))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            SockletError::Handshake(format!("malformed header line '{}'", line))
        })?;
        headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }
    Ok(HttpHead {
        start_line,
        headers,
    })
}

fn check_upgrade_headers(head: &HttpHead) -> Result<()> {
    let upgrade = head.header("upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(SockletError::Handshake(format!(
            "Upgrade header is '{}', expected 'websocket'",
            upgrade
        )));
    }
    let connection = head.header("connection").unwrap_or("");
    let has_upgrade_token = connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !has_upgrade_token {
        return Err(SockletError::Handshake(format!(
            "Connection header is '{}', expected an 'Upgrade' token",
            connection
        )));
    }
    Ok(())
}

/// Perform the client side of the Upgrade exchange.
///
/// On success the stream speaks WebSocket framing; the returned buffer holds
/// any frame bytes the peer sent in the same packets as its response.
pub async fn client_handshake<S>(stream: &mut S, target: &Target, key: &str) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: {}\r\n\
         \r\n",
        target.resource,
        target.host_header(),
        key,
        WS_VERSION
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(SockletError::Transport)?;

    let (head, leftover) = read_head(stream).await?;

    let mut parts = head.start_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if version != "HTTP/1.1" {
        return Err(SockletError::Handshake(format!(
            "unexpected protocol version '{}'",
            version
        )));
    }
    if status != "101" {
        return Err(SockletError::Handshake(format!(
            "unexpected status {}, expected 101",
            status
        )));
    }

    check_upgrade_headers(&head)?;

    let expected = compute_accept(key);
    match head.header("sec-websocket-accept") {
        Some(accept) if accept == expected => {}
        Some(accept) => {
            return Err(SockletError::Handshake(format!(
                "Sec-WebSocket-Accept mismatch: got '{}'",
                accept
            )))
        }
        None => {
            return Err(SockletError::Handshake(
                "response is missing Sec-WebSocket-Accept".to_string(),
            ))
        }
    }

    Ok(leftover)
}

/// Accept one Upgrade request on the server side of a stream.
///
/// Used by the scripted peers in the test suite; production use would sit
/// behind an HTTP router.
pub async fn server_handshake<S>(stream: &mut S) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_head(stream).await?;

    let mut parts = head.start_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    if method != "GET" {
        return Err(SockletError::Handshake(format!(
            "unexpected method '{}'",
            method
        )));
    }

    check_upgrade_headers(&head)?;

    match head.header("sec-websocket-version") {
        Some(WS_VERSION) => {}
        other => {
            return Err(SockletError::Handshake(format!(
                "unsupported Sec-WebSocket-Version {:?}",
                other
            )))
        }
    }

    let key = head.header("sec-websocket-key").ok_or_else(|| {
        SockletError::Handshake("request is missing Sec-WebSocket-Key".to_string())
    })?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_accept(key)
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(SockletError::Transport)?;

    Ok(leftover)
}
