// HTTP request parsing and the WebSocket upgrade handshake

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Fixed GUID appended to the client key (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Request line plus headers; anything bigger is not one of our clients
const MAX_REQUEST_BYTES: u64 = 8 * 1024;
const MAX_HEADERS: usize = 64;
// Form posts are tiny; longer bodies are cut here
const MAX_BODY_BYTES: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn websocket_key(&self) -> Option<&str> {
        let upgrade = self.header("upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return None;
        }
        self.header("sec-websocket-key").filter(|key| !key.is_empty())
    }

    pub fn has_query_flag(&self, flag: &str) -> bool {
        self.query.split('&').any(|pair| pair == flag)
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|len| len.parse().ok())
            .unwrap_or(0)
    }
}

/// Read the request line and headers, up to the blank line
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Request, HandshakeError> {
    let mut limited = reader.take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    if limited.read_line(&mut line).await? == 0 {
        return Err(HandshakeError::Malformed("empty request"));
    }
    // Chrome sometimes opens with an HTTP/2 preface
    if line.starts_with("PRI * HTTP/2.0") {
        return Err(HandshakeError::Malformed("HTTP/2 preface"));
    }
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(HandshakeError::Malformed("bad request line"));
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let mut request = Request {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        headers: HashMap::new(),
    };

    loop {
        line.clear();
        if limited.read_line(&mut line).await? == 0 {
            return Err(HandshakeError::Malformed("truncated headers"));
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if request.headers.len() >= MAX_HEADERS {
            return Err(HandshakeError::Malformed("too many headers"));
        }
        if let Some((name, value)) = header.split_once(':') {
            request
                .headers
                .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(request)
}

/// Read the request body announced by Content-Length, up to `MAX_BODY_BYTES`
pub async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, request: &Request) -> Result<String, HandshakeError> {
    let mut body = vec![0u8; request.content_length().min(MAX_BODY_BYTES)];
    reader.read_exact(&mut body).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Sec-WebSocket-Accept for a client's Sec-WebSocket-Key
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

pub fn upgrade_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

pub fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}
