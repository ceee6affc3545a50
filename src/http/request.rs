//! HTTP request model and streaming-ish parser (spec §4.8 / §3).
//!
//! Incrementally builds a header list and URI from the socket, splits off
//! the query string, and appends body bytes once headers are complete —
//! grounded on `original_source/src/request.c` and `librcom/include/private/http.h`.

use super::status::reason_phrase;
use crate::error::HttpError;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other(String),
}

impl Method {
    fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            other => Method::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-sensitive lookup, as this system only ever looks up the headers
    /// it or a conformant peer emits verbatim (spec §3).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// True if `Connection` contains the given token, comma-separated.
    pub fn connection_has(&self, token: &str) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false)
            && self.connection_has("Upgrade")
            && self.header("Sec-WebSocket-Version") == Some("13")
            && self.header("Sec-WebSocket-Key").is_some()
    }

    /// Read request headers (not body) from a socket.
    pub async fn read_headers<R>(reader: &mut BufReader<R>) -> Result<Request, HttpError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut total = 0usize;
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(HttpError::Truncated);
        }
        total += n;
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().ok_or(HttpError::MalformedRequestLine)?;
        let target = parts.next().ok_or(HttpError::MalformedRequestLine)?;
        let _version = parts.next().ok_or(HttpError::MalformedRequestLine)?;

        let (uri, query) = match target.split_once('?') {
            Some((u, q)) => (u.to_owned(), Some(q.to_owned())),
            None => (target.to_owned(), None),
        };

        let mut headers = Vec::new();
        loop {
            let mut header_line = String::new();
            let n = reader.read_line(&mut header_line).await?;
            if n == 0 {
                return Err(HttpError::Truncated);
            }
            total += n;
            if total > MAX_HEADER_BYTES {
                return Err(HttpError::TooLarge);
            }
            let header_line = header_line.trim_end_matches(['\r', '\n']);
            if header_line.is_empty() {
                break;
            }
            let (name, value) = header_line.split_once(':').ok_or(HttpError::MalformedHeader)?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        Ok(Request { method: Method::parse(method), uri, query, headers, body: Vec::new() })
    }

    /// Read the body after headers, using `Content-Length` if present.
    pub async fn read_body<R>(&mut self, reader: &mut BufReader<R>) -> Result<(), HttpError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let len: usize = self
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if len == 0 {
            return Ok(());
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.body = body;
        Ok(())
    }
}

/// Renders the fixed status-line-plus-headers-plus-body response shape this
/// system always emits (spec §4.8): `HTTP/1.1 <code> <reason>\r\n
/// Content-Length: N\r\nConnection: close\r\n<headers>\r\n\r\n<body>`.
pub fn render_status_line(status: u16) -> String {
    format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status))
}
