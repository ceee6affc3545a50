//! HTTP response model, serialisation, and the streaming-ish parser used by
//! the client handshake to read the server's `101` reply (spec §4.3/§4.8).

use super::request::render_status_line;
use crate::error::HttpError;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Response { status: 200, headers: Vec::new(), body: Vec::new() }
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response { status, ..Default::default() }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialise into the fixed wire shape this system always emits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = render_status_line(self.status).into_bytes();
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }

    /// Read a response's status line and headers (used by the client
    /// handshake; the 101 reply carries no body).
    pub async fn read_headers<R>(reader: &mut BufReader<R>) -> Result<Response, HttpError>
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
        let _version = parts.next().ok_or(HttpError::MalformedStatusLine)?;
        let status: u16 = parts
            .next()
            .ok_or(HttpError::MalformedStatusLine)?
            .parse()
            .map_err(|_| HttpError::MalformedStatusLine)?;

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

        Ok(Response { status, headers, body: Vec::new() })
    }

    pub async fn read_body<R>(&mut self, reader: &mut BufReader<R>) -> Result<(), HttpError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let len: usize = self.header("Content-Length").and_then(|v| v.parse().ok()).unwrap_or(0);
        if len == 0 {
            return Ok(());
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.body = body;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fixed_shape() {
        let mut resp = Response::new(200).with_body(b"hi".to_vec());
        resp.set_header("Content-Type", "text/plain");
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("hi"));
    }
}
