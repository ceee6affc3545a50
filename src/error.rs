//! Crate-wide error types. Each subsystem gets its own enum; `Error`
//! composes them so callers at the top of the stack can use one type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload too big ({0} bytes)")]
    TooBig(usize),
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),
    #[error("client frame received without mask")]
    Unmasked,
    #[error("peer sent binary or continuation frame")]
    UnsupportedFrameType,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http parse error: {0}")]
    Http(#[from] HttpError),
    #[error("unexpected status {0}, expected 101")]
    UnexpectedStatus(u16),
    #[error("missing or invalid header: {0}")]
    MissingHeader(&'static str),
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
    #[error("not a websocket upgrade request")]
    NotAnUpgrade,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error("link is not open (state: {0})")]
    NotOpen(&'static str),
    #[error("command send is not permitted on this link")]
    CommandNotPermitted,
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("reply was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("request line or headers exceeded the size limit")]
    TooLarge,
    #[error("connection closed before headers completed")]
    Truncated,
}

/// Validation failure codes, matching spec §7 (-1..-5 naming the bad field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ValidationCode {
    InvalidId = -1,
    InvalidName = -2,
    InvalidTopic = -3,
    InvalidAddr = -4,
    NotUnique = -5,
}

impl ValidationCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed on field {field}: {message}")]
    Validation {
        code: ValidationCode,
        field: &'static str,
        message: String,
    },
    #[error("no entry with id {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("registry request failed: {0}")]
    Registry(String),
    #[error("could not reach the registry after retrying")]
    Unreachable,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ws(#[from] WsError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not supported by this implementation")]
    Unsupported(&'static str),
}
