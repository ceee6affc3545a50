//! Client and server WebSocket handshake (spec §4.3/§4.4). Grounded on
//! `examples/other_examples/562511f5_sjwe-ktls-uring-demo__src-websocket.rs.rs`
//! (`compute_accept_key`, `build_handshake_request`,
//! `validate_handshake_response`) and cross-checked against
//! `original_source/librcom/src/http.c` / `src/messagelink.c` for the exact
//! header set the original emits.

use crate::error::HandshakeError;
use crate::http::{Method, Request, Response};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha1::{Digest, Sha1};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A fresh 16-byte nonce, base64-encoded to a 24-char key (spec §4.3).
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

/// `base64(sha1(key ++ GUID))` — the handshake witness (spec §4.3/§4.4,
/// invariant #4).
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Render the client's upgrade request bytes.
pub fn build_request(host: &str, key: &str) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Validate the server's reply against the key this client sent.
pub fn validate_response(response: &Response, key: &str) -> Result<(), HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status));
    }
    let upgrade = response.header("Upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::MissingHeader("Upgrade"));
    }
    let connection = response.header("Connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection.split(',').any(|t| t.trim().eq_ignore_ascii_case("Upgrade")) {
        return Err(HandshakeError::MissingHeader("Connection"));
    }
    let accept = response
        .header("Sec-WebSocket-Accept")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
    if accept != compute_accept(key) {
        return Err(HandshakeError::AcceptMismatch);
    }
    Ok(())
}

/// Validate an inbound request as an upgrade candidate and, if valid,
/// return the `Sec-WebSocket-Accept` value for the 101 reply (spec §4.4).
pub fn accept_for_request(request: &Request) -> Result<String, HandshakeError> {
    if request.method != Method::Get {
        return Err(HandshakeError::NotAnUpgrade);
    }
    let key = request
        .header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    let version = request
        .header("Sec-WebSocket-Version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version"));
    }
    let upgrade = request.header("Upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::MissingHeader("Upgrade"));
    }
    if !request.connection_has("Upgrade") {
        return Err(HandshakeError::MissingHeader("Connection"));
    }
    Ok(compute_accept(key))
}

/// Build the 101 response for an accepted upgrade.
pub fn accept_response(accept: &str) -> Response {
    let mut response = Response::new(101);
    response.set_header("Upgrade", "websocket");
    response.set_header("Connection", "Upgrade");
    response.set_header("Sec-WebSocket-Accept", accept);
    response
}
