//! S7 / invariant (spec §8): a client frame that arrives unmasked is a
//! protocol violation. The hub must close the link with code 1002 within
//! 1 s and drop it from its link set.
//!
//! `Messagelink::connect` always masks, so a well-behaved client can't
//! produce this condition — this test speaks raw TCP to simulate a
//! misbehaving one.

use comlink::ws::frame::{encode, Opcode};
use comlink::ws::handshake::build_request;
use comlink::ws::Messagehub;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn unmasked_client_frame_closes_with_protocol_error() {
    let onconnect: comlink::ws::OnConnect = Arc::new(|_link| Box::pin(async {}));
    let hub = Messagehub::bind("127.0.0.1", 0, onconnect).await.unwrap();
    let addr = hub.local_addr().clone();

    let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await.unwrap();

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let request = build_request(&format!("{}:{}", addr.host, addr.port), key);
    stream.write_all(&request).await.unwrap();

    let mut response_buf = vec![0u8; 1024];
    let n = stream.read(&mut response_buf).await.unwrap();
    let response_text = String::from_utf8_lossy(&response_buf[..n]);
    assert!(response_text.starts_with("HTTP/1.1 101"), "handshake not accepted: {response_text}");

    for _ in 0..50 {
        if hub.link_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.link_count().await, 1);

    // A spec-conforming client frame is masked; hand-build an unmasked one
    // to simulate the violation directly rather than going through the
    // link API (which always masks).
    let unmasked = encode(Opcode::Text, false, b"not masked");
    stream.write_all(&unmasked).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut closed = false;
    while tokio::time::Instant::now() < deadline {
        if hub.link_count().await == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "hub did not drop the offending link within 1s");

    // The hub's own close frame should carry code 1002.
    let mut close_buf = vec![0u8; 64];
    let read = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut close_buf))
        .await
        .ok()
        .and_then(|r| r.ok());
    if let Some(n) = read {
        if n >= 4 {
            let code = u16::from_be_bytes([close_buf[2], close_buf[3]]);
            assert_eq!(code, 1002);
        }
    }

    hub.delete().await;
}
