//! S2 Large text (spec §8): a 70,000-byte payload round-trips exactly
//! through the messagelink send/receive path (not just the frame codec
//! tested in `ws::frame`).

use comlink::ws::{close_code, Messagehub, Messagelink};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn seventy_thousand_byte_payload_reassembles_exactly() {
    let onconnect: comlink::ws::OnConnect = Arc::new(|_link| Box::pin(async {}));
    let hub = Messagehub::bind("127.0.0.1", 0, onconnect).await.unwrap();
    let addr = hub.local_addr().clone();

    let server_side = Arc::new(tokio::sync::Mutex::new(None));

    let client = Messagelink::connect("tester", "large", &addr).await.unwrap();
    // Wait for the server-side link to appear in the hub's set.
    let mut server_link = None;
    for _ in 0..50 {
        let links = hub.links().await;
        if let Some(l) = links.into_iter().next() {
            server_link = Some(l);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let server_link = server_link.expect("server accepted a link");

    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_cb = notify.clone();
    let server_side_cb = server_side.clone();
    server_link
        .set_onmessage(Arc::new(move |_link, value| {
            let server_side_cb = server_side_cb.clone();
            let notify_cb = notify_cb.clone();
            tokio::spawn(async move {
                *server_side_cb.lock().await = Some(value);
                notify_cb.notify_one();
            });
        }))
        .await;
    server_link.spawn_reader(Arc::new(AtomicBool::new(false))).await;

    let payload: String = std::iter::repeat('x').take(70_000).collect();
    client.send_escaped_str(&payload).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), notify.notified()).await.unwrap();
    let received = server_side.lock().await.take().unwrap();
    assert_eq!(received.as_str().unwrap().len(), 70_000);
    assert_eq!(received.as_str().unwrap(), payload);

    client.close(close_code::NORMAL).await.ok();
    hub.delete().await;
}
