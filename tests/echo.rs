//! S1 Echo (spec §8): a client sends "hello" to a hub whose `onconnect`
//! installs an echoing `onmessage`; the client receives "hello" back and
//! both sides reach `closed` on disconnect.

use comlink::ws::{close_code, LinkState, Messagehub, Messagelink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn echo_round_trip_within_100ms() {
    let onconnect: comlink::ws::OnConnect = Arc::new(|link: Messagelink| {
        Box::pin(async move {
            let echo = Arc::new(move |link: Messagelink, value: serde_json::Value| {
                let text = value.as_str().unwrap_or_default().to_owned();
                tokio::spawn(async move {
                    link.send_escaped_str(&text).await.ok();
                });
            });
            link.set_onmessage(echo).await;
        })
    });
    let hub = Messagehub::bind("127.0.0.1", 0, onconnect).await.unwrap();
    let addr = hub.local_addr().clone();

    let client = Messagelink::connect("tester", "echo", &addr).await.unwrap();
    let received = Arc::new(tokio::sync::Mutex::new(None));
    let received_cb = received.clone();
    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_cb = notify.clone();
    client
        .set_onmessage(Arc::new(move |_link, value| {
            let received_cb = received_cb.clone();
            let notify_cb = notify_cb.clone();
            tokio::spawn(async move {
                *received_cb.lock().await = Some(value);
                notify_cb.notify_one();
            });
        }))
        .await;
    client.spawn_reader(Arc::new(AtomicBool::new(false))).await;

    client.send_escaped_str("hello").await.unwrap();
    tokio::time::timeout(Duration::from_millis(100), notify.notified()).await.unwrap();

    assert_eq!(received.lock().await.take(), Some(serde_json::json!("hello")));

    client.close(close_code::NORMAL).await.unwrap();
    assert_eq!(client.state().await, LinkState::Closed);
    hub.delete().await;
}
