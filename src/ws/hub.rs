//! Messagehub: accept loop, link set, broadcast (spec §3 "Messagehub",
//! §4.4, §4.7, §4.9). Grounded on `services/server/src/ws_forwarder.rs`/
//! `ws_receiver.rs` (the per-connection upgrade-handler shape) and
//! `services/server/src/state.rs` (`Arc<RwLock<HashMap<..>>>` registries),
//! re-targeted at a raw `tokio::net::TcpListener` accept loop since the hub
//! performs the RFC 6455 upgrade itself rather than delegating to a web
//! framework.

use crate::addr::NetAddr;
use crate::error::{Error, LinkError};
use crate::http::{Request, Response};
use crate::ws::link::{self, close_code, LinkId, Messagelink};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Runs once a link is accepted, before it is added to the broadcast set or
/// its reader task is spawned — the hook a caller uses to install
/// `onmessage`/`onclose` (spec §4.4). Async so the hub can await it before
/// deciding whether a reader thread is needed.
pub type OnConnect = Arc<dyn Fn(Messagelink) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
/// Handles a non-upgrade HTTP request on the hub's socket (spec §4.4/§4.8).
pub type OnRequest = Arc<dyn Fn(Request) -> Response + Send + Sync>;

/// Aggregates the per-link failures a broadcast hits into one error signal
/// (spec §4.7), rather than swallowing them behind a log line.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to encode broadcast payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broadcast failed on {failed} of {attempted} link(s)")]
    PartialFailure {
        attempted: usize,
        failed: usize,
        failures: Vec<(LinkId, LinkError)>,
    },
}

struct Shared {
    links: Mutex<HashMap<LinkId, Messagelink>>,
    onconnect: Mutex<Option<OnConnect>>,
    onrequest: Mutex<Option<OnRequest>>,
    quit: Arc<AtomicBool>,
    removal_tx: mpsc::UnboundedSender<LinkId>,
}

/// Accepts inbound TCP connections, demultiplexes HTTP requests from
/// WebSocket upgrades, and keeps a set of open server-side links available
/// for broadcast (spec §4.7/§4.9).
pub struct Messagehub {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    removal_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: NetAddr,
}

impl Messagehub {
    /// Binds `port` (0 picks an ephemeral port) and starts the accept loop.
    /// `onconnect` fires once per accepted link, after the handshake and
    /// before the link is added to the broadcast set (spec §4.4).
    pub async fn bind(ip: &str, port: u16, onconnect: OnConnect) -> Result<Messagehub, Error> {
        let listener = TcpListener::bind((ip, port)).await?;
        let bound = listener.local_addr()?;
        let local_addr = NetAddr::new(ip.to_owned(), bound.port());

        let (removal_tx, mut removal_rx) = mpsc::unbounded_channel::<LinkId>();
        let shared = Arc::new(Shared {
            links: Mutex::new(HashMap::new()),
            onconnect: Mutex::new(Some(onconnect)),
            onrequest: Mutex::new(None),
            quit: Arc::new(AtomicBool::new(false)),
            removal_tx,
        });

        let removal_shared = shared.clone();
        let removal_task = tokio::spawn(async move {
            while let Some(id) = removal_rx.recv().await {
                removal_shared.links.lock().await.remove(&id);
            }
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, accept_shared).await;
        });

        Ok(Messagehub {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
            removal_task: Mutex::new(Some(removal_task)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> &NetAddr {
        &self.local_addr
    }

    /// Installs (or replaces) the handler for non-upgrade HTTP requests.
    /// With none installed, the hub replies `404` to such requests (spec
    /// B.3 / original `messagehub.c` behaviour).
    pub async fn set_on_request(&self, handler: OnRequest) {
        *self.shared.onrequest.lock().await = Some(handler);
    }

    pub async fn link_count(&self) -> usize {
        self.shared.links.lock().await.len()
    }

    pub async fn links(&self) -> Vec<Messagelink> {
        self.shared.links.lock().await.values().cloned().collect()
    }

    async fn broadcast_raw(&self, text: &str, exclude: Option<LinkId>) -> Result<(), BroadcastError> {
        let links: Vec<Messagelink> = {
            let guard = self.shared.links.lock().await;
            guard
                .values()
                .filter(|l| Some(l.id()) != exclude)
                .cloned()
                .collect()
        };
        let attempted = links.len();
        let mut failures = Vec::new();
        for link in links {
            if let Err(e) = link.send_text(text).await {
                tracing::debug!(link = %link.id(), error = %e, "broadcast send failed");
                failures.push((link.id(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let failed = failures.len();
            Err(BroadcastError::PartialFailure { attempted, failed, failures })
        }
    }

    pub async fn broadcast_text(&self, text: &str, exclude: Option<LinkId>) -> Result<(), BroadcastError> {
        self.broadcast_raw(text, exclude).await
    }

    pub async fn broadcast_obj<T: Serialize>(&self, value: &T, exclude: Option<LinkId>) -> Result<(), BroadcastError> {
        let text = serde_json::to_string(value)?;
        self.broadcast_raw(&text, exclude).await
    }

    /// Shuts the hub down: stops accepting, closes every open link with
    /// code 1001, and waits for the accept/removal tasks to finish (spec
    /// §4.9, idempotent).
    pub async fn delete(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        let links: Vec<Messagelink> = self.shared.links.lock().await.values().cloned().collect();
        for link in links {
            link.close(close_code::GOING_AWAY).await.ok();
            link.join_reader().await;
        }

        if let Some(task) = self.removal_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        if shared.quit.load(Ordering::SeqCst) {
            break;
        }
        let accepted = tokio::time::timeout(std::time::Duration::from_secs(1), listener.accept()).await;
        let (stream, _peer) = match accepted {
            Err(_elapsed) => continue,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
            Ok(Ok(pair)) => pair,
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            handle_connection(stream, shared).await;
        });
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, shared: Arc<Shared>) {
    let request = {
        let mut buffered = BufReader::new(&mut stream);
        let mut request = match Request::read_headers(&mut buffered).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request on hub socket");
                return;
            }
        };
        if request.is_websocket_upgrade() {
            drop(buffered);
            let removal_tx = shared.removal_tx.clone();
            match link::server_accept(String::new(), String::new(), stream, &request, removal_tx).await {
                Ok(link) => {
                    let onconnect = shared.onconnect.lock().await.clone();
                    if let Some(cb) = onconnect {
                        cb(link.clone()).await;
                    }
                    shared.links.lock().await.insert(link.id(), link.clone());
                    link.spawn_reader(shared.quit.clone()).await;
                }
                Err((mut stream, _err)) => {
                    let response = Response::new(400);
                    response.write_to(&mut stream).await.ok();
                }
            }
            return;
        }
        if let Err(e) = request.read_body(&mut buffered).await {
            tracing::debug!(error = %e, "failed reading request body");
            return;
        }
        request
    };

    let handler = shared.onrequest.lock().await.clone();
    let response = match handler {
        Some(handler) => handler(request),
        // original `messagehub.c`: 404, not 400, when no handler is installed.
        None => Response::new(404),
    };
    response.write_to(&mut stream).await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::link::Messagelink;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn accepts_and_counts_a_link() {
        let connects = Arc::new(AtomicUsize::new(0));
        let connects2 = connects.clone();
        let onconnect: OnConnect = Arc::new(move |_link: Messagelink| {
            let connects2 = connects2.clone();
            Box::pin(async move {
                connects2.fetch_add(1, Ordering::SeqCst);
            })
        });
        let hub = Messagehub::bind("127.0.0.1", 0, onconnect).await.unwrap();

        let addr = hub.local_addr().clone();
        let client = Messagelink::connect("client", "topic", &addr).await.unwrap();
        // Give the accept task a moment to register the link.
        for _ in 0..50 {
            if hub.link_count().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(hub.link_count().await, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        client.close(close_code::NORMAL).await.unwrap();
        hub.delete().await;
    }

    #[tokio::test]
    async fn replies_404_with_no_request_handler() {
        let onconnect: OnConnect = Arc::new(|_| Box::pin(async {}));
        let hub = Messagehub::bind("127.0.0.1", 0, onconnect).await.unwrap();
        let addr = hub.local_addr().clone();
        let mut stream = tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream.write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 404"));
        hub.delete().await;
    }
}
