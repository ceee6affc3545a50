//! Service HTTP server: an ordered export table served over a plain
//! HTTP/1.1 listen socket (spec §3 "Service", §4.12). Grounded on
//! `services/server/src/ws_forwarder.rs`'s per-connection accept-loop shape,
//! re-targeted at the crate's own `http::{Request, Response}` types instead
//! of `axum` routing, since export dispatch here is user-supplied per
//! export rather than matched against a framework router.

use crate::addr::NetAddr;
use crate::error::Error;
use crate::http::{Request, Response};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A service export handler. Receives the parsed request and its own
/// `user_data`, returns the response body and headers to send; the status
/// and output mimetype are pre-populated on the `Response` passed in reach
/// (spec §4.12: "constructs a response pre-populated with the export's
/// output mimetype").
pub type OnRequest = Arc<dyn Fn(Request, Response, Option<Arc<dyn Any + Send + Sync>>) -> Response + Send + Sync>;

/// `filename -> mimetype` table, reproduced from `original_source/src/http.c`
/// (spec §9: the original's `mimetype_to_fileextension` does a prefix
/// `strncmp` capped at the shorter string's length, which false-positives on
/// e.g. `"image/jpeg"` vs `"image/j"`; this reimplementation always compares
/// the exact extension, never a truncated prefix).
const MIME_MAP: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".txt", "text/plain"),
    (".js", "application/javascript; charset=utf-8"),
    (".json", "application/json; charset=utf-8"),
    (".css", "text/css"),
    (".jpg", "image/jpeg"),
    (".png", "image/png"),
    (".glb", "application/octet-stream"),
    (".bin", "application/octet-stream"),
    (".svg", "image/svg+xml"),
];

/// Maps a file name's extension to a mimetype by exact suffix match.
pub fn mimetype_for_filename(filename: &str) -> Option<&'static str> {
    MIME_MAP.iter().find(|(ext, _)| filename.ends_with(ext)).map(|(_, mime)| *mime)
}

/// Maps a mimetype back to a file extension by exact match (not a
/// shorter-string prefix, per the reimplementation note above).
pub fn extension_for_mimetype(mimetype: &str) -> Option<&'static str> {
    MIME_MAP.iter().find(|(_, mime)| *mime == mimetype).map(|(ext, _)| *ext)
}

/// One entry of a service's export table (spec §3 "Service", §4.12).
#[derive(Clone)]
pub struct Export {
    pub name: String,
    pub mimetype_in: String,
    pub mimetype_out: String,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    pub onrequest: OnRequest,
}

impl Export {
    fn is_wildcard(&self) -> bool {
        self.name == "*"
    }
}

struct Shared {
    topic: String,
    exports: Mutex<Vec<Export>>,
    quit: Arc<AtomicBool>,
}

/// Owns a topic, a listen socket, and an ordered export table. A name
/// beginning with `/` is an absolute resource path; `*` is the wildcard
/// fallback. Lookup scans in registration order; the wildcard is tried
/// only after an exact miss (spec §4.12).
pub struct Service {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: NetAddr,
}

impl Service {
    /// Binds `port` (0 picks an ephemeral port) and starts the accept loop.
    /// Installs the two default exports (`/` HTML index, `/index.json`
    /// JSON index) before any caller-supplied export (spec §4.12).
    pub async fn bind(ip: &str, port: u16, topic: impl Into<String>) -> Result<Service, Error> {
        let listener = TcpListener::bind((ip, port)).await?;
        let bound = listener.local_addr()?;
        let local_addr = NetAddr::new(ip.to_owned(), bound.port());

        let shared = Arc::new(Shared {
            topic: topic.into(),
            exports: Mutex::new(Vec::new()),
            quit: Arc::new(AtomicBool::new(false)),
        });
        shared.exports.lock().await.push(index_html_export());
        shared.exports.lock().await.push(index_json_export());

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, accept_shared).await;
        });

        Ok(Service { shared, accept_task: Mutex::new(Some(accept_task)), local_addr })
    }

    pub fn local_addr(&self) -> &NetAddr {
        &self.local_addr
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Appends an export. Later registrations of the same name shadow
    /// earlier ones only in that lookup finds the first match in
    /// registration order, so callers should register the more specific
    /// name first.
    pub async fn add_export(
        &self,
        name: impl Into<String>,
        mimetype_in: impl Into<String>,
        mimetype_out: impl Into<String>,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
        onrequest: OnRequest,
    ) {
        let export = Export {
            name: name.into(),
            mimetype_in: mimetype_in.into(),
            mimetype_out: mimetype_out.into(),
            user_data,
            onrequest,
        };
        self.shared.exports.lock().await.push(export);
    }

    pub async fn export_count(&self) -> usize {
        self.shared.exports.lock().await.len()
    }

    pub async fn shutdown(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

fn index_html_export() -> Export {
    let onrequest: OnRequest = Arc::new(|_req, resp, user_data| {
        let exports = user_data
            .and_then(|d| d.downcast::<Vec<(String, String)>>().ok())
            .map(|d| (*d).clone())
            .unwrap_or_default();
        let mut body = String::from("<html><body><ul>\n");
        for (name, uri) in exports {
            body.push_str(&format!("<li><a href=\"{uri}\">{name}</a></li>\n"));
        }
        body.push_str("</ul></body></html>\n");
        resp.with_body(body.into_bytes())
    });
    Export {
        name: "/".to_owned(),
        mimetype_in: String::new(),
        mimetype_out: "text/html".to_owned(),
        user_data: None,
        onrequest,
    }
}

fn index_json_export() -> Export {
    let onrequest: OnRequest = Arc::new(|_req, resp, user_data| {
        let exports = user_data
            .and_then(|d| d.downcast::<Vec<(String, String)>>().ok())
            .map(|d| (*d).clone())
            .unwrap_or_default();
        let resources: Vec<serde_json::Value> = exports
            .into_iter()
            .map(|(name, uri)| serde_json::json!({"name": name, "uri": uri}))
            .collect();
        let body = serde_json::json!({"resources": resources}).to_string();
        resp.with_body(body.into_bytes())
    });
    Export {
        name: "/index.json".to_owned(),
        mimetype_in: String::new(),
        mimetype_out: "application/json".to_owned(),
        user_data: None,
        onrequest,
    }
}

/// Finds the export for `path`: an exact match first, then the wildcard
/// fallback, scanning in registration order (spec §4.12).
fn resolve_export(exports: &[Export], path: &str) -> Option<Export> {
    exports
        .iter()
        .find(|e| !e.is_wildcard() && e.name == path)
        .or_else(|| exports.iter().find(|e| e.is_wildcard()))
        .cloned()
}

/// The user data handed to the two default index exports: the list of
/// non-default exports as `(name, uri)` pairs.
fn index_user_data(exports: &[Export]) -> Arc<dyn Any + Send + Sync> {
    let list: Vec<(String, String)> = exports
        .iter()
        .filter(|e| e.name != "/" && e.name != "/index.json")
        .map(|e| (e.name.clone(), e.name.clone()))
        .collect();
    Arc::new(list)
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
                tracing::warn!(error = %e, "service accept failed");
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
    let mut buffered = BufReader::new(&mut stream);
    let mut request = match Request::read_headers(&mut buffered).await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "malformed request on service socket");
            return;
        }
    };
    if let Err(e) = request.read_body(&mut buffered).await {
        tracing::debug!(error = %e, "failed reading service request body");
        return;
    }
    drop(buffered);

    let exports = shared.exports.lock().await.clone();
    let response = match resolve_export(&exports, &request.uri) {
        Some(export) => {
            let mut resp = Response::new(200);
            if !export.mimetype_out.is_empty() {
                resp.set_header("Content-Type", export.mimetype_out.clone());
            }
            let user_data = if export.name == "/" || export.name == "/index.json" {
                Some(index_user_data(&exports))
            } else {
                export.user_data.clone()
            };
            (export.onrequest)(request, resp, user_data)
        }
        None => Response::new(400),
    };
    response.write_to(&mut stream).await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn default_index_exports_are_installed() {
        let service = Service::bind("127.0.0.1", 0, "cluster.demo").await.unwrap();
        assert_eq!(service.export_count().await, 2);
        service.shutdown().await;
    }

    #[test]
    fn mimetype_lookup_is_exact_not_prefix() {
        assert_eq!(mimetype_for_filename("index.html"), Some("text/html"));
        assert_eq!(mimetype_for_filename("scene.glb"), Some("application/octet-stream"));
        assert_eq!(mimetype_for_filename("no-extension"), None);
        assert_eq!(extension_for_mimetype("image/jpeg"), Some(".jpg"));
        // Would prefix-match ".jpg"'s mimetype under the original's truncated
        // `strncmp` if the shorter-string-length bug were reproduced.
        assert_eq!(extension_for_mimetype("image/j"), None);
    }

    #[tokio::test]
    async fn exact_export_is_served_over_wildcard() {
        let service = Service::bind("127.0.0.1", 0, "cluster.demo").await.unwrap();
        let wildcard: OnRequest = Arc::new(|_req, resp, _ud| resp.with_body(b"wild".to_vec()));
        let exact: OnRequest = Arc::new(|_req, resp, _ud| resp.with_body(b"exact".to_vec()));
        service.add_export("*", "", "text/plain", None, wildcard).await;
        service.add_export("/thing", "", "text/plain", None, exact).await;

        let addr = service.local_addr().clone();
        let mut stream = tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)).await.unwrap();
        stream.write_all(b"GET /thing HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("exact"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn unmatched_path_with_no_wildcard_is_400() {
        let service = Service::bind("127.0.0.1", 0, "cluster.demo").await.unwrap();
        let addr = service.local_addr().clone();
        let mut stream = tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)).await.unwrap();
        stream.write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.starts_with("HTTP/1.1 400"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn index_json_lists_registered_exports() {
        let service = Service::bind("127.0.0.1", 0, "cluster.demo").await.unwrap();
        let onrequest: OnRequest = Arc::new(|_req, resp, _ud| resp.with_body(b"ok".to_vec()));
        service.add_export("/widget", "", "text/plain", None, onrequest).await;

        let addr = service.local_addr().clone();
        let mut stream = tokio::net::TcpStream::connect((addr.host.as_str(), addr.port)).await.unwrap();
        stream.write_all(b"GET /index.json HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("widget"));

        service.shutdown().await;
    }
}
