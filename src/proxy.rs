//! Client-side registry mirror and resolver (spec §3 "Proxy", §4.11).
//! Grounded on `original_source/src/data.c`/`proxy.h` for the mirror
//! concept, and on `services/forwarder/src/uplink.rs` for the
//! connect-with-retry shape (adapted to this system's 2 s/3-try backoff).

use crate::addr::NetAddr;
use crate::error::ProxyError;
use crate::registry::store::{EndpointType, RegistryEntry};
use crate::registry::wire::{Event, RegisterEntry, Reply, Request};
use crate::ws::link::Messagelink;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

const RETRY_INTERVAL: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    link: RwLock<Messagelink>,
    mirror: Arc<Mutex<HashMap<String, RegistryEntry>>>,
    registered: Arc<Mutex<HashMap<String, RegisterEntry>>>,
    pending: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
    registry_addr: NetAddr,
    quit: Arc<AtomicBool>,
    weak_self: Weak<Inner>,
}

/// A per-process mirror of the registry's tuple set, kept fresh by
/// broadcast events pushed over the same link used for requests. Survives
/// a registry restart: a closed link triggers a background reconnect that
/// reissues `list` and re-registers every locally registered endpoint
/// (spec §7 "Handshake failure", §8 "S5 Registry failover").
#[derive(Clone)]
pub struct Proxy(Arc<Inner>);

impl Proxy {
    /// Connects to the registry, retrying every 2 s up to 3 attempts (spec
    /// §7 "Handshake failure"), then issues `list` to seed the mirror.
    pub async fn connect(registry_addr: &NetAddr, quit: Arc<AtomicBool>) -> Result<Proxy, ProxyError> {
        let link = Self::connect_with_retry(registry_addr).await?;

        let inner = Arc::new_cyclic(|weak_self| Inner {
            link: RwLock::new(link.clone()),
            mirror: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(None)),
            registered: Arc::new(Mutex::new(HashMap::new())),
            registry_addr: registry_addr.clone(),
            quit,
            weak_self: weak_self.clone(),
        });
        wire_link(&inner, link).await;

        let proxy = Proxy(inner);
        match proxy.request(Request::List).await? {
            Reply::List { list, .. } => {
                let mut guard = proxy.0.mirror.lock().await;
                for entry in list {
                    guard.insert(entry.id.clone(), entry);
                }
            }
            _ => return Err(ProxyError::Registry("unexpected reply to list".into())),
        }

        Ok(proxy)
    }

    async fn connect_with_retry(registry_addr: &NetAddr) -> Result<Messagelink, ProxyError> {
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match Messagelink::connect("proxy", "registry", registry_addr).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                }
            }
        }
        Err(last_err.map(ProxyError::from).unwrap_or(ProxyError::Unreachable))
    }

    async fn request(&self, request: Request) -> Result<Reply, ProxyError> {
        let (tx, rx) = oneshot::channel();
        *self.0.pending.lock().await = Some(tx);
        self.0.link.read().await.send_obj(&request).await?;
        let value = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| ProxyError::Registry("registry request timed out".into()))?
            .map_err(|_| ProxyError::Registry("registry link closed before reply".into()))?;
        serde_json::from_value(value).map_err(|e| ProxyError::Registry(format!("malformed reply: {e}")))
    }

    /// Registers a local endpoint; on success the id is tracked so
    /// `shutdown` can unregister it.
    pub async fn register(
        &self,
        name: &str,
        topic: &str,
        endpoint_type: EndpointType,
        addr: NetAddr,
    ) -> Result<RegistryEntry, ProxyError> {
        let request_entry = RegisterEntry { name: name.to_owned(), topic: topic.to_owned(), endpoint_type, addr };
        match self.request(Request::Register { entry: request_entry.clone() }).await? {
            Reply::Register { success: true, entry: Some(entry), .. } => {
                self.0.mirror.lock().await.insert(entry.id.clone(), entry.clone());
                self.0.registered.lock().await.insert(entry.id.clone(), request_entry);
                Ok(entry)
            }
            Reply::Register { message, .. } => {
                Err(ProxyError::Registry(message.unwrap_or_else(|| "registration failed".into())))
            }
            _ => Err(ProxyError::Registry("unexpected reply to register".into())),
        }
    }

    pub async fn unregister(&self, id: &str) -> Result<(), ProxyError> {
        match self.request(Request::Unregister { id: id.to_owned() }).await? {
            Reply::Unregister { success: true, .. } => {
                self.0.mirror.lock().await.remove(id);
                self.0.registered.lock().await.remove(id);
                Ok(())
            }
            Reply::Unregister { message, .. } => {
                Err(ProxyError::Registry(message.unwrap_or_else(|| "unregister failed".into())))
            }
            _ => Err(ProxyError::Registry("unexpected reply to unregister".into())),
        }
    }

    pub async fn update_address(&self, id: &str, addr: NetAddr) -> Result<(), ProxyError> {
        match self.request(Request::UpdateAddress { id: id.to_owned(), addr: addr.clone() }).await? {
            Reply::UpdateAddress { success: true, .. } => {
                if let Some(e) = self.0.mirror.lock().await.get_mut(id) {
                    e.addr = addr;
                }
                Ok(())
            }
            Reply::UpdateAddress { message, .. } => {
                Err(ProxyError::Registry(message.unwrap_or_else(|| "update-address failed".into())))
            }
            _ => Err(ProxyError::Registry("unexpected reply to update-address".into())),
        }
    }

    async fn resolve(&self, topic: &str, endpoint_type: EndpointType) -> Option<NetAddr> {
        self.0
            .mirror
            .lock()
            .await
            .values()
            .find(|e| e.topic == topic && e.endpoint_type == endpoint_type)
            .map(|e| e.addr.clone())
    }

    pub async fn get_service(&self, topic: &str) -> Option<NetAddr> {
        self.resolve(topic, EndpointType::Service).await
    }

    pub async fn get_streamer(&self, topic: &str) -> Option<NetAddr> {
        self.resolve(topic, EndpointType::Streamer).await
    }

    pub async fn get_datahub(&self, topic: &str) -> Option<NetAddr> {
        self.resolve(topic, EndpointType::Datahub).await
    }

    pub async fn get_messagehub(&self, topic: &str) -> Option<NetAddr> {
        self.resolve(topic, EndpointType::Messagehub).await
    }

    /// Unregisters every endpoint this process registered, then closes the
    /// registry link (spec §4.11).
    pub async fn shutdown(&self) {
        self.0.quit.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.0.registered.lock().await.drain().map(|(id, _)| id).collect();
        for id in ids {
            self.request(Request::Unregister { id }).await.ok();
        }
        self.0.link.read().await.close(crate::ws::link::close_code::NORMAL).await.ok();
    }
}

/// Installs `onmessage`/`onclose` on `link` and starts its reader. `onclose`
/// spawns a background reconnect so a registry restart is transparent to
/// callers holding a `Proxy` (spec §8 "S5 Registry failover").
async fn wire_link(inner: &Arc<Inner>, link: Messagelink) {
    let cb_mirror = inner.mirror.clone();
    let cb_pending = inner.pending.clone();
    let onmessage = Arc::new(move |_link: Messagelink, value: Value| {
        let mirror = cb_mirror.clone();
        let pending = cb_pending.clone();
        tokio::spawn(async move {
            if let Ok(event) = serde_json::from_value::<Event>(value.clone()) {
                apply_event(&mirror, event).await;
            } else if let Some(tx) = pending.lock().await.take() {
                tx.send(value).ok();
            }
        });
    });
    link.set_onmessage(onmessage).await;

    let weak_self = inner.weak_self.clone();
    let onclose = Arc::new(move |_closed: Messagelink| {
        let weak_self = weak_self.clone();
        tokio::spawn(async move {
            if let Some(inner) = weak_self.upgrade() {
                reconnect(inner).await;
            }
        });
    });
    link.set_onclose(onclose).await;

    link.spawn_reader(inner.quit.clone()).await;
}

/// Reconnects to the registry after an unexpected close, reissues `list` to
/// refresh the mirror, and re-registers every endpoint this process had
/// registered before the disconnect (spec §8 "S5 Registry failover").
async fn reconnect(inner: Arc<Inner>) {
    loop {
        if inner.quit.load(Ordering::SeqCst) {
            return;
        }
        let new_link = match Proxy::connect_with_retry(&inner.registry_addr).await {
            Ok(link) => link,
            Err(_) => {
                tokio::time::sleep(RETRY_INTERVAL).await;
                continue;
            }
        };
        wire_link(&inner, new_link.clone()).await;
        *inner.link.write().await = new_link;

        let proxy = Proxy(inner.clone());
        if let Ok(Reply::List { list, .. }) = proxy.request(Request::List).await {
            let mut guard = inner.mirror.lock().await;
            guard.clear();
            for entry in list {
                guard.insert(entry.id.clone(), entry);
            }
        }

        let stale: Vec<RegisterEntry> = inner.registered.lock().await.drain().map(|(_, e)| e).collect();
        for entry in stale {
            proxy.register(&entry.name, &entry.topic, entry.endpoint_type, entry.addr).await.ok();
        }
        return;
    }
}

async fn apply_event(mirror: &Arc<Mutex<HashMap<String, RegistryEntry>>>, event: Event) {
    let mut guard = mirror.lock().await;
    match event {
        Event::ProxyAdd { entry } => {
            guard.insert(entry.id.clone(), entry);
        }
        Event::ProxyRemove { id } => {
            guard.remove(&id);
        }
        Event::ProxyUpdateAddress { id, addr } => {
            if let Some(entry) = guard.get_mut(&id) {
                entry.addr = addr;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::server::RegistryServer;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn register_and_resolve_round_trip() {
        let server = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let registry_addr = server.local_addr().clone();
        let quit = Arc::new(AtomicBool::new(false));

        let proxy = Proxy::connect(&registry_addr, quit.clone()).await.unwrap();
        proxy
            .register("foo-svc", "cluster.foo", EndpointType::Service, NetAddr::new("127.0.0.1", 9100))
            .await
            .unwrap();

        let resolved = proxy.get_service("cluster.foo").await;
        assert_eq!(resolved, Some(NetAddr::new("127.0.0.1", 9100)));

        proxy.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn second_proxy_observes_broadcast_add() {
        let server = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let registry_addr = server.local_addr().clone();
        let quit = Arc::new(AtomicBool::new(false));

        let writer = Proxy::connect(&registry_addr, quit.clone()).await.unwrap();
        let reader = Proxy::connect(&registry_addr, quit.clone()).await.unwrap();

        writer
            .register("bar-svc", "cluster.bar", EndpointType::Service, NetAddr::new("127.0.0.1", 9200))
            .await
            .unwrap();

        let mut resolved = None;
        for _ in 0..50 {
            resolved = reader.get_service("cluster.bar").await;
            if resolved.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(resolved, Some(NetAddr::new("127.0.0.1", 9200)));

        writer.shutdown().await;
        reader.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_and_reregisters_after_registry_restart() {
        let first = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let registry_addr = first.local_addr().clone();
        let quit = Arc::new(AtomicBool::new(false));

        let proxy = Proxy::connect(&registry_addr, quit.clone()).await.unwrap();
        proxy
            .register("cam-svc", "cluster.cam", EndpointType::Service, NetAddr::new("127.0.0.1", 9300))
            .await
            .unwrap();

        first.shutdown().await;
        drop(first);

        // Restart the registry on the same address; the proxy's onclose
        // handler should notice, reconnect, and re-register.
        let second = RegistryServer::bind(&registry_addr.host, registry_addr.port).await.unwrap();

        let mut resolved = None;
        for _ in 0..100 {
            resolved = proxy.get_service("cluster.cam").await;
            if resolved.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(resolved, Some(NetAddr::new("127.0.0.1", 9300)));
        assert_eq!(second.entry_count().await, 1);

        proxy.shutdown().await;
        second.shutdown().await;
    }
}
