//! The registry process: a `Messagehub` wired to a `RegistryStore` so that
//! inbound `register`/`unregister`/`update-address`/`list` requests mutate
//! the store, reply on the same link, and broadcast change events to every
//! other connected link (spec §4.9/§4.10). Grounded on
//! `services/server/src/ws_forwarder.rs` (per-connection handler wired to
//! shared state) and `original_source/src/rcregistry.c` /
//! `src/registry.c` for the broadcast-on-mutation behaviour.

use crate::addr::NetAddr;
use crate::error::Error;
use crate::registry::store::{EntryFilter, RegistryStore};
use crate::registry::wire::{Event, Reply, Request};
use crate::ws::hub::{Messagehub, OnConnect};
use crate::ws::link::{LinkId, Messagelink};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_PORT: u16 = 10101;

pub struct RegistryServer {
    hub: Arc<Messagehub>,
    store: Arc<RegistryStore>,
}

impl RegistryServer {
    pub async fn bind(ip: &str, port: u16) -> Result<RegistryServer, Error> {
        let store = Arc::new(RegistryStore::new());
        let hub_cell: Arc<RwLock<Option<std::sync::Weak<Messagehub>>>> = Arc::new(RwLock::new(None));

        let onconnect_store = store.clone();
        let onconnect_hub_cell = hub_cell.clone();
        let onconnect: OnConnect = Arc::new(move |link: Messagelink| {
            let store = onconnect_store.clone();
            let hub_cell = onconnect_hub_cell.clone();
            Box::pin(async move { wire_link(link, store, hub_cell).await })
        });

        let hub = Arc::new(Messagehub::bind(ip, port, onconnect).await?);
        *hub_cell.write().await = Some(Arc::downgrade(&hub));

        Ok(RegistryServer { hub, store })
    }

    pub fn local_addr(&self) -> &NetAddr {
        self.hub.local_addr()
    }

    pub async fn entry_count(&self) -> usize {
        self.store.count(&EntryFilter::default()).await
    }

    pub async fn shutdown(&self) {
        self.hub.delete().await;
    }
}

async fn wire_link(
    link: Messagelink,
    store: Arc<RegistryStore>,
    hub_cell: Arc<RwLock<Option<std::sync::Weak<Messagehub>>>>,
) {
    let dispatch_link = link.clone();
    let dispatch_store = store.clone();
    let dispatch_hub_cell = hub_cell.clone();
    let onmessage = Arc::new(move |_link: Messagelink, value: Value| {
        let link = dispatch_link.clone();
        let store = dispatch_store.clone();
        let hub_cell = dispatch_hub_cell.clone();
        tokio::spawn(async move {
            dispatch(&link, &store, &hub_cell, value).await;
        });
    });
    link.set_onmessage(onmessage).await;

    // A disconnecting owner drops every entry it registered, so stale
    // addresses don't outlive the process that published them.
    let onclose = Arc::new(move |closed: Messagelink| {
        let store = store.clone();
        let hub_cell = hub_cell.clone();
        tokio::spawn(async move {
            let owner = closed.id().to_string();
            let removed = store.delete_owned_by(&owner).await;
            for entry in removed {
                broadcast_event(&hub_cell, &Event::ProxyRemove { id: entry.id }, closed.id()).await;
            }
        });
    });
    link.set_onclose(onclose).await;
}

async fn dispatch(
    link: &Messagelink,
    store: &Arc<RegistryStore>,
    hub_cell: &Arc<RwLock<Option<std::sync::Weak<Messagehub>>>>,
    value: Value,
) {
    let request: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "malformed registry request");
            return;
        }
    };

    match request {
        Request::Register { entry } => {
            let result = store
                .insert(&link.id().to_string(), entry.name, entry.topic, entry.endpoint_type, entry.addr)
                .await;
            match result {
                Ok(registered) => {
                    let reply = Reply::Register { success: true, entry: Some(registered.clone()), message: None };
                    link.send_obj(&reply).await.ok();
                    broadcast_event(hub_cell, &Event::ProxyAdd { entry: registered }, link.id()).await;
                }
                Err(e) => {
                    let reply = Reply::Register { success: false, entry: None, message: Some(e.to_string()) };
                    link.send_obj(&reply).await.ok();
                }
            }
        }
        Request::Unregister { id } => match store.delete(&id).await {
            Ok(_) => {
                let reply = Reply::Unregister { success: true, message: None };
                link.send_obj(&reply).await.ok();
                broadcast_event(hub_cell, &Event::ProxyRemove { id }, link.id()).await;
            }
            Err(e) => {
                let reply = Reply::Unregister { success: false, message: Some(e.to_string()) };
                link.send_obj(&reply).await.ok();
            }
        },
        Request::UpdateAddress { id, addr } => match store.update_addr(&id, addr.clone()).await {
            Ok(updated) => {
                let reply = Reply::UpdateAddress { success: true, entry: Some(updated), message: None };
                link.send_obj(&reply).await.ok();
                broadcast_event(hub_cell, &Event::ProxyUpdateAddress { id, addr }, link.id()).await;
            }
            Err(e) => {
                let reply = Reply::UpdateAddress { success: false, entry: None, message: Some(e.to_string()) };
                link.send_obj(&reply).await.ok();
            }
        },
        Request::List => {
            let list = store.select_all().await;
            let reply = Reply::List { success: true, list };
            link.send_obj(&reply).await.ok();
        }
    }
}

async fn broadcast_event(
    hub_cell: &Arc<RwLock<Option<std::sync::Weak<Messagehub>>>>,
    event: &Event,
    exclude: LinkId,
) {
    if let Some(hub) = hub_cell.read().await.as_ref().and_then(|w| w.upgrade()) {
        if let Err(e) = hub.broadcast_obj(event, Some(exclude)).await {
            tracing::warn!(error = %e, "registry change event broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::EndpointType;
    use crate::registry::wire::RegisterEntry;
    use crate::ws::link::Messagelink as Link;

    #[tokio::test]
    async fn register_then_list_round_trips() {
        let server = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().clone();

        let client = Link::connect("tester", "registry", &addr).await.unwrap();
        let reply = client
            .command(
                &serde_json::to_string(&Request::Register {
                    entry: RegisterEntry {
                        name: "foo-svc".into(),
                        topic: "cluster.foo".into(),
                        endpoint_type: EndpointType::Service,
                        addr: NetAddr::new("127.0.0.1", 9100),
                    },
                })
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reply["success"], serde_json::json!(true));

        let list_reply = client.command(&serde_json::to_string(&Request::List).unwrap()).await.unwrap();
        let list = list_reply["list"].as_array().unwrap();
        assert_eq!(list.len(), 1);

        client.close(crate::ws::link::close_code::NORMAL).await.unwrap();
        server.shutdown().await;
    }
}
