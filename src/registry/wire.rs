//! Registry wire protocol: tagged JSON request/reply/event schemas (spec
//! §4.10). Grounded on `crates/rt-protocol/src/lib.rs`'s tagged-enum
//! message style (`WsMessage`, `Heartbeat`, `ErrorMessage`), translated to
//! this system's `register`/`unregister`/`update-address`/`list`
//! vocabulary. Crates: `serde`/`serde_json`.

use crate::addr::NetAddr;
use crate::registry::store::RegistryEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    Register { entry: RegisterEntry },
    Unregister { id: String },
    UpdateAddress { id: String, addr: NetAddr },
    List,
}

/// The entry payload a client sends on `register`: everything but `id`,
/// which the registry assigns (spec §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    pub topic: String,
    #[serde(rename = "type")]
    pub endpoint_type: crate::registry::store::EndpointType,
    pub addr: NetAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "kebab-case")]
pub enum Reply {
    Register { success: bool, entry: Option<RegistryEntry>, message: Option<String> },
    Unregister { success: bool, message: Option<String> },
    UpdateAddress { success: bool, entry: Option<RegistryEntry>, message: Option<String> },
    List { success: bool, list: Vec<RegistryEntry> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    ProxyAdd { entry: RegistryEntry },
    ProxyRemove { id: String },
    ProxyUpdateAddress { id: String, addr: NetAddr },
}
