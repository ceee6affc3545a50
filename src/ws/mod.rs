pub mod frame;
pub mod handshake;
pub mod hub;
pub mod link;

pub use hub::{BroadcastError, Messagehub, OnConnect, OnRequest};
pub use link::{close_code, LinkId, LinkState, Messagelink, OnClose, OnMessage, OnPong};
