//! Datahub/datalink (UDP) boundary. Out of core scope (spec §1 Non-goals):
//! the actual datagram transport is not implemented here, only the trait
//! a registry entry of type `datahub`/`datalink` names so the rest of the
//! crate can refer to it without depending on a UDP implementation.

use crate::addr::NetAddr;

/// A sink for outbound UDP datagrams on a datahub/datalink's channel.
/// Left unimplemented: the UDP transport itself is out of scope (spec §1).
pub trait DatagramSink: Send + Sync {
    fn local_addr(&self) -> &NetAddr;
    fn send(&self, payload: &[u8]) -> Result<(), crate::error::Error>;
}
