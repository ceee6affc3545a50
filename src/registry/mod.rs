pub mod server;
pub mod store;
pub mod wire;

pub use server::RegistryServer;
pub use store::{EndpointType, EntryFilter, RegistryEntry, RegistryStore};
