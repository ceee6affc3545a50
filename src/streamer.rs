//! Streamer/streamerlink (HTTP multipart push) boundary. Out of core scope
//! (spec §1 Non-goals): the multipart chunk encoder/pusher is not
//! implemented here, only the trait a registry entry of type
//! `streamer`/`streamerlink` names so the rest of the crate can refer to it
//! without depending on a multipart implementation.

/// A sink for outbound multipart chunks on a streamer/streamerlink's
/// channel. Left unimplemented: multipart push is out of scope (spec §1).
pub trait ChunkSink: Send + Sync {
    fn push(&self, mimetype: &str, chunk: &[u8]) -> Result<(), crate::error::Error>;
}
