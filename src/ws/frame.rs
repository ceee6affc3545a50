//! RFC 6455 frame encode/decode, masking, and the 7/16/64-bit length forms
//! (spec §4.1). Grounded on
//! `examples/other_examples/562511f5_sjwe-ktls-uring-demo__src-websocket.rs.rs`
//! (`encode_frame`/`parse_frame_header`/`decode_frame`), cross-checked
//! against `original_source/src/messagelink.c` (`frame_make_header`,
//! `_make_mask`, `frame_read`) for the masked-length-byte encoding (254/255)
//! and the oversize-payload rule.

use crate::error::WsError;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames larger than this are rejected (spec §4.1) and trigger a 1009 close.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;
/// Payload is read off the wire in chunks no larger than this (spec §4.1).
const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(b: u8) -> Option<Opcode> {
        match b {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// Which side of the connection the local process is playing. Governs
/// masking on send (clients mask, servers never do) and the unmask-on-read
/// rule (only a server unmasks inbound frames; spec invariant #3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

fn make_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut mask);
    mask
}

fn apply_mask(buf: &mut [u8], mask: [u8; 4], start_index: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(start_index + i) % 4];
    }
}

/// Encode a single, unfragmented (`fin=1`) frame. `masked` must be `true`
/// for client-originated frames and `false` for server-originated frames —
/// this is a hard invariant of spec §4.1, enforced by callers in `link.rs`
/// rather than here.
pub fn encode(opcode: Opcode, masked: bool, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let header_len = if len < 126 {
        2
    } else if len <= 65535 {
        4
    } else {
        10
    };
    let mask_len = if masked { 4 } else { 0 };
    let mut out = Vec::with_capacity(header_len + mask_len + payload.len());

    out.push(0x80 | opcode.to_u8());

    let mask_bit = if masked { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= 65535 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&len.to_be_bytes());
    }

    if masked {
        let mask = make_mask();
        out.extend_from_slice(&mask);
        let mut body = payload.to_vec();
        apply_mask(&mut body, mask, 0);
        out.extend_from_slice(&body);
    } else {
        out.extend_from_slice(payload);
    }

    out
}

/// Read one complete frame from `reader`. `role` is the local role: a
/// server unmasks inbound payload bytes as it reads them; a client does not
/// (a conformant server never masks).
pub async fn read_frame<R>(reader: &mut R, role: Role) -> Result<Frame, WsError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = head[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(head[0] & 0x0f).ok_or(WsError::UnsupportedOpcode(head[0] & 0x0f))?;
    let mask_flag = head[1] & 0x80 != 0;
    let len7 = head[1] & 0x7f;

    let length: u64 = match len7 {
        126 => {
            let mut b = [0u8; 2];
            reader.read_exact(&mut b).await?;
            u16::from_be_bytes(b) as u64
        }
        127 => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b).await?;
            u64::from_be_bytes(b)
        }
        n => n as u64,
    };

    if length as usize > MAX_PAYLOAD {
        return Err(WsError::TooBig(length as usize));
    }

    if role == Role::Server && !mask_flag {
        return Err(WsError::Unmasked);
    }

    let mask = if mask_flag {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        m
    } else {
        [0u8; 4]
    };

    let mut payload = vec![0u8; length as usize];
    let mut read_so_far = 0usize;
    while read_so_far < payload.len() {
        let end = (read_so_far + READ_CHUNK).min(payload.len());
        reader.read_exact(&mut payload[read_so_far..end]).await?;
        if role == Role::Server {
            apply_mask(&mut payload[read_so_far..end], mask, read_so_far);
        }
        read_so_far = end;
    }

    Ok(Frame { fin, opcode, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(role: Role, opcode: Opcode, masked: bool, payload: &[u8]) -> Frame {
        let bytes = encode(opcode, masked, payload);
        let mut cursor = std::io::Cursor::new(bytes);
        read_frame(&mut cursor, role).await.unwrap()
    }

    #[tokio::test]
    async fn encode_decode_identity_for_various_sizes() {
        for size in [0usize, 125, 126, 65535, 65536, 1_000_000] {
            let payload = vec![0xAB; size];
            let frame = roundtrip(Role::Server, Opcode::Text, true, &payload).await;
            assert_eq!(frame.payload, payload, "size {size}");
            assert!(frame.fin);
        }
    }

    #[tokio::test]
    async fn client_role_does_not_unmask_server_frames() {
        // Servers never mask, so a client reading never unmasks regardless
        // of the mask flag it sees.
        let frame = roundtrip(Role::Client, Opcode::Text, false, b"hello").await;
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn server_rejects_unmasked_frame() {
        let bytes = encode(Opcode::Text, false, b"hi");
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_frame(&mut cursor, Role::Server).await.unwrap_err();
        assert!(matches!(err, WsError::Unmasked));
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected() {
        // Craft a header claiming a payload larger than MAX_PAYLOAD without
        // actually allocating/writing it.
        let mut header = vec![0x80 | 0x1, 0x80 | 127];
        header.extend_from_slice(&((MAX_PAYLOAD as u64) + 1).to_be_bytes());
        header.extend_from_slice(&[0u8; 4]); // mask
        let mut cursor = std::io::Cursor::new(header);
        let err = read_frame(&mut cursor, Role::Server).await.unwrap_err();
        assert!(matches!(err, WsError::TooBig(_)));
    }

    #[test]
    fn large_payload_uses_10_byte_header() {
        let payload = vec![0u8; 70_000];
        let bytes = encode(Opcode::Text, false, &payload);
        assert_eq!(bytes[1], 127);
        let len = u64::from_be_bytes(bytes[2..10].try_into().unwrap());
        assert_eq!(len, 70_000);
        assert_eq!(&bytes[10..], &payload[..]);
    }
}
