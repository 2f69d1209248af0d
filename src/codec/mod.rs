//! Keyed packet obfuscation
//!
//! Every packet crossing the relay is transformed in place by [`Obfuscator`]:
//! the tunnel protocol's recognizable type header is scrambled, a random
//! amount of dummy padding is appended to vary observed packet lengths, and
//! the whole buffer is whitened with a key-derived byte stream.
//!
//! The whitening stream is derived from position, key, and total length
//! rather than from previously ciphered bytes, so the same routine runs for
//! both directions.

use rand::Rng;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Obfuscation key is empty")]
    EmptyKey,

    #[error("Packet too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Declared dummy length {dummy} exceeds packet length {len}")]
    BadDummyLength { dummy: usize, len: usize },
}

/// Maximum dummy padding appended to handshake packets
pub const MAX_DUMMY_LENGTH_HANDSHAKE: usize = 512;

/// Maximum dummy padding appended to cookie/data packets
pub const MAX_DUMMY_LENGTH_DATA: usize = 4;

/// Ceiling for payload + dummy padding; longer packets are left unpadded
pub const MAX_DUMMY_LENGTH_TOTAL: usize = 1024;

/// Tunnel packet types, read from the 4-byte little-endian field at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    HandshakeInit,
    HandshakeResponse,
    CookieReply,
    Data,
}

impl PacketType {
    /// Read the packet type from the wire header, if it is a known type.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        match u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) {
            1 => Some(PacketType::HandshakeInit),
            2 => Some(PacketType::HandshakeResponse),
            3 => Some(PacketType::CookieReply),
            4 => Some(PacketType::Data),
            _ => None,
        }
    }

    /// True for the two packet types that carry the tunnel's key exchange.
    pub fn is_handshake(self) -> bool {
        matches!(self, PacketType::HandshakeInit | PacketType::HandshakeResponse)
    }
}

/// True once a buffer no longer starts with a recognizable type field.
pub fn is_obfuscated(buf: &[u8]) -> bool {
    PacketType::from_wire(buf).is_none()
}

/// The obfuscation engine. Stateless apart from its key; shared read-only by
/// both forwarding directions.
pub struct Obfuscator {
    key: Vec<u8>,
}

impl Obfuscator {
    /// Create an obfuscator from raw key bytes. The key must be non-empty.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, CodecError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok(Self { key })
    }

    /// Obfuscate `buf[..len]` in place and return the new logical length.
    ///
    /// The caller must provision capacity for worst-case growth: up to
    /// [`MAX_DUMMY_LENGTH_TOTAL`] total bytes for packets shorter than that.
    pub fn encode(&self, buf: &mut [u8], len: usize) -> usize {
        let packet_type = PacketType::from_wire(&buf[..len]);

        let mut rng = rand::thread_rng();
        let rnd: u8 = rng.gen_range(1..=255);
        buf[0] ^= rnd;
        buf[1] = rnd;

        let mut dummy_len = 0usize;
        if len < MAX_DUMMY_LENGTH_TOTAL {
            let room = (MAX_DUMMY_LENGTH_TOTAL - len).min(buf.len() - len);
            let cap = match packet_type {
                Some(t) if t.is_handshake() => MAX_DUMMY_LENGTH_HANDSHAKE,
                Some(_) => MAX_DUMMY_LENGTH_DATA,
                None => 0,
            };
            let bound = room.min(cap);
            if bound > 0 {
                dummy_len = rng.gen_range(0..bound);
            }
        }

        buf[2] = (dummy_len & 0xFF) as u8;
        buf[3] = ((dummy_len >> 8) & 0xFF) as u8;
        for b in &mut buf[len..len + dummy_len] {
            *b = 0xFF;
        }

        xor_data(&mut buf[..len + dummy_len], &self.key);
        len + dummy_len
    }

    /// Deobfuscate `buf[..len]` in place and return the payload length.
    ///
    /// The declared receive length is required before un-whitening because
    /// the whitening stream depends on the total length it was computed over.
    pub fn decode(&self, buf: &mut [u8], len: usize) -> Result<usize, CodecError> {
        if len < 4 {
            return Err(CodecError::Truncated { len });
        }

        xor_data(&mut buf[..len], &self.key);

        buf[0] ^= buf[1];
        let dummy_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        buf[1] = 0;
        buf[2] = 0;
        buf[3] = 0;

        if dummy_len > len {
            return Err(CodecError::BadDummyLength { dummy: dummy_len, len });
        }
        Ok(len - dummy_len)
    }
}

/// Keyed whitening pass, symmetric for encode and decode.
///
/// A running Dallas/Maxim CRC-8 (reflected polynomial 0x8C) is fed, for byte
/// `i`, with `key[i % klen] + total_len + klen` (wrapping); the evolving
/// register value is XORed into each buffer byte.
fn xor_data(buf: &mut [u8], key: &[u8]) {
    let len = buf.len();
    let klen = key.len();
    let mut crc: u8 = 0;
    for (i, b) in buf.iter_mut().enumerate() {
        let mut inbyte = key[i % klen].wrapping_add((len.wrapping_add(klen)) as u8);
        for _ in 0..8 {
            let mix = (crc ^ inbyte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            inbyte >>= 1;
        }
        *b ^= crc;
    }
}
