//! # Mirage Relay
//!
//! A local UDP relay that disguises a WireGuard-style tunnel's handshake and
//! data packets so that passive or active traffic inspection cannot easily
//! recognize them.
//!
//! The relay sits between a tunnel client bound to loopback and a remote
//! tunnel endpoint, rewriting every packet in both directions:
//!
//! ```text
//! ┌────────┐      ┌──────────────────────────────────────┐      ┌────────┐
//! │ tunnel │ ───► │  listen socket → codec → masking ──► │ ───► │ remote │
//! │ client │ ◄─── │  ◄── masking → codec ← upstream sock │ ◄─── │ server │
//! └────────┘      └──────────────────────────────────────┘      └────────┘
//! ```
//!
//! - [`codec`] — keyed byte-obfuscation applied in place to every packet
//! - [`masking`] — optional second layer wrapping obfuscated packets inside
//!   decoy STUN framing, plus the registry of masking strategies
//! - [`relay`] — the concurrent forwarding engine and session state
//! - [`config`] — settings persistence, validation, and import parsing

pub mod codec;
pub mod config;
pub mod masking;
pub mod relay;

pub use codec::{Obfuscator, PacketType};
pub use config::{RelayConfig, RelaySettings};
pub use relay::{Relay, RelayStatus};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Receive buffer size for both relay directions (max UDP datagram)
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Masking error: {0}")]
    Masking(#[from] masking::MaskingError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
