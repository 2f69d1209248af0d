//! Pluggable traffic masking
//!
//! A masking strategy re-encapsulates already-obfuscated packets inside a
//! decoy protocol's wire format so the relayed stream fingerprints as that
//! protocol instead of as high-entropy UDP. Strategies implement [`Masker`]
//! and are enumerated in a fixed registry keyed by a stable string id;
//! `"none"` is a valid id meaning no second layer.

mod stun;

pub use stun::StunMasker;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::warn;

/// Masking errors
#[derive(Debug, Error)]
pub enum MaskingError {
    #[error("Masked packet would exceed buffer capacity ({needed} > {capacity})")]
    BufferFull { needed: usize, capacity: usize },

    #[error("Send failed: {0}")]
    Send(#[from] io::Error),
}

/// Which way a packet is flowing through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Outcome of unwrapping a received buffer.
///
/// `Consumed` and `Malformed` are kept distinct even though both mean
/// "nothing to forward this round": consumed packets are the decoy protocol's
/// own control traffic and are dropped silently, malformed ones are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwrapped {
    /// Real payload of the given length now sits at the front of the buffer.
    Payload(usize),
    /// Valid decoy control traffic, absorbed by the masker.
    Consumed,
    /// Framing error; the buffer contents are undefined.
    Malformed,
}

/// A one-shot send function bound to one destination, handed into masker
/// hooks so a strategy can answer protocol control messages without the
/// relay loop's involvement.
#[derive(Clone)]
pub struct ReplySink {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl ReplySink {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self { socket, target }
    }

    /// Destination this sink replies toward.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Fire-and-forget datagram send; backpressure is left to the OS.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.target).await
    }
}

/// Capability set every masking strategy implements.
///
/// All buffer transforms are in place and must not exceed the buffer's
/// capacity; hooks receive reply sinks bound toward the client and toward
/// the server for the current exchange.
#[async_trait]
pub trait Masker: Send + Sync {
    /// Periodic keepalive interval, or `None` if the strategy needs no timer.
    fn timer_interval(&self) -> Option<Duration> {
        None
    }

    /// Fired once per observed handshake-type packet flowing client→server,
    /// before the data-wrap step; lets the masker run an out-of-band priming
    /// exchange with the remote endpoint.
    async fn on_handshake_request(
        &self,
        direction: Direction,
        src: SocketAddr,
        dst: SocketAddr,
        back: &ReplySink,
        forward: &ReplySink,
    ) -> Result<(), MaskingError>;

    /// Re-encapsulate `buf[..len]` before it leaves on the wire; returns the
    /// new logical length.
    fn on_data_wrap(&self, buf: &mut [u8], len: usize) -> Result<usize, MaskingError>;

    /// Inverse of wrap, dispatching on the decoy protocol's own framing.
    async fn on_data_unwrap(
        &self,
        buf: &mut [u8],
        len: usize,
        src: SocketAddr,
        dst: SocketAddr,
        back: &ReplySink,
        forward: &ReplySink,
    ) -> Unwrapped;

    /// Invoked on each tick of the keepalive task while a client is known.
    async fn on_timer(
        &self,
        client: SocketAddr,
        server: SocketAddr,
        to_client: &ReplySink,
        to_server: &ReplySink,
    ) -> Result<(), MaskingError>;
}

/// A registry entry: stable id, human-readable label, and a constructor
/// (`None` means "no second layer").
pub struct MaskingKind {
    pub id: &'static str,
    pub label: &'static str,
    factory: Option<fn() -> Arc<dyn Masker>>,
}

impl MaskingKind {
    /// Instantiate this strategy, or `None` for the identity entry.
    pub fn create(&self) -> Option<Arc<dyn Masker>> {
        self.factory.map(|f| f())
    }
}

fn new_stun() -> Arc<dyn Masker> {
    Arc::new(StunMasker::new())
}

/// Fixed, ordered strategy table; the first entry is the identity.
static MASKINGS: [MaskingKind; 2] = [
    MaskingKind {
        id: "none",
        label: "No masking",
        factory: None,
    },
    MaskingKind {
        id: "stun",
        label: "STUN (NAT traversal decoy)",
        factory: Some(new_stun),
    },
];

/// All registered masking strategies, in presentation order.
pub fn all() -> &'static [MaskingKind] {
    &MASKINGS
}

/// Exact-id lookup, used for internal round-trips.
pub fn find(id: &str) -> Option<&'static MaskingKind> {
    MASKINGS.iter().find(|kind| kind.id == id)
}

/// Case-insensitive lookup, used when resolving external configuration input.
pub fn resolve(id: &str) -> Option<&'static MaskingKind> {
    MASKINGS.iter().find(|kind| kind.id.eq_ignore_ascii_case(id))
}

/// Instantiate the masker for `id`. An unknown id falls back to no masking
/// rather than failing the relay.
pub fn create(id: &str) -> Option<Arc<dyn Masker>> {
    match find(id) {
        Some(kind) => kind.create(),
        None => {
            warn!("Unknown masking id '{}', falling back to no masking", id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_with_identity() {
        let kinds = all();
        assert_eq!(kinds[0].id, "none");
        assert!(kinds[0].create().is_none());
    }

    #[test]
    fn find_is_case_sensitive() {
        assert!(find("stun").is_some());
        assert!(find("STUN").is_none());
    }

    #[test]
    fn resolve_is_case_insensitive() {
        assert_eq!(resolve("NONE").unwrap().id, "none");
        assert_eq!(resolve("Stun").unwrap().id, "stun");
        assert!(resolve("quic").is_none());
    }

    #[test]
    fn unknown_id_falls_back_to_no_masking() {
        assert!(create("does-not-exist").is_none());
        assert!(create("none").is_none());
        assert!(create("stun").is_some());
    }

    #[test]
    fn stun_declares_timer_interval() {
        let masker = create("stun").unwrap();
        assert_eq!(masker.timer_interval(), Some(Duration::from_secs(10)));
    }
}
