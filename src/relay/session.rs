//! Per-run session state
//!
//! One [`Session`] exists per relay run. It is mutated by the client-forward
//! loop and read by the server-return and keepalive loops, so the whole
//! record lives behind a single lock — readers always observe a consistent
//! client address and handshake phase together.

use std::net::SocketAddr;

/// Handshake progress for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No handshake initiation forwarded yet.
    WaitingForHandshake,
    /// Initiation forwarded to the remote; waiting for the response.
    HandshakeSent,
    /// Response returned from the remote while in `HandshakeSent`.
    HandshakeAcked,
}

impl HandshakePhase {
    fn label(self) -> &'static str {
        match self {
            HandshakePhase::WaitingForHandshake => "waiting for handshake",
            HandshakePhase::HandshakeSent => "handshake sent",
            HandshakePhase::HandshakeAcked => "handshake complete",
        }
    }
}

/// Mutable session record shared by the relay loops.
#[derive(Debug)]
pub struct Session {
    client: Option<SocketAddr>,
    phase: HandshakePhase,
    tx_bytes: u64,
    rx_bytes: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            client: None,
            phase: HandshakePhase::WaitingForHandshake,
            tx_bytes: 0,
            rx_bytes: 0,
        }
    }

    /// Currently tracked client, if one has been observed.
    pub fn client(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Track the observed client address. A change of address or port is a
    /// reconnect (NAT rebinding or roaming), not an error: the handshake
    /// phase resets. Returns true if the tracked client changed.
    pub fn track_client(&mut self, addr: SocketAddr) -> bool {
        if self.client == Some(addr) {
            return false;
        }
        self.client = Some(addr);
        self.phase = HandshakePhase::WaitingForHandshake;
        true
    }

    /// Record a forwarded handshake initiation. Returns true on the first
    /// transition into `HandshakeSent` for this client.
    pub fn mark_handshake_sent(&mut self) -> bool {
        if self.phase == HandshakePhase::WaitingForHandshake {
            self.phase = HandshakePhase::HandshakeSent;
            return true;
        }
        false
    }

    /// Record a returned handshake response. Only acknowledges while in
    /// `HandshakeSent`; returns true on the transition.
    pub fn mark_handshake_acked(&mut self) -> bool {
        if self.phase == HandshakePhase::HandshakeSent {
            self.phase = HandshakePhase::HandshakeAcked;
            return true;
        }
        false
    }

    pub fn add_tx(&mut self, bytes: usize) {
        self.tx_bytes += bytes as u64;
    }

    pub fn add_rx(&mut self, bytes: usize) {
        self.rx_bytes += bytes as u64;
    }

    /// Human-readable status line: handshake phase plus traffic volume.
    pub fn status_line(&self) -> String {
        format!(
            "Running: {}, up {}, down {}",
            self.phase.label(),
            format_bytes(self.tx_bytes),
            format_bytes(self.rx_bytes)
        )
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a byte count with binary magnitude units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} {}", bytes, UNITS[0]);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn handshake_transitions_fire_once() {
        let mut session = Session::new();
        assert_eq!(session.phase(), HandshakePhase::WaitingForHandshake);

        session.track_client(addr(1000));
        assert!(session.mark_handshake_sent());
        assert!(!session.mark_handshake_sent());
        assert_eq!(session.phase(), HandshakePhase::HandshakeSent);

        assert!(session.mark_handshake_acked());
        assert!(!session.mark_handshake_acked());
        assert_eq!(session.phase(), HandshakePhase::HandshakeAcked);
    }

    #[test]
    fn ack_requires_sent_phase() {
        let mut session = Session::new();
        assert!(!session.mark_handshake_acked());
        assert_eq!(session.phase(), HandshakePhase::WaitingForHandshake);
    }

    #[test]
    fn client_roaming_resets_phase() {
        let mut session = Session::new();
        assert!(session.track_client(addr(1000)));
        session.mark_handshake_sent();
        session.mark_handshake_acked();

        // Same address: no change, phase kept.
        assert!(!session.track_client(addr(1000)));
        assert_eq!(session.phase(), HandshakePhase::HandshakeAcked);

        // New port: treated as a reconnect.
        assert!(session.track_client(addr(2000)));
        assert_eq!(session.phase(), HandshakePhase::WaitingForHandshake);
    }

    #[test]
    fn counters_accumulate() {
        let mut session = Session::new();
        session.add_tx(100);
        session.add_tx(200);
        session.add_rx(4096);
        let line = session.status_line();
        assert!(line.contains("300 B"), "{}", line);
        assert!(line.contains("4.0 KiB"), "{}", line);
    }

    #[test]
    fn byte_formatting_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024 * 1024), "2.0 TiB");
    }
}
