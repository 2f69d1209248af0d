//! STUN decoy masking
//!
//! Re-encapsulates obfuscated tunnel packets inside STUN wire framing so the
//! stream fingerprints as NAT-traversal traffic. Real payload travels as a
//! Data Indication carrying a DATA attribute; Binding Requests and Binding
//! Success Responses are exchanged purely as camouflage, absorbed by the
//! masker on both sides and never forwarded to the tunnel.

use super::{Direction, Masker, MaskingError, ReplySink, Unwrapped};
use async_trait::async_trait;
use rand::RngCore;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Magic cookie, network byte order (0x2112A442)
const COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const DATA_INDICATION: u16 = 0x0115;

const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_DATA: u16 = 0x0013;
const ATTR_FINGERPRINT: u16 = 0x8028;

/// FINGERPRINT attribute XOR constant ("STUN")
const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Fixed header: type(2) + length(2) + cookie(4) + transaction id(12)
const HEADER_LEN: usize = 20;

/// Data Indication overhead: header + DATA attribute header
const DATA_OVERHEAD: usize = HEADER_LEN + 4;

/// Hard ceiling on any message this masker will produce or parse
const MAX_MESSAGE: usize = 65535;

/// Scratch size for control messages (binding request/response)
const CONTROL_BUF: usize = 128;

pub struct StunMasker;

impl StunMasker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StunMasker {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u16be(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

fn get_u16be(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Bitwise CRC-32: reflected polynomial 0xEDB88320, seeded all-ones,
/// complemented on output. Must match bit-for-bit for fingerprint
/// verification by a peer to be meaningful.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = !0;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn random_txid() -> [u8; 12] {
    let mut txid = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut txid);
    txid
}

/// Write the 20-byte message header.
fn write_header(buf: &mut [u8], msg_type: u16, msg_len: u16, txid: &[u8; 12]) {
    put_u16be(buf, 0, msg_type);
    put_u16be(buf, 2, msg_len);
    buf[4..8].copy_from_slice(&COOKIE);
    buf[8..20].copy_from_slice(txid);
}

/// Magic cookie present at offsets 4..8?
fn check_magic(buf: &[u8], len: usize) -> bool {
    len >= 8 && buf[4..8] == COOKIE
}

/// Append an XOR-MAPPED-ADDRESS attribute (IPv4) at `off`; returns its total
/// length (12 bytes).
fn put_xor_mapped_address(buf: &mut [u8], off: usize, addr: &SocketAddr) -> usize {
    let (ip, port) = match addr {
        SocketAddr::V4(v4) => (v4.ip().octets(), v4.port()),
        // Callers filter IPv6 out before building a response.
        SocketAddr::V6(_) => unreachable!("XOR-MAPPED-ADDRESS is IPv4-only here"),
    };

    put_u16be(buf, off, ATTR_XOR_MAPPED_ADDRESS);
    put_u16be(buf, off + 2, 8); // family(2) + port(2) + addr(4)
    buf[off + 4] = 0;
    buf[off + 5] = 0x01; // IPv4

    let port_be = port.to_be_bytes();
    buf[off + 6] = port_be[0] ^ COOKIE[0];
    buf[off + 7] = port_be[1] ^ COOKIE[1];
    for i in 0..4 {
        buf[off + 8 + i] = ip[i] ^ COOKIE[i];
    }
    12
}

/// Append a FINGERPRINT attribute at `cur_len`: CRC-32 over all preceding
/// bytes XOR the fixed constant, network byte order. Returns 8.
fn put_fingerprint(buf: &mut [u8], cur_len: usize) -> usize {
    put_u16be(buf, cur_len, ATTR_FINGERPRINT);
    put_u16be(buf, cur_len + 2, 4);
    let fp = crc32(&buf[..cur_len]) ^ FINGERPRINT_XOR;
    buf[cur_len + 4..cur_len + 8].copy_from_slice(&fp.to_be_bytes());
    8
}

/// Build a Binding Request with a random transaction id and a fingerprint.
/// The length field is finalized before the CRC runs, so a receiver can
/// verify the fingerprint over the bytes as they appear on the wire.
fn build_binding_request(buf: &mut [u8]) -> usize {
    let txid = random_txid();
    write_header(buf, BINDING_REQUEST, 8, &txid);
    let mut msg_len = 0;
    msg_len += put_fingerprint(buf, HEADER_LEN + msg_len);
    HEADER_LEN + msg_len
}

/// Build a Binding Success Response reflecting `mapped` for the given
/// transaction id. Returns the total length, or `None` if the buffer cannot
/// hold header + XOR-MAPPED-ADDRESS + fingerprint.
fn build_binding_success(buf: &mut [u8], txid: &[u8; 12], mapped: &SocketAddr) -> Option<usize> {
    if buf.len() < HEADER_LEN + 12 + 8 {
        return None;
    }
    write_header(buf, BINDING_SUCCESS, 20, txid);
    let mut msg_len = 0;
    msg_len += put_xor_mapped_address(buf, HEADER_LEN + msg_len, mapped);
    msg_len += put_fingerprint(buf, HEADER_LEN + msg_len);
    Some(HEADER_LEN + msg_len)
}

/// Wrap `buf[..data_len]` into a Data Indication in place.
fn wrap(buf: &mut [u8], data_len: usize) -> Result<usize, MaskingError> {
    let capacity = buf.len().min(MAX_MESSAGE);
    if data_len + DATA_OVERHEAD > capacity {
        return Err(MaskingError::BufferFull {
            needed: data_len + DATA_OVERHEAD,
            capacity,
        });
    }

    buf.copy_within(..data_len, DATA_OVERHEAD);

    let txid = random_txid();
    write_header(buf, DATA_INDICATION, (4 + data_len) as u16, &txid);
    put_u16be(buf, HEADER_LEN, ATTR_DATA);
    put_u16be(buf, HEADER_LEN + 2, data_len as u16);

    Ok(DATA_OVERHEAD + data_len)
}

/// Unwrap a Data Indication in place, moving the payload to the front.
/// `None` on any framing violation.
fn unwrap(buf: &mut [u8], len: usize) -> Option<usize> {
    if len < DATA_OVERHEAD {
        return None;
    }
    if get_u16be(buf, 0) != DATA_INDICATION {
        return None;
    }
    let msg_len = get_u16be(buf, 2) as usize;
    if msg_len + HEADER_LEN > len {
        return None;
    }
    if get_u16be(buf, HEADER_LEN) != ATTR_DATA {
        return None;
    }
    let data_len = get_u16be(buf, HEADER_LEN + 2) as usize;
    if data_len + DATA_OVERHEAD > len {
        return None;
    }

    buf.copy_within(DATA_OVERHEAD..DATA_OVERHEAD + data_len, 0);
    Some(data_len)
}

#[async_trait]
impl Masker for StunMasker {
    fn timer_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    async fn on_handshake_request(
        &self,
        _direction: Direction,
        _src: SocketAddr,
        dst: SocketAddr,
        _back: &ReplySink,
        forward: &ReplySink,
    ) -> Result<(), MaskingError> {
        // Prime the path with a Binding Request so the first thing an
        // observer sees toward the server is a STUN exchange.
        let mut buf = [0u8; CONTROL_BUF];
        let len = build_binding_request(&mut buf);

        let sent = forward.send(&buf[..len]).await?;
        if sent != len {
            warn!(
                "Partial send of Binding Request to {} ({} of {} bytes)",
                dst, sent, len
            );
        } else {
            debug!("Sent Binding Request ({} bytes) to {}", len, dst);
        }
        Ok(())
    }

    fn on_data_wrap(&self, buf: &mut [u8], len: usize) -> Result<usize, MaskingError> {
        wrap(buf, len)
    }

    async fn on_data_unwrap(
        &self,
        buf: &mut [u8],
        len: usize,
        src: SocketAddr,
        _dst: SocketAddr,
        back: &ReplySink,
        _forward: &ReplySink,
    ) -> Unwrapped {
        if !check_magic(buf, len) {
            return Unwrapped::Malformed;
        }

        match get_u16be(buf, 0) {
            BINDING_REQUEST => {
                debug!("Received Binding Request from {}", src);
                if len < HEADER_LEN {
                    return Unwrapped::Malformed;
                }
                let mut txid = [0u8; 12];
                txid.copy_from_slice(&buf[8..20]);

                if !src.is_ipv4() {
                    debug!("Ignoring Binding Request from non-IPv4 source {}", src);
                    return Unwrapped::Consumed;
                }

                let mut resp = [0u8; CONTROL_BUF];
                match build_binding_success(&mut resp, &txid, &src) {
                    Some(resp_len) => match back.send(&resp[..resp_len]).await {
                        Ok(sent) if sent == resp_len => {
                            debug!(
                                "Sent Binding Success Response ({} bytes) to {}",
                                resp_len, src
                            );
                        }
                        Ok(sent) => warn!(
                            "Partial send of Binding Success Response to {} ({} of {} bytes)",
                            src, sent, resp_len
                        ),
                        Err(e) => warn!("Failed to send Binding Success Response to {}: {}", src, e),
                    },
                    None => warn!("Failed to build Binding Success Response"),
                }
                Unwrapped::Consumed
            }

            BINDING_SUCCESS => {
                debug!("Received Binding Success Response from {}, ignoring", src);
                Unwrapped::Consumed
            }

            DATA_INDICATION => match unwrap(buf, len) {
                Some(data_len) => {
                    debug!("Unwrapped Data Indication from {} ({} bytes)", src, data_len);
                    Unwrapped::Payload(data_len)
                }
                None => {
                    debug!("Failed to unwrap Data Indication from {}", src);
                    Unwrapped::Malformed
                }
            },

            other => {
                debug!("Received unknown STUN type {:#06x} from {}, ignoring", other, src);
                Unwrapped::Consumed
            }
        }
    }

    async fn on_timer(
        &self,
        _client: SocketAddr,
        server: SocketAddr,
        _to_client: &ReplySink,
        to_server: &ReplySink,
    ) -> Result<(), MaskingError> {
        // Keepalive doubling as decoy chatter toward the server.
        let mut buf = [0u8; CONTROL_BUF];
        let len = build_binding_request(&mut buf);
        debug!("Keepalive Binding Request ({} bytes) to {}", len, server);
        to_server.send(&buf[..len]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn crc32_known_vector() {
        // CRC-32 of "123456789" with the reflected polynomial
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        for n in [0usize, 1, 100, 1024] {
            let data = payload(n);
            let mut buf = vec![0u8; n + DATA_OVERHEAD + 64];
            buf[..n].copy_from_slice(&data);

            let wrapped_len = wrap(&mut buf, n).unwrap();
            assert_eq!(wrapped_len, n + DATA_OVERHEAD);
            assert_eq!(get_u16be(&buf, 0), DATA_INDICATION);
            assert!(check_magic(&buf, wrapped_len));

            let unwrapped_len = unwrap(&mut buf, wrapped_len).unwrap();
            assert_eq!(unwrapped_len, n);
            assert_eq!(&buf[..n], &data[..]);
        }
    }

    #[test]
    fn wrap_rejects_full_buffer() {
        let mut buf = vec![0u8; 100];
        let err = wrap(&mut buf, 90).unwrap_err();
        assert!(matches!(err, MaskingError::BufferFull { needed: 114, capacity: 100 }));
    }

    #[test]
    fn unwrap_rejects_bad_framing() {
        // Too short
        let mut buf = vec![0u8; 16];
        assert!(unwrap(&mut buf, 16).is_none());

        // Wrong message type
        let mut buf = vec![0u8; 64];
        let len = wrap(&mut buf, 16).unwrap();
        put_u16be(&mut buf, 0, BINDING_REQUEST);
        assert!(unwrap(&mut buf, len).is_none());

        // DATA attribute length beyond the received length
        let mut buf = vec![0u8; 64];
        let len = wrap(&mut buf, 16).unwrap();
        put_u16be(&mut buf, HEADER_LEN + 2, 60);
        assert!(unwrap(&mut buf, len).is_none());
    }

    #[test]
    fn binding_success_reflects_address() {
        let mapped = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 51820));
        let txid = [9u8; 12];
        let mut buf = [0u8; CONTROL_BUF];
        let len = build_binding_success(&mut buf, &txid, &mapped).unwrap();

        assert_eq!(len, 40);
        assert_eq!(get_u16be(&buf, 0), BINDING_SUCCESS);
        assert_eq!(&buf[8..20], &txid);

        // Decode the XOR-MAPPED-ADDRESS attribute back out.
        assert_eq!(get_u16be(&buf, 20), ATTR_XOR_MAPPED_ADDRESS);
        assert_eq!(buf[25], 0x01);
        let port = u16::from_be_bytes([buf[26] ^ COOKIE[0], buf[27] ^ COOKIE[1]]);
        let ip = Ipv4Addr::new(
            buf[28] ^ COOKIE[0],
            buf[29] ^ COOKIE[1],
            buf[30] ^ COOKIE[2],
            buf[31] ^ COOKIE[3],
        );
        assert_eq!(port, 51820);
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 7));
    }

    #[test]
    fn fingerprint_recomputes() {
        let mut buf = [0u8; CONTROL_BUF];
        let len = build_binding_request(&mut buf);
        assert_eq!(len, 28);

        // Fingerprint attribute occupies the trailing 8 bytes.
        let attr_off = len - 8;
        assert_eq!(get_u16be(&buf, attr_off), ATTR_FINGERPRINT);
        let stored = u32::from_be_bytes([
            buf[attr_off + 4],
            buf[attr_off + 5],
            buf[attr_off + 6],
            buf[attr_off + 7],
        ]);
        assert_eq!(stored, crc32(&buf[..attr_off]) ^ FINGERPRINT_XOR);
    }

    #[tokio::test]
    async fn binding_request_gets_replied() {
        let masker = StunMasker::new();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let relay_sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = relay_sock.local_addr().unwrap();

        let back = ReplySink::new(Arc::clone(&relay_sock), client_addr);
        let forward = ReplySink::new(Arc::clone(&relay_sock), relay_addr);

        let mut buf = vec![0u8; CONTROL_BUF];
        let req_len = build_binding_request(&mut buf);
        let mut txid = [0u8; 12];
        txid.copy_from_slice(&buf[8..20]);

        let outcome = masker
            .on_data_unwrap(&mut buf, req_len, client_addr, relay_addr, &back, &forward)
            .await;
        assert_eq!(outcome, Unwrapped::Consumed);

        let mut resp = [0u8; CONTROL_BUF];
        let (n, from) = client.recv_from(&mut resp).await.unwrap();
        assert_eq!(from, relay_addr);
        assert_eq!(get_u16be(&resp, 0), BINDING_SUCCESS);
        assert_eq!(&resp[8..20], &txid);
        assert!(check_magic(&resp, n));
    }

    #[tokio::test]
    async fn unknown_type_is_absorbed() {
        let masker = StunMasker::new();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let sink = ReplySink::new(Arc::clone(&sock), addr);

        let mut buf = vec![0u8; 64];
        let txid = [1u8; 12];
        write_header(&mut buf, 0x0999, 0, &txid);

        let outcome = masker
            .on_data_unwrap(&mut buf, 20, addr, addr, &sink, &sink)
            .await;
        assert_eq!(outcome, Unwrapped::Consumed);
    }

    #[tokio::test]
    async fn missing_cookie_is_malformed() {
        let masker = StunMasker::new();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let sink = ReplySink::new(Arc::clone(&sock), addr);

        let mut buf = vec![0xABu8; 64];
        let outcome = masker
            .on_data_unwrap(&mut buf, 64, addr, addr, &sink, &sink)
            .await;
        assert_eq!(outcome, Unwrapped::Malformed);
    }
}
