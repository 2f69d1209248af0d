//! The concurrent relay engine
//!
//! Owns the loopback-facing listen socket and the upstream socket, and runs
//! the forwarding loops that tie socket I/O, obfuscation, masking, and
//! session tracking together:
//!
//! - client-forward: listen socket → codec encode → masking wrap → upstream
//! - server-return: upstream → masking unwrap → codec decode → listen socket
//! - status: periodic status-line publication
//! - keepalive: the active masker's timer hook, when it declares one
//!
//! All loops run as branches of a single `select!`, so one stop signal
//! cancels everything and closes both sockets; malformed or foreign packets
//! are logged and dropped without disturbing the loops.

mod session;

pub use session::{format_bytes, HandshakePhase, Session};

use crate::codec::{Obfuscator, PacketType};
use crate::config::RelayConfig;
use crate::masking::{self, Direction, Masker, ReplySink, Unwrapped};
use crate::RECV_BUFFER_SIZE;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Period of the status-publication loop
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind listen socket on 127.0.0.1:{port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Cannot resolve remote endpoint {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },

    #[error("Invalid obfuscation key: {0}")]
    Key(#[from] crate::codec::CodecError),

    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Observable relay state, published through a watch channel for the host
/// shell (CLI, service wrapper) to display.
#[derive(Debug, Clone, Default)]
pub struct RelayStatus {
    pub running: bool,
    pub status: String,
    pub error: Option<String>,
}

/// The relay engine. Created with [`Relay::bind`], driven by [`Relay::run`].
pub struct Relay {
    listen_socket: Arc<UdpSocket>,
    upstream_socket: Arc<UdpSocket>,
    remote: SocketAddr,
    obfuscator: Obfuscator,
    masker: Option<Arc<dyn Masker>>,
    session: Arc<Mutex<Session>>,
    status_tx: watch::Sender<RelayStatus>,
}

impl Relay {
    /// Validate the configuration, bind both sockets, resolve the remote
    /// endpoint, and set up codec and masker. Any failure here is fatal for
    /// startup and lands in the status channel's error string.
    pub async fn bind(
        config: &RelayConfig,
        status_tx: watch::Sender<RelayStatus>,
    ) -> Result<Self, RelayError> {
        let obfuscator = Obfuscator::new(config.key.clone())?;

        let listen_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, config.listen_port))
            .await
            .map_err(|source| RelayError::Bind {
                port: config.listen_port,
                source,
            })?;

        let upstream_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

        let endpoint = format!("{}:{}", config.remote_host, config.remote_port);
        let remote = lookup_host(&endpoint)
            .await
            .map_err(|e| RelayError::Resolve {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| RelayError::Resolve {
                endpoint: endpoint.clone(),
                reason: "no addresses".to_string(),
            })?;

        let masker = masking::create(&config.masking);
        if let Some(kind) = masking::find(&config.masking) {
            info!("Masking: {}", kind.label);
        }

        info!(
            "Relay bound on {}, forwarding to {}",
            listen_socket.local_addr()?,
            remote
        );

        Ok(Self {
            listen_socket: Arc::new(listen_socket),
            upstream_socket: Arc::new(upstream_socket),
            remote,
            obfuscator,
            masker,
            session: Arc::new(Mutex::new(Session::new())),
            status_tx,
        })
    }

    /// Local address of the listen socket (useful when bound to port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listen_socket.local_addr()
    }

    /// The resolved remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Run the relay until the shutdown signal fires or a socket error stops
    /// the session. Shutdown while blocked in a receive is clean, not an
    /// error; a genuine socket failure is retained as the error string.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        self.status_tx.send_modify(|s| {
            s.running = true;
            s.status = "Started".to_string();
            s.error = None;
        });

        let result = tokio::select! {
            r = self.client_forward_loop() => r,
            r = self.server_return_loop() => r,
            r = self.status_loop() => r,
            r = self.keepalive_loop() => r,
            _ = wait_for_shutdown(shutdown) => {
                info!("Stop requested, shutting down");
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                info!("Relay stopped");
                self.status_tx.send_modify(|s| {
                    s.running = false;
                    s.status = "Stopped".to_string();
                });
            }
            Err(e) => {
                error!("Relay failed: {}", e);
                let message = e.to_string();
                self.status_tx.send_modify(|s| {
                    s.running = false;
                    s.status = "Stopped".to_string();
                    s.error = Some(message);
                });
            }
        }
        result
    }

    /// client → listen socket → encode → wrap → upstream → remote
    async fn client_forward_loop(&self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, src) = self.listen_socket.recv_from(&mut buf).await?;
            trace!("Received {} bytes from client {}", len, src);

            if len < 4 {
                debug!("Dropping short packet from {} ({} bytes)", src, len);
                continue;
            }
            let Some(packet_type) = PacketType::from_wire(&buf[..len]) else {
                debug!("Dropping packet with unknown type from {}", src);
                continue;
            };

            let mut out_len = self.obfuscator.encode(&mut buf, len);

            if packet_type.is_handshake() {
                if let Some(masker) = &self.masker {
                    let back = ReplySink::new(Arc::clone(&self.listen_socket), src);
                    let forward = ReplySink::new(Arc::clone(&self.upstream_socket), self.remote);
                    if let Err(e) = masker
                        .on_handshake_request(
                            Direction::ClientToServer,
                            src,
                            self.remote,
                            &back,
                            &forward,
                        )
                        .await
                    {
                        warn!("Masker handshake hook failed: {}", e);
                    }
                }
            }

            let client_changed = self.session.lock().track_client(src);
            if client_changed {
                info!("Tracking client {}", src);
                self.publish_session_status();
            }

            if let Some(masker) = &self.masker {
                match masker.on_data_wrap(&mut buf, out_len) {
                    Ok(wrapped_len) => out_len = wrapped_len,
                    Err(e) => {
                        warn!("Dropping packet, masking failed: {}", e);
                        continue;
                    }
                }
            }

            self.upstream_socket
                .send_to(&buf[..out_len], self.remote)
                .await?;
            trace!("Sent {} bytes to server {}", out_len, self.remote);
            self.session.lock().add_tx(out_len);

            if packet_type == PacketType::HandshakeInit
                && self.session.lock().mark_handshake_sent()
            {
                info!("Handshake initiation forwarded to {}", self.remote);
                self.publish_session_status();
            }
        }
    }

    /// remote → upstream → unwrap → decode → listen socket → client
    async fn server_return_loop(&self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, src) = self.upstream_socket.recv_from(&mut buf).await?;
            trace!("Received {} bytes from server {}", len, src);

            if src != self.remote {
                debug!("Dropping packet from unexpected sender {}", src);
                continue;
            }
            let Some(client) = self.session.lock().client() else {
                debug!("Dropping server packet, no client known yet");
                continue;
            };
            self.session.lock().add_rx(len);

            let mut payload_len = len;
            if let Some(masker) = &self.masker {
                let back = ReplySink::new(Arc::clone(&self.upstream_socket), self.remote);
                let forward = ReplySink::new(Arc::clone(&self.listen_socket), client);
                match masker
                    .on_data_unwrap(&mut buf, len, src, client, &back, &forward)
                    .await
                {
                    Unwrapped::Payload(n) => payload_len = n,
                    Unwrapped::Consumed => continue,
                    Unwrapped::Malformed => {
                        debug!("Dropping malformed masked packet from {}", src);
                        continue;
                    }
                }
            }

            if payload_len < 4 {
                debug!("Dropping short unwrapped packet ({} bytes)", payload_len);
                continue;
            }
            let decoded_len = match self.obfuscator.decode(&mut buf, payload_len) {
                Ok(n) if n >= 4 => n,
                Ok(n) => {
                    debug!("Dropping corrupt packet, decoded to {} bytes", n);
                    continue;
                }
                Err(e) => {
                    debug!("Dropping undecodable packet: {}", e);
                    continue;
                }
            };
            let Some(packet_type) = PacketType::from_wire(&buf[..decoded_len]) else {
                debug!("Dropping decoded packet with unknown type");
                continue;
            };

            if packet_type == PacketType::HandshakeResponse
                && self.session.lock().mark_handshake_acked()
            {
                info!("Handshake acknowledged by {}", self.remote);
                self.publish_session_status();
            }

            self.listen_socket
                .send_to(&buf[..decoded_len], client)
                .await?;
            trace!("Sent {} bytes to client {}", decoded_len, client);
        }
    }

    /// Republish the human-readable status line on a fixed period.
    async fn status_loop(&self) -> Result<(), RelayError> {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.publish_session_status();
        }
    }

    /// Drive the masker's timer hook, when it declares an interval. Hook
    /// failures are logged and swallowed; the keepalive task keeps running.
    async fn keepalive_loop(&self) -> Result<(), RelayError> {
        let Some(masker) = self.masker.as_ref() else {
            return std::future::pending().await;
        };
        let Some(period) = masker.timer_interval() else {
            return std::future::pending().await;
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick; keepalives only make sense after
        // some traffic has established a client.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(client) = self.session.lock().client() else {
                continue;
            };
            let to_client = ReplySink::new(Arc::clone(&self.listen_socket), client);
            let to_server = ReplySink::new(Arc::clone(&self.upstream_socket), self.remote);
            if let Err(e) = masker
                .on_timer(client, self.remote, &to_client, &to_server)
                .await
            {
                warn!("Masker timer hook failed: {}", e);
            }
        }
    }

    fn publish_session_status(&self) {
        let line = self.session.lock().status_line();
        self.status_tx.send_modify(|s| {
            s.running = true;
            s.status = line;
        });
    }
}

/// Resolve when the shutdown flag flips (or its sender is dropped).
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
