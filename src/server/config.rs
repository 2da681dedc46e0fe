//! RTMP ingest server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::constants::*;

/// Options for the ingest listener and its sessions
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Application name clients must `connect` to
    pub app: String,

    /// Shared stream name publishers must use. A plain string compare, not
    /// an authentication mechanism: anyone who learns the ingest URL can
    /// publish. `None` accepts any name.
    pub publish_key: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Chunk size we send with
    pub chunk_size: u32,

    pub window_ack_size: u32,

    pub peer_bandwidth: u32,

    /// The whole handshake must finish within this
    pub handshake_timeout: Duration,

    /// Check that C2 echoes S1
    pub verify_handshake_echo: bool,

    /// Close publishing (or not yet streaming) sessions silent for this long
    pub idle_timeout: Duration,

    /// Deadline for flushing one outbound message
    pub write_timeout: Duration,

    /// How often players are pinged (zero disables pings)
    pub ping_interval: Duration,

    /// Drop a player that sent nothing, not even a ping response, for this long
    pub ping_timeout: Duration,

    /// Largest message a peer may send
    pub max_message_size: usize,

    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RTMP_PORT)),
            app: "live".to_string(),
            publish_key: None,
            max_connections: 0,
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            handshake_timeout: Duration::from_secs(5),
            verify_handshake_echo: true,
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    pub fn publish_key(mut self, key: Option<String>) -> Self {
        self.publish_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Clamped to 1..=0xFFFFFF
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn verify_handshake_echo(mut self, verify: bool) -> Self {
        self.verify_handshake_echo = verify;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}
