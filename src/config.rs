//! Command line and environment configuration
//!
//! Every option is a flag with an environment variable fallback, so the
//! binary runs unchanged on hosts that only offer environment variables.
//! The parsed [`AppConfig`] is turned once into the library's immutable
//! configuration values.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::registry::RegistryConfig;
use crate::relay::{RelayConfig, RelayTarget};
use crate::server::ServerConfig;

const DEFAULT_HTTP_PORT: u16 = 10000;

#[derive(Debug, Clone, Parser)]
#[command(name = "rtmp-fanout", version, about = "RTMP ingest server that relays to several platforms")]
pub struct AppConfig {
    /// RTMP ingest port
    #[arg(long, env = "RTMP_PORT", default_value_t = 1935)]
    pub rtmp_port: u16,

    /// HTTP port for the dashboard and /api/stats [default: $PORT or 10000]
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Platform-assigned port, used when --http-port is not given
    #[arg(long = "port", env = "PORT", hide = true)]
    pub port: Option<u16>,

    /// Application name publishers connect to
    #[arg(long, env = "RTMP_APP", default_value = "live")]
    pub rtmp_app: String,

    /// Only accept publishes whose stream name equals this key. A shared
    /// secret compare, not authentication.
    #[arg(long, env = "PUBLISH_KEY", hide_env_values = true)]
    pub publish_key: Option<String>,

    /// Outgoing chunk size
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 60000)]
    pub chunk_size: u32,

    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    pub handshake_timeout_secs: u64,

    /// Close publishing sessions silent for this long
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Deadline for each outbound write, to players and to relay targets
    #[arg(long, env = "WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Ping players this often (0 = never)
    #[arg(long, env = "PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Drop players silent for this long
    #[arg(long, env = "PING_TIMEOUT_SECS", default_value_t = 60)]
    pub ping_timeout_secs: u64,

    /// Largest RTMP message accepted from a peer, in bytes
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = 8 * 1024 * 1024)]
    pub max_message_size: usize,

    /// Maximum concurrent RTMP connections (0 = unlimited)
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: usize,

    /// Cache the current GOP so late joiners start on a keyframe
    #[arg(long, env = "GOP_CACHE", default_value_t = true, action = ArgAction::Set)]
    pub gop_cache: bool,

    /// Packets buffered per consumer before it starts losing data
    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = 1024)]
    pub broadcast_capacity: usize,

    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub relay_connect_timeout_secs: u64,

    #[arg(long, env = "RELAY_INITIAL_BACKOFF_MS", default_value_t = 1000)]
    pub relay_initial_backoff_ms: u64,

    #[arg(long, env = "RELAY_MAX_BACKOFF_MS", default_value_t = 30000)]
    pub relay_max_backoff_ms: u64,

    /// Consecutive failures before a relay gives up (0 = never)
    #[arg(long, env = "RELAY_MAX_ATTEMPTS", default_value_t = 10)]
    pub relay_max_attempts: u32,

    #[arg(long, env = "YOUTUBE_STREAM_KEY", hide_env_values = true)]
    pub youtube_stream_key: Option<String>,

    #[arg(long, env = "FACEBOOK_STREAM_KEY", hide_env_values = true)]
    pub facebook_stream_key: Option<String>,

    #[arg(long, env = "TWITCH_STREAM_KEY", hide_env_values = true)]
    pub twitch_stream_key: Option<String>,

    #[arg(long, env = "INSTAGRAM_STREAM_KEY", hide_env_values = true)]
    pub instagram_stream_key: Option<String>,
}

impl AppConfig {
    pub fn rtmp_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.rtmp_port))
    }

    pub fn http_addr(&self) -> SocketAddr {
        let port = self.http_port.or(self.port).unwrap_or(DEFAULT_HTTP_PORT);
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::with_addr(self.rtmp_addr())
            .app(self.rtmp_app.clone())
            .publish_key(self.publish_key.clone())
            .max_connections(self.max_connections)
            .chunk_size(self.chunk_size)
            .handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
            .ping(
                Duration::from_secs(self.ping_interval_secs),
                Duration::from_secs(self.ping_timeout_secs),
            )
            .max_message_size(self.max_message_size)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .gop_cache(self.gop_cache)
            .broadcast_capacity(self.broadcast_capacity)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .connect_timeout(Duration::from_secs(self.relay_connect_timeout_secs))
            .write_timeout(Duration::from_secs(self.write_timeout_secs))
            .backoff(
                Duration::from_millis(self.relay_initial_backoff_ms),
                Duration::from_millis(self.relay_max_backoff_ms),
            )
            .max_attempts(self.relay_max_attempts)
            .chunk_size(self.chunk_size)
    }

    /// Built-in platforms that have a stream key
    pub fn relay_targets(&self) -> Vec<RelayTarget> {
        [
            ("youtube", &self.youtube_stream_key),
            ("facebook", &self.facebook_stream_key),
            ("twitch", &self.twitch_stream_key),
            ("instagram", &self.instagram_stream_key),
        ]
        .into_iter()
        .filter_map(|(platform, key)| {
            let key = key.as_deref()?.trim();
            RelayTarget::known(platform, key)
        })
        .filter(RelayTarget::is_enabled)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppConfig {
        let mut argv = vec!["rtmp-fanout"];
        argv.extend_from_slice(args);
        AppConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_map_onto_library_configs() {
        let config = parse(&[
            "--rtmp-port",
            "1940",
            "--http-port",
            "8080",
            "--rtmp-app",
            "ingest",
            "--publish-key",
            "s3cret",
            "--chunk-size",
            "4096",
            "--idle-timeout-secs",
            "30",
            "--gop-cache",
            "false",
            "--relay-max-attempts",
            "3",
            "--relay-initial-backoff-ms",
            "250",
            "--write-timeout-secs",
            "4",
            "--ping-interval-secs",
            "0",
        ]);

        assert_eq!(config.rtmp_addr().port(), 1940);
        assert_eq!(config.http_addr().port(), 8080);

        let server = config.server_config();
        assert_eq!(server.app, "ingest");
        assert_eq!(server.publish_key.as_deref(), Some("s3cret"));
        assert_eq!(server.chunk_size, 4096);
        assert_eq!(server.idle_timeout, Duration::from_secs(30));
        assert_eq!(server.write_timeout, Duration::from_secs(4));
        assert!(server.ping_interval.is_zero());
        assert_eq!(server.ping_timeout, Duration::from_secs(60));

        assert!(!config.registry_config().gop_cache);

        let relay = config.relay_config();
        assert_eq!(relay.max_attempts, 3);
        assert_eq!(relay.initial_backoff, Duration::from_millis(250));
        assert_eq!(relay.chunk_size, 4096);
        assert_eq!(relay.write_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_http_port_falls_back_to_port() {
        let config = parse(&["--port", "3000"]);
        assert_eq!(config.http_addr().port(), 3000);

        let config = parse(&["--port", "3000", "--http-port", "4000"]);
        assert_eq!(config.http_addr().port(), 4000);
    }

    #[test]
    fn test_targets_from_keys() {
        let config = parse(&[
            "--youtube-stream-key",
            "yt",
            "--twitch-stream-key",
            " ",
            "--instagram-stream-key",
            "ig",
        ]);
        let platforms: Vec<_> = config
            .relay_targets()
            .into_iter()
            .map(|t| t.platform)
            .collect();
        assert_eq!(platforms, ["youtube", "instagram"]);
    }
}
