//! RTMP client configuration

use std::time::Duration;

use crate::error::RelayError;
use crate::protocol::constants::{DEFAULT_RTMP_PORT, RECOMMENDED_CHUNK_SIZE};

/// Components of an `rtmp://host[:port]/app[/...]/streamKey` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    /// Everything between the authority and the last path segment
    pub app: String,
    /// Last path segment, `None` when the URL ends at the application
    pub stream_key: Option<String>,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<Self, RelayError> {
        let invalid = || RelayError::InvalidUrl(redact(url));

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        if !scheme.eq_ignore_ascii_case("rtmp") {
            return Err(RelayError::UnsupportedScheme(scheme.to_ascii_lowercase()));
        }

        let (authority, path) = rest.split_once('/').ok_or_else(invalid)?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, DEFAULT_RTMP_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let path = path.trim_end_matches('/');
        let (app, stream_key) = match path.rsplit_once('/') {
            Some((app, key)) => (app, Some(key)),
            None => (path, None),
        };
        if app.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            app: app.to_string(),
            stream_key: stream_key.filter(|k| !k.is_empty()).map(str::to_string),
        })
    }

    /// `tcUrl` sent in `connect`
    pub fn tc_url(&self) -> String {
        if self.port == DEFAULT_RTMP_PORT {
            format!("rtmp://{}/{}", self.host, self.app)
        } else {
            format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Keep stream keys out of error messages and logs
fn redact(url: &str) -> String {
    match url.rsplit_once('/') {
        Some((base, key)) if !key.is_empty() => format!("{}/***", base),
        _ => url.to_string(),
    }
}

/// Outbound connection options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: RtmpUrl,

    /// TCP connect deadline
    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,

    /// How long to wait for `_result`/`onStatus` replies
    pub response_timeout: Duration,

    /// Deadline for flushing one message. A target that stops reading
    /// fails the write instead of stalling the sender.
    pub write_timeout: Duration,

    /// Chunk size announced to the server
    pub chunk_size: u32,

    pub flash_ver: String,

    pub tcp_nodelay: bool,
}

impl ClientConfig {
    pub fn new(url: &str) -> Result<Self, RelayError> {
        Ok(Self {
            url: RtmpUrl::parse(url)?,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            flash_ver: "FMLE/3.0 (compatible; rtmp-fanout)".to_string(),
            tcp_nodelay: true,
        })
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn stream_key(&self) -> Option<&str> {
        self.url.stream_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_platform_urls() {
        let url = RtmpUrl::parse("rtmp://a.rtmp.youtube.com/live2/abcd-1234").unwrap();
        assert_eq!(url.host, "a.rtmp.youtube.com");
        assert_eq!(url.port, 1935);
        assert_eq!(url.app, "live2");
        assert_eq!(url.stream_key.as_deref(), Some("abcd-1234"));
        assert_eq!(url.tc_url(), "rtmp://a.rtmp.youtube.com/live2");

        let url = RtmpUrl::parse("rtmp://live-api-s.facebook.com:80/rtmp/FB-1-0?s_bl=1").unwrap();
        assert_eq!(url.port, 80);
        assert_eq!(url.app, "rtmp");
        assert_eq!(url.stream_key.as_deref(), Some("FB-1-0?s_bl=1"));
        assert_eq!(url.socket_addr(), "live-api-s.facebook.com:80");
        assert_eq!(url.tc_url(), "rtmp://live-api-s.facebook.com:80/rtmp");
    }

    #[test]
    fn test_nested_app_path() {
        let url = RtmpUrl::parse("rtmp://localhost:1936/live/instance/key").unwrap();
        assert_eq!(url.app, "live/instance");
        assert_eq!(url.stream_key.as_deref(), Some("key"));
    }

    #[test]
    fn test_missing_stream_key() {
        let url = RtmpUrl::parse("rtmp://ingest.twitch.tv/live/").unwrap();
        assert_eq!(url.app, "live");
        assert_eq!(url.stream_key, None);
    }

    #[test]
    fn test_rejects_rtmps() {
        assert_eq!(
            RtmpUrl::parse("rtmps://live-upload.instagram.com:443/rtmp/key"),
            Err(RelayError::UnsupportedScheme("rtmps".into()))
        );
    }

    #[test]
    fn test_rejects_malformed() {
        for url in ["localhost/live/key", "rtmp://", "rtmp://host", "rtmp://:1935/live/k", "rtmp://host:port/live/k"] {
            assert!(
                matches!(RtmpUrl::parse(url), Err(RelayError::InvalidUrl(_))),
                "{url}"
            );
        }
    }

    #[test]
    fn test_invalid_url_error_hides_key() {
        let err = RtmpUrl::parse("rtmp://host:bad/live/secret").unwrap_err();
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("rtmp://localhost/live/test").unwrap();
        assert_eq!(config.stream_key(), Some("test"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        let config = config.connect_timeout(Duration::from_secs(2)).chunk_size(0);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.chunk_size, 1);
    }
}
