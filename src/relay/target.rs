//! Relay destinations

use crate::client::ClientConfig;
use crate::error::RelayError;

use super::config::RelayConfig;

/// Built-in platforms: name, ingest base URL, environment variable holding
/// the stream key
pub const PLATFORMS: &[(&str, &str, &str)] = &[
    ("youtube", "rtmp://a.rtmp.youtube.com/live2/", "YOUTUBE_STREAM_KEY"),
    ("facebook", "rtmp://live-api-s.facebook.com:80/rtmp/", "FACEBOOK_STREAM_KEY"),
    ("twitch", "rtmp://ingest.twitch.tv/live/", "TWITCH_STREAM_KEY"),
    ("instagram", "rtmps://live-upload.instagram.com:443/rtmp/", "INSTAGRAM_STREAM_KEY"),
];

/// One platform the ingest stream is pushed to
#[derive(Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub platform: String,
    /// Ingest URL up to and including the application, ending in `/`
    pub base_url: String,
    stream_key: String,
}

impl RelayTarget {
    pub fn new(
        platform: impl Into<String>,
        base_url: impl Into<String>,
        stream_key: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            platform: platform.into(),
            base_url,
            stream_key: stream_key.into(),
        }
    }

    /// Target for one of the built-in [`PLATFORMS`]
    pub fn known(platform: &str, stream_key: impl Into<String>) -> Option<Self> {
        PLATFORMS
            .iter()
            .find(|(name, _, _)| *name == platform)
            .map(|(name, base, _)| Self::new(*name, *base, stream_key))
    }

    /// A target without a stream key is never started
    pub fn is_enabled(&self) -> bool {
        !self.stream_key.trim().is_empty()
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.stream_key)
    }

    pub fn client_config(&self, relay: &RelayConfig) -> Result<ClientConfig, RelayError> {
        Ok(ClientConfig::new(&self.url())?
            .connect_timeout(relay.connect_timeout)
            .response_timeout(relay.response_timeout)
            .write_timeout(relay.write_timeout)
            .chunk_size(relay.chunk_size))
    }
}

// Stream keys are credentials
impl std::fmt::Debug for RelayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTarget")
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_platforms() {
        let youtube = RelayTarget::known("youtube", "yt-key").unwrap();
        assert_eq!(youtube.url(), "rtmp://a.rtmp.youtube.com/live2/yt-key");
        assert!(youtube.is_enabled());

        assert!(RelayTarget::known("myspace", "key").is_none());
        assert!(!RelayTarget::known("twitch", "  ").unwrap().is_enabled());
    }

    #[test]
    fn test_client_config_from_target() {
        let target = RelayTarget::new("local", "rtmp://127.0.0.1:1940/live", "mirror");
        assert_eq!(target.url(), "rtmp://127.0.0.1:1940/live/mirror");

        let relay = RelayConfig::default().write_timeout(std::time::Duration::from_millis(250));
        let config = target.client_config(&relay).unwrap();
        assert_eq!(config.write_timeout, std::time::Duration::from_millis(250));
        assert_eq!(config.url.port, 1940);
        assert_eq!(config.url.app, "live");
        assert_eq!(config.stream_key(), Some("mirror"));
        assert_eq!(config.chunk_size, 60_000);
    }

    #[test]
    fn test_instagram_is_unsupported() {
        let target = RelayTarget::known("instagram", "ig-key").unwrap();
        assert!(target.is_enabled());
        assert_eq!(
            target.client_config(&RelayConfig::default()).unwrap_err(),
            RelayError::UnsupportedScheme("rtmps".into())
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let target = RelayTarget::known("youtube", "super-secret").unwrap();
        assert!(!format!("{:?}", target).contains("super-secret"));
    }
}
