//! Stream identity

use std::fmt;

use super::error::RegistryError;

/// Identifies a stream: application name plus stream name
///
/// Both parts are non-empty. Any query string on the name (`key?token=..`)
/// is stripped, so `live/abc?x=1` and `live/abc` are the same stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    app: String,
    name: String,
}

impl StreamKey {
    pub fn try_new(app: impl Into<String>, name: impl AsRef<str>) -> Result<Self, RegistryError> {
        let app = app.into();
        let name = strip_query(name.as_ref());
        if app.is_empty() || name.is_empty() {
            return Err(RegistryError::InvalidKey(format!("{}/{}", app, name)));
        }
        Ok(Self {
            app,
            name: name.to_string(),
        })
    }

    /// Parse `app/name`; the name may itself contain slashes
    pub fn parse(path: &str) -> Result<Self, RegistryError> {
        let path = path.trim_start_matches('/');
        match path.split_once('/') {
            Some((app, name)) => Self::try_new(app, name),
            None => Err(RegistryError::InvalidKey(path.to_string())),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

fn strip_query(name: &str) -> &str {
    name.split('?').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_new() {
        let key = StreamKey::try_new("live", "abc?token=1").unwrap();
        assert_eq!(key.app(), "live");
        assert_eq!(key.name(), "abc");
        assert_eq!(key.to_string(), "live/abc");
        assert_eq!(key, StreamKey::try_new("live", "abc").unwrap());
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(matches!(
            StreamKey::try_new("", "abc"),
            Err(RegistryError::InvalidKey(_))
        ));
        assert!(StreamKey::try_new("live", "").is_err());
        assert!(StreamKey::try_new("live", "?token=1").is_err());
    }

    #[test]
    fn test_parse() {
        let key = StreamKey::parse("/live/cam/1").unwrap();
        assert_eq!(key.app(), "live");
        assert_eq!(key.name(), "cam/1");

        assert!(StreamKey::parse("live").is_err());
        assert!(StreamKey::parse("live/").is_err());
    }
}
