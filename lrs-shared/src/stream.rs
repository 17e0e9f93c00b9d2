use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Identity of a published stream: `(vhost, app, stream)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPath {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

pub const DEFAULT_VHOST: &str = "__defaultVhost__";

impl StreamPath {
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
        }
    }

    /// Parses an `app/stream` subpath, optionally with `?param` suffix on
    /// the stream segment, which is discarded.
    pub fn from_subpath(vhost: &str, subpath: &str) -> Result<Self> {
        let subpath = subpath.trim_matches('/');
        let (app, stream) = subpath
            .split_once('/')
            .ok_or_else(|| Error::StreamIdMalformed(subpath.to_string()))?;
        let stream = stream.split('?').next().unwrap_or(stream);
        if app.is_empty() || stream.is_empty() {
            return Err(Error::StreamIdMalformed(subpath.to_string()));
        }
        Ok(Self::new(vhost, app, stream))
    }
}

impl fmt::Display for StreamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_subpath() {
        let p = StreamPath::from_subpath("example.com", "live/feed").unwrap();
        assert_eq!(p.app, "live");
        assert_eq!(p.stream, "feed");

        let p = StreamPath::from_subpath("example.com", "/live/feed?token=x").unwrap();
        assert_eq!(p.stream, "feed");

        assert!(StreamPath::from_subpath("v", "nope").is_err());
        assert!(StreamPath::from_subpath("v", "live/").is_err());
    }
}
