//! SRT streamid parsing.
//!
//! Two syntaxes arrive in the wild: the legacy bare path
//! `app/stream[?params]`, and the live form
//! `#!::h=<vhost-or-host/app/stream>,r=<app/stream>,m=<publish|request>,…`.

use std::collections::HashMap;

use shared::error::{Error, Result};
use shared::stream::{StreamPath, DEFAULT_VHOST};

pub const DEFAULT_APP: &str = "live";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtMode {
    Publish,
    Request,
}

/// Where an SRT connection routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtRoute {
    pub mode: SrtMode,
    pub path: StreamPath,
}

impl SrtRoute {
    pub fn parse(streamid: &str) -> Result<Self> {
        if let Some(rest) = streamid.strip_prefix("#!::") {
            Self::parse_live(rest, streamid)
        } else {
            Self::parse_legacy(streamid)
        }
    }

    fn parse_legacy(streamid: &str) -> Result<Self> {
        let subpath = if streamid.contains('/') {
            streamid.to_string()
        } else {
            format!("{DEFAULT_APP}/{streamid}")
        };
        let path = StreamPath::from_subpath(DEFAULT_VHOST, &subpath)?;
        validate(&path)?;
        Ok(SrtRoute {
            mode: SrtMode::Request,
            path,
        })
    }

    fn parse_live(rest: &str, original: &str) -> Result<Self> {
        // Query-style auth parameters may ride in with '?'; treat them as
        // more comma-separated pairs.
        let rest = rest.replace('?', ",");
        let mut kv: HashMap<&str, &str> = HashMap::new();
        for pair in rest.split(',') {
            if let Some((k, v)) = pair.split_once('=') {
                kv.insert(k.trim(), v.trim());
            }
        }

        let mode = match kv.get("m").copied() {
            Some("publish") => SrtMode::Publish,
            Some("request") | None => SrtMode::Request,
            Some(other) => return Err(Error::StreamIdMode(other.to_string())),
        };

        let mut vhost = DEFAULT_VHOST.to_string();
        let mut subpath = String::new();

        if let Some(host) = kv.get("h") {
            let slashes = host.matches('/').count();
            match slashes {
                0 => {
                    // New style: h names the vhost, r names the path.
                    vhost = host.to_string();
                    subpath = kv
                        .get("r")
                        .map(|r| r.to_string())
                        .ok_or_else(|| Error::StreamIdMalformed(original.to_string()))?;
                }
                1 => {
                    // h=app/stream on the default vhost.
                    subpath = host.to_string();
                }
                _ => {
                    // h=vhost/app/stream.
                    let (v, rest) = host
                        .split_once('/')
                        .ok_or_else(|| Error::StreamIdMalformed(original.to_string()))?;
                    vhost = v.to_string();
                    subpath = rest.to_string();
                }
            }
        } else if let Some(r) = kv.get("r") {
            subpath = r.to_string();
        }

        if subpath.is_empty() {
            return Err(Error::StreamIdMalformed(original.to_string()));
        }
        let path = StreamPath::from_subpath(&vhost, &subpath)?;
        validate(&path)?;
        Ok(SrtRoute { mode, path })
    }
}

fn validate(path: &StreamPath) -> Result<()> {
    for part in [&path.app, &path.stream] {
        if part.is_empty() || part.contains(' ') {
            return Err(Error::StreamIdMalformed(path.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_form_with_vhost() {
        let route = SrtRoute::parse("#!::h=example.com,r=live/feed,m=publish").unwrap();
        assert_eq!(route.mode, SrtMode::Publish);
        assert_eq!(route.path.vhost, "example.com");
        assert_eq!(route.path.app, "live");
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_live_form_h_carries_path() {
        let route = SrtRoute::parse("#!::h=live/feed,m=request").unwrap();
        assert_eq!(route.mode, SrtMode::Request);
        assert_eq!(route.path.vhost, DEFAULT_VHOST);
        assert_eq!(route.path.app, "live");
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_live_form_vhost_in_h_path() {
        let route = SrtRoute::parse("#!::h=srs.srt.com.cn/live/feed,m=publish").unwrap();
        assert_eq!(route.path.vhost, "srs.srt.com.cn");
        assert_eq!(route.path.app, "live");
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_query_params_tolerated() {
        let route = SrtRoute::parse("#!::h=live/feed?secret=xyz,m=publish").unwrap();
        assert_eq!(route.mode, SrtMode::Publish);
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_legacy_with_app() {
        let route = SrtRoute::parse("live/feed?token=1").unwrap();
        assert_eq!(route.mode, SrtMode::Request);
        assert_eq!(route.path.app, "live");
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_legacy_bare_stream() {
        let route = SrtRoute::parse("feed").unwrap();
        assert_eq!(route.path.app, DEFAULT_APP);
        assert_eq!(route.path.stream, "feed");
    }

    #[test]
    fn test_bad_mode() {
        assert_eq!(
            SrtRoute::parse("#!::h=live/feed,m=push"),
            Err(Error::StreamIdMode("push".into()))
        );
    }

    #[test]
    fn test_missing_path() {
        assert!(SrtRoute::parse("#!::m=publish").is_err());
        assert!(SrtRoute::parse("#!::h=example.com,m=publish").is_err());
    }
}
