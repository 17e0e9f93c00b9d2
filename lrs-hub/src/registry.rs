//! Process-wide stream registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::info;

use shared::error::{Error, Result};
use shared::stream::StreamPath;

use crate::source::{GopCachePolicy, Source};

/// `(vhost, app, stream)` → source map; the registry holds the only
/// strong handles.
pub struct Hub {
    sources: Mutex<HashMap<StreamPath, Arc<Source>>>,
    gop_policy: GopCachePolicy,
    max_streams: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(GopCachePolicy::default(), 4096)
    }
}

impl Hub {
    pub fn new(gop_policy: GopCachePolicy, max_streams: usize) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            gop_policy,
            max_streams,
        }
    }

    /// Fetches or creates the source for a stream.
    pub fn fetch_or_create(&self, path: &StreamPath) -> Result<Arc<Source>> {
        let mut sources = self.sources.lock()?;
        if let Some(source) = sources.get(path) {
            return Ok(Arc::clone(source));
        }
        if sources.len() >= self.max_streams {
            return Err(Error::TooManyStreams);
        }
        info!("hub: creating source {path}");
        let source = Source::new(path.clone(), self.gop_policy);
        sources.insert(path.clone(), Arc::clone(&source));
        Ok(source)
    }

    pub fn fetch(&self, path: &StreamPath) -> Option<Arc<Source>> {
        self.sources.lock().ok()?.get(path).map(Arc::clone)
    }

    /// Reaps sources whose grace expired; run from the 1 s tick.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sources = match self.sources.lock() {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let before = sources.len();
        sources.retain(|path, source| {
            let keep = !source.expired(now);
            if !keep {
                info!("hub: reaping source {path}");
            }
            keep
        });
        before - sources.len()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn path(stream: &str) -> StreamPath {
        StreamPath::new("__defaultVhost__", "live", stream)
    }

    #[test]
    fn test_fetch_or_create_reuses() {
        let hub = Hub::default();
        let a = hub.fetch_or_create(&path("a")).unwrap();
        let b = hub.fetch_or_create(&path("a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_stream_cap() {
        let hub = Hub::new(GopCachePolicy::default(), 2);
        hub.fetch_or_create(&path("a")).unwrap();
        hub.fetch_or_create(&path("b")).unwrap();
        assert_eq!(
            hub.fetch_or_create(&path("c")).unwrap_err(),
            Error::TooManyStreams
        );
    }

    #[test]
    fn test_sweep_reaps_only_expired() {
        let hub = Hub::default();
        let a = hub.fetch_or_create(&path("a")).unwrap();
        let _b = hub.fetch_or_create(&path("b")).unwrap();
        a.set_publisher(1).unwrap();
        a.on_publisher_gone(Duration::from_secs(1));

        assert_eq!(hub.sweep(Instant::now()), 0);
        assert_eq!(hub.sweep(Instant::now() + Duration::from_secs(2)), 1);
        assert_eq!(hub.len(), 1);
        assert!(hub.fetch(&path("a")).is_none());
        assert!(hub.fetch(&path("b")).is_some());
    }
}
