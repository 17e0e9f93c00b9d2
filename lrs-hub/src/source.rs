//! Per-stream source: single publisher, many consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::Notify;

use shared::error::{Error, Result};
use shared::stream::StreamPath;

use crate::media::{MediaPacket, PacketKind};

/// GOP cache bound: whichever of the two caps hits first.
#[derive(Debug, Clone, Copy)]
pub struct GopCachePolicy {
    pub max_frames: usize,
    pub max_span_ms: u32,
}

impl Default for GopCachePolicy {
    fn default() -> Self {
        Self {
            max_frames: 2048,
            max_span_ms: 10_000,
        }
    }
}

/// What a consumer pulls.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Media(MediaPacket),
    /// Synthetic end-of-stream, enqueued when the publisher leaves.
    Eos,
}

/// Per-consumer bounded queue. Overflow drops the oldest packet, counts
/// it, and keeps going; a consumer behind by a full GOP is disconnected
/// by the session layer based on `dropped`.
#[derive(Debug)]
struct ConsumerQueue {
    queue: VecDeque<SourceEvent>,
    capacity: usize,
    dropped: u64,
    notify: Arc<Notify>,
    gone: bool,
}

impl ConsumerQueue {
    fn push(&mut self, event: SourceEvent) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!("hub: consumer queue overflow, dropped {} total", self.dropped);
            }
        }
        self.queue.push_back(event);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct Inner {
    publisher: Option<u64>,
    consumers: HashMap<u64, ConsumerQueue>,
    audio_header: Option<MediaPacket>,
    video_header: Option<MediaPacket>,
    gop: VecDeque<MediaPacket>,
    gop_policy: GopCachePolicy,
    /// Set when the publisher leaves; cleared on reattach.
    grace_deadline: Option<Instant>,
}

/// One published stream and its subscribers.
///
/// The registry holds the only strong handle; publishers and consumers
/// carry ids and look the source up, so teardown cannot dangle.
#[derive(Debug)]
pub struct Source {
    pub path: StreamPath,
    inner: Mutex<Inner>,
    next_consumer_id: AtomicU64,
    keyframe_wanted: AtomicBool,
}

impl Source {
    pub fn new(path: StreamPath, gop_policy: GopCachePolicy) -> Arc<Self> {
        Arc::new(Self {
            path,
            inner: Mutex::new(Inner {
                publisher: None,
                consumers: HashMap::new(),
                audio_header: None,
                video_header: None,
                gop: VecDeque::new(),
                gop_policy,
                grace_deadline: None,
            }),
            next_consumer_id: AtomicU64::new(1),
            keyframe_wanted: AtomicBool::new(false),
        })
    }

    /// Claims the publisher slot.
    pub fn set_publisher(&self, session_id: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.publisher {
            Some(existing) if existing != session_id => {
                Err(Error::StreamBusy(self.path.to_string()))
            }
            _ => {
                inner.publisher = Some(session_id);
                // A reattach within grace keeps consumers waiting happily.
                inner.grace_deadline = None;
                debug!("hub: publisher {session_id} on {}", self.path);
                Ok(())
            }
        }
    }

    pub fn has_publisher(&self) -> bool {
        self.inner.lock().map(|i| i.publisher.is_some()).unwrap_or(false)
    }

    /// One packet from the publisher: refresh caches, fan out.
    pub fn on_publisher_packet(&self, packet: MediaPacket) {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return,
        };

        if packet.sequence_header {
            match packet.kind {
                PacketKind::Audio => inner.audio_header = Some(packet.clone()),
                PacketKind::Video => inner.video_header = Some(packet.clone()),
                PacketKind::Metadata => {}
            }
        } else {
            // GOP cache restarts at each keyframe and never leads with a
            // non-keyframe.
            if packet.kind == PacketKind::Video && packet.keyframe {
                inner.gop.clear();
            }
            let leads_ok = !inner.gop.is_empty()
                || (packet.kind == PacketKind::Video && packet.keyframe);
            if leads_ok {
                inner.gop.push_back(packet.clone());
                let policy = inner.gop_policy;
                while inner.gop.len() > policy.max_frames
                    || gop_span_ms(&inner.gop) > policy.max_span_ms
                {
                    inner.gop.pop_front();
                    // Dropping the leading keyframe invalidates the cache.
                    if inner
                        .gop
                        .front()
                        .map(|p| p.kind != PacketKind::Video || !p.keyframe)
                        .unwrap_or(false)
                    {
                        inner.gop.clear();
                        break;
                    }
                }
            }
        }

        for consumer in inner.consumers.values_mut() {
            if !consumer.gone {
                consumer.push(SourceEvent::Media(packet.clone()));
            }
        }
    }

    /// Publisher disconnect: every consumer sees a clean EOS; the source
    /// itself survives until the grace deadline for reconnects.
    pub fn on_publisher_gone(&self, grace: Duration) {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return,
        };
        inner.publisher = None;
        inner.grace_deadline = Some(Instant::now() + grace);
        for consumer in inner.consumers.values_mut() {
            consumer.push(SourceEvent::Eos);
        }
        debug!("hub: publisher gone on {}", self.path);
    }

    /// Whether the registry may reap this source.
    pub fn expired(&self, now: Instant) -> bool {
        let inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return true,
        };
        match inner.grace_deadline {
            Some(deadline) => inner.publisher.is_none() && now >= deadline,
            None => false,
        }
    }

    /// Attaches a consumer. Sequence headers land first, then the GOP
    /// cache atomically, then live packets.
    pub fn add_consumer(self: &Arc<Self>, capacity: usize) -> Result<Consumer> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        let mut queue = ConsumerQueue {
            queue: VecDeque::new(),
            capacity: capacity.max(16),
            dropped: 0,
            notify: notify.clone(),
            gone: false,
        };

        let mut inner = self.inner.lock()?;
        if let Some(header) = &inner.audio_header {
            queue.push(SourceEvent::Media(header.clone()));
        }
        if let Some(header) = &inner.video_header {
            queue.push(SourceEvent::Media(header.clone()));
        }
        for packet in &inner.gop {
            queue.push(SourceEvent::Media(packet.clone()));
        }
        inner.consumers.insert(id, queue);

        Ok(Consumer {
            id,
            source: Arc::clone(self),
            notify,
        })
    }

    /// The publisher ingest polls this to translate PLIs into keyframe
    /// requests upstream.
    pub fn request_keyframe(&self) {
        self.keyframe_wanted.store(true, Ordering::Release);
    }

    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_wanted.swap(false, Ordering::AcqRel)
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().map(|i| i.consumers.len()).unwrap_or(0)
    }

    fn pop_for(&self, id: u64) -> Option<SourceEvent> {
        let mut inner = self.inner.lock().ok()?;
        inner.consumers.get_mut(&id)?.queue.pop_front()
    }

    fn dropped_for(&self, id: u64) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.consumers.get(&id).map(|c| c.dropped))
            .unwrap_or(0)
    }

    fn remove_consumer(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.consumers.remove(&id);
        }
    }
}

fn gop_span_ms(gop: &VecDeque<MediaPacket>) -> u32 {
    match (gop.front(), gop.back()) {
        (Some(first), Some(last)) => last.dts.wrapping_sub(first.dts),
        _ => 0,
    }
}

/// A subscriber handle. Dropping it unlinks the queue in O(1).
pub struct Consumer {
    id: u64,
    source: Arc<Source>,
    notify: Arc<Notify>,
}

impl Consumer {
    /// Non-blocking pop.
    pub fn try_pull(&self) -> Option<SourceEvent> {
        self.source.pop_for(self.id)
    }

    /// Waits cooperatively until a packet arrives or `max_wait` passes.
    /// `None` means timeout; `Some(Eos)` is the clean end of stream.
    pub async fn pull(&self, max_wait: Duration) -> Option<SourceEvent> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(event) = self.try_pull() {
                return Some(event);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pull();
            }
        }
    }

    /// Packets this consumer lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.source.dropped_for(self.id)
    }

    pub fn stream_path(&self) -> &StreamPath {
        &self.source.path
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.source.remove_consumer(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaCodec;
    use bytes::Bytes;

    fn path() -> StreamPath {
        StreamPath::new("__defaultVhost__", "live", "feed")
    }

    fn audio_sh() -> MediaPacket {
        MediaPacket::audio(MediaCodec::Aac, 0, Bytes::from_static(&[0x12, 0x10]))
            .into_sequence_header()
    }

    fn video_sh() -> MediaPacket {
        MediaPacket::video(MediaCodec::H264, 0, 0, true, Bytes::from_static(&[1]))
            .into_sequence_header()
    }

    fn keyframe(dts: u32) -> MediaPacket {
        MediaPacket::video(MediaCodec::H264, dts, 0, true, Bytes::from_static(&[9]))
    }

    fn pframe(dts: u32) -> MediaPacket {
        MediaPacket::video(MediaCodec::H264, dts, 0, false, Bytes::from_static(&[2]))
    }

    #[test]
    fn test_single_publisher() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        source.set_publisher(1).unwrap(); // same session re-asserts fine
        assert!(matches!(
            source.set_publisher(2),
            Err(Error::StreamBusy(_))
        ));
    }

    #[test]
    fn test_mid_stream_subscriber_gets_headers_then_gop() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        source.on_publisher_packet(audio_sh());
        source.on_publisher_packet(video_sh());
        source.on_publisher_packet(keyframe(0));
        source.on_publisher_packet(pframe(40));

        // Joins after p1; must see sh, sh, keyframe, p1, then p2 live.
        let consumer = source.add_consumer(64).unwrap();
        source.on_publisher_packet(pframe(80));

        let mut got = Vec::new();
        while let Some(SourceEvent::Media(p)) = consumer.try_pull() {
            got.push(p);
        }
        assert_eq!(got.len(), 5);
        assert!(got[0].sequence_header && got[0].kind == PacketKind::Audio);
        assert!(got[1].sequence_header && got[1].kind == PacketKind::Video);
        assert!(got[2].keyframe);
        assert_eq!(got[3].dts, 40);
        assert_eq!(got[4].dts, 80);
    }

    #[test]
    fn test_gop_cache_restarts_on_keyframe() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        source.on_publisher_packet(keyframe(0));
        source.on_publisher_packet(pframe(40));
        source.on_publisher_packet(keyframe(80));
        source.on_publisher_packet(pframe(120));

        let consumer = source.add_consumer(64).unwrap();
        let mut dts = Vec::new();
        while let Some(SourceEvent::Media(p)) = consumer.try_pull() {
            dts.push(p.dts);
        }
        // Only the latest GOP.
        assert_eq!(dts, vec![80, 120]);
    }

    #[test]
    fn test_gop_never_leads_with_pframe() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        source.on_publisher_packet(pframe(40)); // before any keyframe
        let consumer = source.add_consumer(64).unwrap();
        assert_eq!(consumer.try_pull(), None);
    }

    #[test]
    fn test_frame_cap_clears_broken_gop() {
        let source = Source::new(
            path(),
            GopCachePolicy {
                max_frames: 4,
                max_span_ms: 60_000,
            },
        );
        source.set_publisher(1).unwrap();
        source.on_publisher_packet(keyframe(0));
        for i in 1..10u32 {
            source.on_publisher_packet(pframe(i * 40));
        }
        // Cap evicted the keyframe, so the cache must be empty, not a
        // headless run of P-frames.
        let consumer = source.add_consumer(64).unwrap();
        assert_eq!(consumer.try_pull(), None);
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        let consumer = source.add_consumer(16).unwrap();
        source.on_publisher_packet(keyframe(0));
        for i in 1..40u32 {
            source.on_publisher_packet(pframe(i));
        }
        assert!(consumer.dropped() > 0);
        // The newest packet survived.
        let mut last = None;
        while let Some(SourceEvent::Media(p)) = consumer.try_pull() {
            last = Some(p.dts);
        }
        assert_eq!(last, Some(39));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_waits_and_times_out() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        let consumer = source.add_consumer(64).unwrap();
        let got = consumer.pull(Duration::from_millis(50)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        let consumer = source.add_consumer(64).unwrap();

        let src = Arc::clone(&source);
        let handle = tokio::spawn(async move {
            consumer.pull(Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        src.on_publisher_packet(keyframe(0));
        let got = handle.await.unwrap();
        assert!(matches!(got, Some(SourceEvent::Media(_))));
    }

    #[test]
    fn test_publisher_gone_sends_eos_and_grace() {
        let source = Source::new(path(), GopCachePolicy::default());
        source.set_publisher(1).unwrap();
        source.on_publisher_packet(keyframe(0));
        let consumer = source.add_consumer(64).unwrap();

        source.on_publisher_gone(Duration::from_secs(5));
        // Drain: keyframe then EOS.
        assert!(matches!(
            consumer.try_pull(),
            Some(SourceEvent::Media(_))
        ));
        assert_eq!(consumer.try_pull(), Some(SourceEvent::Eos));

        assert!(!source.expired(Instant::now()));
        assert!(source.expired(Instant::now() + Duration::from_secs(6)));

        // Reconnect within grace reuses the source and cancels expiry.
        source.set_publisher(2).unwrap();
        assert!(!source.expired(Instant::now() + Duration::from_secs(6)));
        assert_eq!(source.consumer_count(), 1);
    }

    #[test]
    fn test_consumer_drop_unlinks() {
        let source = Source::new(path(), GopCachePolicy::default());
        let consumer = source.add_consumer(64).unwrap();
        assert_eq!(source.consumer_count(), 1);
        drop(consumer);
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn test_keyframe_request_latch() {
        let source = Source::new(path(), GopCachePolicy::default());
        assert!(!source.take_keyframe_request());
        source.request_keyframe();
        source.request_keyframe();
        assert!(source.take_keyframe_request());
        assert!(!source.take_keyframe_request());
    }
}
