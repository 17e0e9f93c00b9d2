use std::sync::Arc;
use std::time::Duration;

/// Configuration surface the core consumes.
///
/// Config loading (files, reload, CLI) lives outside the core; sessions
/// receive an injected `Arc<dyn MediaConfig>` at construction and never
/// reach for process-wide state.
pub trait MediaConfig: Send + Sync {
    fn listen_rtmp_port(&self) -> u16 {
        1935
    }
    fn rtc_listen_port(&self) -> u16 {
        8000
    }
    fn srt_listen_port(&self) -> u16 {
        10080
    }
    /// RTMP out-chunk size applied after connect.
    fn chunk_size(&self) -> usize {
        60000
    }
    fn nack_enabled(&self, _vhost: &str) -> bool {
        true
    }
    /// Retransmit straight out of the send buffer without copying payloads.
    fn nack_no_copy(&self, _vhost: &str) -> bool {
        true
    }
    fn twcc_enabled(&self, _vhost: &str) -> bool {
        true
    }
    /// STUN inactivity timeout for an RTC session.
    fn rtc_stun_timeout(&self, _vhost: &str) -> Duration {
        Duration::from_secs(30)
    }
    fn rtc_to_rtmp(&self, _vhost: &str) -> bool {
        false
    }
    fn srt_mix_correct(&self) -> bool {
        false
    }
    fn srt_sei_filter(&self) -> bool {
        true
    }
    /// Payload type whose RTP packets are dropped on ingest (0 = none).
    fn drop_for_pt(&self, _vhost: &str) -> u8 {
        0
    }
    fn realtime(&self, _vhost: &str) -> bool {
        false
    }
    /// Max messages a consumer sends per write burst.
    fn mw_msgs(&self, _vhost: &str, realtime: bool) -> usize {
        if realtime {
            0
        } else {
            8
        }
    }
    /// GOP cache packet cap per source.
    fn gop_cache_max_frames(&self, _vhost: &str) -> usize {
        2048
    }
    /// Grace period a source survives after its publisher is gone.
    fn source_grace(&self, _vhost: &str) -> Duration {
        Duration::from_secs(10)
    }
}

/// Built-in defaults; also what tests construct.
#[derive(Default)]
pub struct DefaultMediaConfig;

impl MediaConfig for DefaultMediaConfig {}

pub type SharedConfig = Arc<dyn MediaConfig>;

/// Process load state fed by an external watcher. While critical, NACK and
/// TWCC are disabled; PLI stays on so streams remain decodable.
pub trait CircuitBreaker: Send + Sync {
    fn hybrid_critical(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct NeverCritical;

impl CircuitBreaker for NeverCritical {}
