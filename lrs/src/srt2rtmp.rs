//! The srt2rtmp bridge task.
//!
//! SRT ingest runs on its own workers (the SRT library side is an
//! external collaborator); received TS payloads cross into the RTMP world
//! over one MPMC queue with a single consumer coroutine, which demuxes,
//! repackages and republishes to the local RTMP port.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use tokio::sync::mpsc;

use mpegts::TsDemuxer;
use shared::config::SharedConfig;
use shared::error::Result;
use srt::{MixCorrectQueue, SrtMode, SrtRoute, Ts2FlvBridge};

use crate::interrupt::Interrupt;
use crate::rtmp_client::ConnectedPublisher;

/// Streams idle past this are torn down.
const STREAM_IDLE: Duration = Duration::from_secs(30);

/// One message from an SRT worker.
pub struct SrtData {
    pub streamid: String,
    pub payload: Bytes,
}

#[derive(Clone)]
pub struct Srt2RtmpHandle {
    tx: mpsc::Sender<SrtData>,
}

impl Srt2RtmpHandle {
    /// Called from SRT receive paths; sheds load by dropping when the
    /// bridge is saturated.
    pub fn submit(&self, streamid: String, payload: Bytes) {
        let len = payload.len();
        if self.tx.try_send(SrtData { streamid, payload }).is_err() {
            warn!("srt2rtmp: queue full, dropping {len} bytes");
        }
    }
}

struct StreamState {
    demuxer: TsDemuxer,
    bridge: Ts2FlvBridge,
    mix: MixCorrectQueue,
    publisher: Option<ConnectedPublisher>,
    last_data_ms: i64,
}

/// Spawns the consumer task; returns the producer handle.
pub fn start(
    config: SharedConfig,
    rtmp_port: u16,
    interrupt: Interrupt,
) -> Srt2RtmpHandle {
    let (tx, mut rx) = mpsc::channel::<SrtData>(1024);
    let handle = Srt2RtmpHandle { tx };

    tokio::spawn(async move {
        let mut streams: HashMap<String, StreamState> = HashMap::new();
        let epoch = std::time::Instant::now();
        let now_ms = |epoch: std::time::Instant| epoch.elapsed().as_millis() as i64;

        loop {
            let data = tokio::select! {
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => return,
                },
                _ = interrupt.stopped() => return,
                _ = tokio::time::sleep(STREAM_IDLE) => {
                    let now = now_ms(epoch);
                    streams.retain(|id, s| {
                        let live = now - s.last_data_ms < STREAM_IDLE.as_millis() as i64;
                        if !live {
                            info!("srt2rtmp: reaping idle stream {id}");
                        }
                        live
                    });
                    continue;
                }
            };

            let now = now_ms(epoch);
            if let Err(e) =
                on_data(&config, rtmp_port, &mut streams, data, now).await
            {
                warn!("srt2rtmp: {e}");
            }
        }
    });

    handle
}

async fn on_data(
    config: &SharedConfig,
    rtmp_port: u16,
    streams: &mut HashMap<String, StreamState>,
    data: SrtData,
    now_ms: i64,
) -> Result<()> {
    let route = SrtRoute::parse(&data.streamid)?;
    if route.mode != SrtMode::Publish {
        return Ok(());
    }

    if !streams.contains_key(&data.streamid) {
        let publisher = ConnectedPublisher::connect(rtmp_port, route.path.clone()).await?;
        info!("srt2rtmp: bridging {} -> rtmp", route.path);
        streams.insert(
            data.streamid.clone(),
            StreamState {
                demuxer: TsDemuxer::new(),
                bridge: Ts2FlvBridge::new(config.srt_sei_filter()),
                mix: MixCorrectQueue::new(config.srt_mix_correct()),
                publisher: Some(publisher),
                last_data_ms: now_ms,
            },
        );
    }
    let state = streams.get_mut(&data.streamid).expect("inserted above");
    state.last_data_ms = now_ms;

    let events = state.demuxer.push(&data.payload)?;
    for event in &events {
        for tag in state.bridge.on_ts_event(event)? {
            state.mix.insert(tag, now_ms);
        }
    }

    if let Some(publisher) = state.publisher.as_mut() {
        publisher.pump().await?;
        while let Some(tag) = state.mix.pop(now_ms) {
            publisher.send_tag(&tag).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_mode_not_bridged() {
        // parse-level check: only m=publish streams cross the bridge.
        let route = SrtRoute::parse("#!::h=live/feed,m=request").unwrap();
        assert_eq!(route.mode, SrtMode::Request);
    }
}
