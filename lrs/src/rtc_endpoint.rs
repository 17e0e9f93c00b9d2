//! WebRTC endpoint: the shared UDP socket, per-session actor tasks, and
//! the out-of-band signaling entry points.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use hub::{Hub, MediaCodec, MediaPacket, SourceEvent};
use rtc::connection::{RtcConnection, RtcEvent};
use rtc::dtls::DtlsTransport;
use sdp::{negotiate, LocalPolicy, MediaTrackDesc, SessionDescription};
use shared::config::{CircuitBreaker, SharedConfig};
use shared::error::Result;
use shared::hooks::{HookEvent, SharedHooks};
use shared::stream::StreamPath;
use shared::time::Clock;

use crate::bridge::{Flv2RtpBridge, Rtp2FlvBridge};
use crate::interrupt::Interrupt;
use crate::ticker::Tickers;

struct Inbound {
    now_us: i64,
    from: SocketAddr,
    data: BytesMut,
}

struct SessionHandle {
    tx: mpsc::Sender<Inbound>,
    interrupt: Interrupt,
}

/// Shared state of the RTC endpoint.
pub struct RtcEndpoint {
    socket: Arc<UdpSocket>,
    hub: Arc<Hub>,
    config: SharedConfig,
    hooks: SharedHooks,
    clock: Arc<dyn Clock>,
    breaker: Arc<dyn CircuitBreaker>,
    tickers: Arc<Tickers>,
    /// local ufrag → session; populated at signaling time.
    by_ufrag: Mutex<HashMap<String, SessionHandle>>,
    /// Peer addresses learned from STUN → owning ufrag.
    by_addr: Mutex<HashMap<SocketAddr, String>>,
    next_context_id: std::sync::atomic::AtomicU64,
}

impl RtcEndpoint {
    pub async fn bind(
        port: u16,
        hub: Arc<Hub>,
        config: SharedConfig,
        hooks: SharedHooks,
        clock: Arc<dyn Clock>,
        breaker: Arc<dyn CircuitBreaker>,
        tickers: Arc<Tickers>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("rtc: listening on udp {port}");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            hub,
            config,
            hooks,
            clock,
            breaker,
            tickers,
            by_ufrag: Mutex::new(HashMap::new()),
            by_addr: Mutex::new(HashMap::new()),
            next_context_id: std::sync::atomic::AtomicU64::new(1),
        }))
    }

    /// The socket read loop; spawn once per endpoint.
    pub async fn run(self: Arc<Self>, interrupt: Interrupt) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = tokio::select! {
                r = self.socket.recv_from(&mut buf) => r?,
                _ = interrupt.stopped() => return Ok(()),
            };
            let data = BytesMut::from(&buf[..n]);
            let now_us = self.clock.now_us();

            let known = self.by_addr.lock()?.get(&from).cloned();
            let ufrag = match known {
                Some(u) => Some(u),
                // A new source address must introduce itself with the STUN
                // binding that names the session (ICE-lite).
                None => match local_ufrag_of_stun(&data) {
                    Some(u) => {
                        self.by_addr.lock()?.insert(from, u.clone());
                        Some(u)
                    }
                    None => None,
                },
            };

            let Some(ufrag) = ufrag else {
                debug!("rtc: datagram from unknown {from}");
                continue;
            };
            let tx = self.by_ufrag.lock()?.get(&ufrag).map(|s| s.tx.clone());
            match tx {
                Some(tx) => {
                    if tx.try_send(Inbound { now_us, from, data }).is_err() {
                        warn!("rtc: session {ufrag} inbox full, dropping datagram");
                    }
                }
                None => {
                    self.by_addr.lock()?.remove(&from);
                }
            }
        }
    }

    /// WHIP-style publish: negotiates the offer, registers the session,
    /// returns the answer SDP.
    pub fn publish(
        self: &Arc<Self>,
        path: StreamPath,
        offer_sdp: &str,
        dtls: Box<dyn DtlsTransport>,
        client_ip: &str,
    ) -> Result<String> {
        let offer = SessionDescription::parse(offer_sdp)?;
        let policy = self.policy_for(&path.vhost);
        let (answer, tracks) = negotiate(&offer, &policy)?;

        let source = self.hub.fetch_or_create(&path)?;
        let context_id = self
            .next_context_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        source.set_publisher(context_id)?;

        let mut conn = RtcConnection::new(
            policy.ice_ufrag.clone(),
            policy.ice_pwd.clone(),
            dtls,
            self.config.rtc_stun_timeout(&path.vhost).as_micros() as i64,
        );
        let url = path.to_string();
        conn.add_publisher(&url, tracks.clone(), self.config.drop_for_pt(&path.vhost))?;

        self.hooks
            .dispatch(HookEvent::OnPublish, context_id, &path, client_ip);
        self.spawn_session(
            policy.ice_ufrag.clone(),
            conn,
            SessionRole::Publisher {
                path,
                context_id,
                tracks,
            },
        );
        Ok(answer.marshal())
    }

    /// WHEP-style play.
    pub fn play(
        self: &Arc<Self>,
        path: StreamPath,
        offer_sdp: &str,
        dtls: Box<dyn DtlsTransport>,
        client_ip: &str,
    ) -> Result<String> {
        let offer = SessionDescription::parse(offer_sdp)?;
        let policy = self.policy_for(&path.vhost);
        let (answer, tracks) = negotiate(&offer, &policy)?;

        let context_id = self
            .next_context_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut conn = RtcConnection::new(
            policy.ice_ufrag.clone(),
            policy.ice_pwd.clone(),
            dtls,
            self.config.rtc_stun_timeout(&path.vhost).as_micros() as i64,
        );
        let url = path.to_string();
        let nack_no_copy = self.config.nack_no_copy(&path.vhost);
        conn.add_player(&url, tracks.clone(), nack_no_copy)?;

        self.hooks
            .dispatch(HookEvent::OnPlay, context_id, &path, client_ip);
        self.spawn_session(
            policy.ice_ufrag.clone(),
            conn,
            SessionRole::Player {
                path,
                context_id,
                tracks,
            },
        );
        Ok(answer.marshal())
    }

    fn policy_for(&self, vhost: &str) -> LocalPolicy {
        LocalPolicy {
            nack_enabled: self.config.nack_enabled(vhost),
            twcc_enabled: self.config.twcc_enabled(vhost),
            ..Default::default()
        }
    }

    fn spawn_session(self: &Arc<Self>, ufrag: String, conn: RtcConnection, role: SessionRole) {
        let (tx, rx) = mpsc::channel(256);
        let interrupt = Interrupt::new();
        if let Ok(mut by_ufrag) = self.by_ufrag.lock() {
            by_ufrag.insert(
                ufrag.clone(),
                SessionHandle {
                    tx,
                    interrupt: interrupt.clone(),
                },
            );
        }
        let endpoint = Arc::clone(self);
        tokio::spawn(session_task(endpoint, ufrag, conn, role, rx, interrupt));
    }

    /// Stops every session; used at shutdown.
    pub fn stop_all(&self) {
        if let Ok(by_ufrag) = self.by_ufrag.lock() {
            for handle in by_ufrag.values() {
                handle.interrupt.stop();
            }
        }
    }

    fn unlink(&self, ufrag: &str) {
        if let Ok(mut by_ufrag) = self.by_ufrag.lock() {
            by_ufrag.remove(ufrag);
        }
        if let Ok(mut by_addr) = self.by_addr.lock() {
            by_addr.retain(|_, u| u != ufrag);
        }
    }
}

enum SessionRole {
    Publisher {
        path: StreamPath,
        context_id: u64,
        tracks: Vec<MediaTrackDesc>,
    },
    Player {
        path: StreamPath,
        context_id: u64,
        tracks: Vec<MediaTrackDesc>,
    },
}

impl SessionRole {
    fn path(&self) -> &StreamPath {
        match self {
            SessionRole::Publisher { path, .. } | SessionRole::Player { path, .. } => path,
        }
    }
}

/// Extracts the local half of USERNAME from a STUN binding request.
fn local_ufrag_of_stun(data: &[u8]) -> Option<String> {
    if !shared::util::match_stun(data) {
        return None;
    }
    let msg = stun::Message::decode(data).ok()?;
    let username = msg.username()?;
    username.split(':').next().map(str::to_string)
}

/// One cooperative task per connection; every callback of the session is
/// serialized here. Suspension points: the inbox, the tick subscriptions,
/// the consumer pull and the socket sends.
async fn session_task(
    endpoint: Arc<RtcEndpoint>,
    ufrag: String,
    mut conn: RtcConnection,
    role: SessionRole,
    mut rx: mpsc::Receiver<Inbound>,
    interrupt: Interrupt,
) {
    let mut tick_20ms = endpoint.tickers.tick_20ms.subscribe();
    let mut tick_100ms = endpoint.tickers.tick_100ms.subscribe();
    let mut tick_1s = endpoint.tickers.tick_1s.subscribe();

    let path = role.path().clone();
    let url = path.to_string();
    let is_publisher = matches!(role, SessionRole::Publisher { .. });

    // Audio payload types from negotiation, for ingest codec routing.
    let audio_pts: HashSet<u8> = match &role {
        SessionRole::Publisher { tracks, .. } | SessionRole::Player { tracks, .. } => tracks
            .iter()
            .filter(|t| !t.is_video)
            .map(|t| t.payload_type)
            .collect(),
    };

    let mut ingress = Rtp2FlvBridge::new();
    let mut egress: Option<Flv2RtpBridge> = None;
    let mut consumer: Option<hub::Consumer> = None;
    let mut source = endpoint.hub.fetch(&path);

    let result: Result<()> = async {
        loop {
            let events: Vec<RtcEvent> = tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else { break Ok(()) };
                    match conn.handle_datagram(inbound.now_us, inbound.from, inbound.data) {
                        Ok(events) => events,
                        Err(e) if e.is_fatal() => break Err(e),
                        Err(e) => {
                            debug!("rtc: dropped datagram: {e}");
                            continue;
                        }
                    }
                }
                t = tick_20ms.recv() => {
                    let Ok(now_us) = t else { continue };
                    conn.set_load_critical(endpoint.breaker.hybrid_critical());
                    let mut events = conn.on_tick_20ms(now_us)?;
                    // Queued keyframe wants become PLI toward the peer.
                    if is_publisher {
                        if let Some(src) = &source {
                            if src.take_keyframe_request() {
                                events.extend(conn.request_publisher_keyframe(&url)?);
                            }
                        }
                    }
                    events
                }
                t = tick_100ms.recv() => {
                    if t.is_err() { continue }
                    conn.on_tick_100ms()?
                }
                t = tick_1s.recv() => {
                    let Ok(now_us) = t else { continue };
                    conn.on_tick_1s(now_us)?
                }
                event = pull_media(&consumer), if consumer.is_some() => {
                    match event {
                        Some(SourceEvent::Media(packet)) => {
                            let mut out = Vec::new();
                            if let Some(bridge) = egress.as_mut() {
                                for rtp_packet in bridge.on_media(&packet)? {
                                    out.extend(conn.send_media(&url, &rtp_packet)?);
                                }
                            }
                            out
                        }
                        Some(SourceEvent::Eos) => break Ok(()),
                        None => continue,
                    }
                }
                _ = interrupt.stopped() => break Ok(()),
            };

            let mut closed = false;
            for event in events {
                match event {
                    RtcEvent::SendDatagram(bytes) => {
                        if let Some(addr) = conn.active_addr() {
                            let _ = endpoint.socket.send_to(&bytes, addr).await;
                        }
                    }
                    RtcEvent::Established => {
                        info!("rtc: {url} established");
                        // Deferred player starts: attach to the source and
                        // begin forwarding only now.
                        if let SessionRole::Player { tracks, .. } = &role {
                            if consumer.is_none() {
                                let src = endpoint.hub.fetch_or_create(&path)?;
                                let cap = endpoint.config.gop_cache_max_frames(&path.vhost);
                                consumer = Some(src.add_consumer(cap)?);
                                source = Some(src);
                                let video = tracks.iter().find(|t| t.is_video);
                                let audio = tracks.iter().find(|t| !t.is_video);
                                egress = Some(Flv2RtpBridge::new(
                                    video.map(|t| t.local_ssrc).unwrap_or_else(rand::random),
                                    video.map(|t| t.payload_type).unwrap_or(96),
                                    audio.map(|t| t.local_ssrc).unwrap_or_else(rand::random),
                                    audio.map(|t| t.payload_type).unwrap_or(111),
                                ));
                            }
                        }
                    }
                    RtcEvent::PublisherRtp { packet, .. } => {
                        if let Some(src) = &source {
                            for media in media_from_rtp(&mut ingress, &audio_pts, &packet) {
                                src.on_publisher_packet(media);
                            }
                        }
                    }
                    RtcEvent::KeyframeRequest { .. } => {
                        if let Some(src) = &source {
                            src.request_keyframe();
                        }
                    }
                    RtcEvent::Closed => closed = true,
                }
            }
            if closed {
                break Ok(());
            }

            // The PLI worker: insertion signaled above, drained here with
            // set-coalescing intact.
            if conn.pli_pending() {
                for event in conn.drain_pli()? {
                    match event {
                        RtcEvent::SendDatagram(bytes) => {
                            if let Some(addr) = conn.active_addr() {
                                let _ = endpoint.socket.send_to(&bytes, addr).await;
                            }
                        }
                        RtcEvent::KeyframeRequest { .. } => {
                            if let Some(src) = &source {
                                src.request_keyframe();
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        warn!("rtc: session {url} ended with error: {e}");
    }
    conn.close();
    endpoint.unlink(&ufrag);

    match role {
        SessionRole::Publisher {
            path, context_id, ..
        } => {
            if let Some(src) = endpoint.hub.fetch(&path) {
                src.on_publisher_gone(endpoint.config.source_grace(&path.vhost));
            }
            endpoint
                .hooks
                .dispatch(HookEvent::OnUnpublish, context_id, &path, "");
        }
        SessionRole::Player {
            path, context_id, ..
        } => {
            endpoint
                .hooks
                .dispatch(HookEvent::OnStop, context_id, &path, "");
        }
    }
    info!("rtc: session {url} finished");
}

async fn pull_media(consumer: &Option<hub::Consumer>) -> Option<SourceEvent> {
    match consumer {
        Some(c) => c.pull(Duration::from_secs(1)).await,
        None => std::future::pending().await,
    }
}

/// Depacketizes publisher RTP into hub packets: H.264 through the FU-A
/// assembler, Opus wrapped raw on its 48 kHz clock.
fn media_from_rtp(
    ingress: &mut Rtp2FlvBridge,
    audio_pts: &HashSet<u8>,
    packet: &rtp::Packet,
) -> Vec<MediaPacket> {
    if audio_pts.contains(&packet.header.payload_type) {
        return vec![MediaPacket::audio(
            MediaCodec::Opus,
            packet.header.timestamp / 48,
            packet.payload.clone(),
        )];
    }
    ingress.on_rtp(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtc::dtls::NullDtls;
    use shared::config::{DefaultMediaConfig, NeverCritical};
    use shared::hooks::Blackhole;
    use shared::time::MonotonicClock;

    const OFFER: &str = "v=0\r\n\
s=-\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 97\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtpmap:97 H264/90000\r\n\
a=fmtp:97 packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtcp-fb:97 nack\r\n\
a=rtcp-fb:97 nack pli\r\n\
a=ssrc:4242 cname:x\r\n";

    async fn endpoint() -> Arc<RtcEndpoint> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        RtcEndpoint::bind(
            0, // ephemeral
            Arc::new(hub::Hub::default()),
            Arc::new(DefaultMediaConfig),
            Arc::new(Blackhole::default()),
            clock.clone(),
            Arc::new(NeverCritical),
            Arc::new(Tickers::start(clock)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_signaling_registers_session() {
        let endpoint = endpoint().await;
        let path = StreamPath::new("__defaultVhost__", "live", "rtcfeed");
        let answer = endpoint
            .publish(path.clone(), OFFER, Box::new(NullDtls::default()), "1.2.3.4")
            .unwrap();
        assert!(answer.contains("a=ice-lite"));
        assert!(answer.contains("a=rtcp-fb:97 nack pli"));
        assert_eq!(endpoint.by_ufrag.lock().unwrap().len(), 1);
        // The hub source exists with the publisher slot taken.
        let source = endpoint.hub.fetch(&path).unwrap();
        assert!(source.has_publisher());

        // A second publish on the same stream is refused.
        let again = endpoint.publish(path, OFFER, Box::new(NullDtls::default()), "1.2.3.4");
        assert!(matches!(again, Err(shared::error::Error::StreamBusy(_))));
    }

    #[tokio::test]
    async fn test_play_signaling_answers_recvonly_offer() {
        let endpoint = endpoint().await;
        let path = StreamPath::new("__defaultVhost__", "live", "rtcfeed");
        let offer = OFFER.replace("a=sendonly", "a=recvonly");
        let answer = endpoint
            .play(path, &offer, Box::new(NullDtls::default()), "1.2.3.4")
            .unwrap();
        assert!(answer.contains("a=sendonly"));
        assert_eq!(endpoint.by_ufrag.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_local_ufrag_extraction() {
        let mut msg = stun::Message::binding_request();
        msg.add(
            stun::message::attr::USERNAME,
            bytes::Bytes::from_static(b"localfrag:remotefrag"),
        );
        let wire = msg.encode_plain();
        assert_eq!(local_ufrag_of_stun(&wire).as_deref(), Some("localfrag"));
        assert_eq!(local_ufrag_of_stun(&[0x80, 0, 0, 0]), None);
    }

    #[test]
    fn test_media_from_rtp_routes_audio_by_pt() {
        let mut ingress = Rtp2FlvBridge::new();
        let mut audio_pts = HashSet::new();
        audio_pts.insert(111u8);
        let pkt = rtp::Packet {
            header: rtp::Header {
                payload_type: 111,
                timestamp: 9600,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[1, 2, 3]),
        };
        let media = media_from_rtp(&mut ingress, &audio_pts, &pkt);
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].codec, MediaCodec::Opus);
        assert_eq!(media[0].dts, 200);
    }
}
