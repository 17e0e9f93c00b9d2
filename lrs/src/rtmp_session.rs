//! Server-side RTMP session.
//!
//! The protocol core is driven by bytes in / events out so it tests
//! without sockets; `run` wires it to a TCP stream, the hub and the hook
//! dispatcher.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hub::{Hub, MediaCodec, MediaPacket, PacketKind, SourceEvent};
use rtmp::chunk::{ChunkDecoder, ChunkEncoder};
use rtmp::command::{self, Command, PublishType};
use rtmp::flv;
use rtmp::handshake::ServerSimpleHandshake;
use rtmp::message::{cid, msg_type, ProtocolControl, RtmpMessage, UserControlEvent};
use shared::config::SharedConfig;
use shared::error::{Error, Result};
use shared::hooks::{HookEvent, SharedHooks};
use shared::stream::{StreamPath, DEFAULT_VHOST};

use crate::interrupt::Interrupt;

const DEFAULT_WINDOW_ACK: u32 = 2_500_000;
const MEDIA_STREAM_ID: u32 = 1;

/// What the session core wants its driver to do.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    Send(Bytes),
    StartPublish(StreamPath),
    StartPlay(StreamPath),
    Media(MediaPacket),
    CloseStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Handshake,
    CommandLoop,
}

pub struct RtmpServerSession {
    handshake: ServerSimpleHandshake,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    stage: Stage,
    app: String,
    vhost: String,
    out_chunk_size: usize,
}

impl RtmpServerSession {
    pub fn new(out_chunk_size: usize) -> Self {
        Self {
            handshake: ServerSimpleHandshake::new(),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            stage: Stage::Handshake,
            app: String::new(),
            vhost: DEFAULT_VHOST.to_string(),
            out_chunk_size,
        }
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Feeds raw TCP bytes, producing protocol events.
    pub fn handle_bytes(&mut self, data: &[u8]) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();

        if self.stage == Stage::Handshake {
            self.handshake.handle_read(data)?;
            if let Some(reply) = self.handshake.poll_write() {
                events.push(SessionEvent::Send(reply));
            }
            if !self.handshake.is_done() {
                return Ok(events);
            }
            self.stage = Stage::CommandLoop;
            let remaining = self.handshake.take_remaining();
            self.decoder.handle_read(&remaining)?;
        } else {
            self.decoder.handle_read(data)?;
        }

        while let Some(msg) = self.decoder.poll_message() {
            self.on_message(msg, &mut events)?;
        }

        if let Some(sequence) = self.decoder.poll_ack() {
            self.send_message(
                cid::PROTOCOL_CONTROL,
                ProtocolControl::Acknowledgement(sequence).to_message(),
                &mut events,
            );
        }

        Ok(events)
    }

    /// Encodes one outgoing media packet as an RTMP message.
    pub fn encode_media(&self, packet: &MediaPacket) -> Bytes {
        let (message_type, out_cid) = match packet.kind {
            PacketKind::Audio => (msg_type::AUDIO, cid::AUDIO),
            PacketKind::Video => (msg_type::VIDEO, cid::VIDEO),
            PacketKind::Metadata => (msg_type::AMF0_DATA, cid::OVER_STREAM),
        };
        let msg = RtmpMessage::new(
            message_type,
            packet.dts,
            MEDIA_STREAM_ID,
            packet.payload.clone(),
        );
        self.encoder.write_message(out_cid, &msg)
    }

    /// Batches several packets into one write.
    pub fn encode_media_batch(&self, packets: &[MediaPacket]) -> Bytes {
        let batch: Vec<(u32, RtmpMessage)> = packets
            .iter()
            .map(|p| {
                let (message_type, out_cid) = match p.kind {
                    PacketKind::Audio => (msg_type::AUDIO, cid::AUDIO),
                    PacketKind::Video => (msg_type::VIDEO, cid::VIDEO),
                    PacketKind::Metadata => (msg_type::AMF0_DATA, cid::OVER_STREAM),
                };
                (
                    out_cid,
                    RtmpMessage::new(message_type, p.dts, MEDIA_STREAM_ID, p.payload.clone()),
                )
            })
            .collect();
        self.encoder.write_messages(&batch)
    }

    pub fn stream_eof(&self) -> Bytes {
        let msg = ProtocolControl::UserControl(UserControlEvent::StreamEof(MEDIA_STREAM_ID))
            .to_message();
        self.encoder.write_message(cid::PROTOCOL_CONTROL, &msg)
    }

    /// StreamBegin + Publish.Start, sent once the source slot is claimed.
    pub fn publish_accept(&self) -> Vec<Bytes> {
        vec![
            self.encoder.write_message(
                cid::PROTOCOL_CONTROL,
                &ProtocolControl::UserControl(UserControlEvent::StreamBegin(MEDIA_STREAM_ID))
                    .to_message(),
            ),
            self.encoder.write_message(
                cid::OVER_STREAM,
                &command::on_status(
                    "status",
                    "NetStream.Publish.Start",
                    "Started publishing stream.",
                )
                .to_message(MEDIA_STREAM_ID),
            ),
        ]
    }

    /// Publish refusal (the stream is busy).
    pub fn publish_reject(&self) -> Bytes {
        self.encoder.write_message(
            cid::OVER_STREAM,
            &command::on_status(
                "error",
                "NetStream.Publish.BadName",
                "Stream already publishing.",
            )
            .to_message(MEDIA_STREAM_ID),
        )
    }

    /// StreamBegin + Play.Reset + Play.Start.
    pub fn play_accept(&self) -> Vec<Bytes> {
        vec![
            self.encoder.write_message(
                cid::PROTOCOL_CONTROL,
                &ProtocolControl::UserControl(UserControlEvent::StreamBegin(MEDIA_STREAM_ID))
                    .to_message(),
            ),
            self.encoder.write_message(
                cid::OVER_STREAM,
                &command::on_status("status", "NetStream.Play.Reset", "Playing and resetting.")
                    .to_message(MEDIA_STREAM_ID),
            ),
            self.encoder.write_message(
                cid::OVER_STREAM,
                &command::on_status("status", "NetStream.Play.Start", "Started playing.")
                    .to_message(MEDIA_STREAM_ID),
            ),
        ]
    }

    fn on_message(&mut self, msg: RtmpMessage, events: &mut Vec<SessionEvent>) -> Result<()> {
        if let Some(pc) = ProtocolControl::parse(&msg)? {
            return self.on_protocol_control(pc, events);
        }
        match msg.header.message_type {
            msg_type::AMF0_COMMAND => self.on_command(&msg, events),
            msg_type::AUDIO | msg_type::VIDEO => {
                if let Some(packet) = media_packet_from_message(&msg) {
                    events.push(SessionEvent::Media(packet));
                }
                Ok(())
            }
            msg_type::AMF0_DATA => {
                events.push(SessionEvent::Media(MediaPacket {
                    kind: PacketKind::Metadata,
                    codec: MediaCodec::H264, // carrier only; not inspected
                    dts: msg.header.timestamp,
                    cts: 0,
                    keyframe: false,
                    sequence_header: false,
                    payload: msg.payload,
                }));
                Ok(())
            }
            msg_type::AMF3_COMMAND | msg_type::AMF3_DATA | msg_type::AGGREGATE => {
                debug!("rtmp: ignoring message type {}", msg.header.message_type);
                Ok(())
            }
            other => Err(Error::UnexpectedMessageType(other)),
        }
    }

    fn on_protocol_control(
        &mut self,
        pc: ProtocolControl,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        match pc {
            ProtocolControl::SetChunkSize(size) => self.decoder.set_chunk_size(size)?,
            ProtocolControl::WindowAckSize(window) => self.decoder.ack.window = window,
            ProtocolControl::Acknowledgement(_) | ProtocolControl::SetPeerBandwidth { .. } => {}
            ProtocolControl::Abort(_) => {}
            ProtocolControl::UserControl(UserControlEvent::PingRequest(ts)) => {
                self.send_message(
                    cid::PROTOCOL_CONTROL,
                    ProtocolControl::UserControl(UserControlEvent::PingResponse(ts)).to_message(),
                    events,
                );
            }
            ProtocolControl::UserControl(_) => {}
        }
        Ok(())
    }

    fn on_command(&mut self, msg: &RtmpMessage, events: &mut Vec<SessionEvent>) -> Result<()> {
        let cmd = Command::parse(&msg.payload)?;
        match cmd {
            Command::Connect {
                transaction_id,
                app,
                tc_url,
                ..
            } => {
                self.app = app;
                if let Some(url) = tc_url {
                    if let Some(vhost) = vhost_from_tc_url(&url) {
                        self.vhost = vhost;
                    }
                }
                info!("rtmp: connect app={} vhost={}", self.app, self.vhost);

                self.send_message(
                    cid::PROTOCOL_CONTROL,
                    ProtocolControl::WindowAckSize(DEFAULT_WINDOW_ACK).to_message(),
                    events,
                );
                self.send_message(
                    cid::PROTOCOL_CONTROL,
                    ProtocolControl::SetPeerBandwidth {
                        window: DEFAULT_WINDOW_ACK,
                        limit_type: 2,
                    }
                    .to_message(),
                    events,
                );
                self.send_message(
                    cid::PROTOCOL_CONTROL,
                    ProtocolControl::SetChunkSize(self.out_chunk_size as u32).to_message(),
                    events,
                );
                self.encoder.set_chunk_size(self.out_chunk_size as u32)?;
                self.send_message(
                    cid::OVER_CONNECTION,
                    command::connect_result(transaction_id).to_message(0),
                    events,
                );
            }
            Command::CreateStream { transaction_id } => {
                self.send_message(
                    cid::OVER_CONNECTION,
                    command::create_stream_result(transaction_id, MEDIA_STREAM_ID as f64)
                        .to_message(0),
                    events,
                );
            }
            Command::ReleaseStream { transaction_id, .. }
            | Command::FcPublish { transaction_id, .. } => {
                self.send_message(
                    cid::OVER_CONNECTION,
                    Command::Response {
                        transaction_id,
                        success: true,
                        values: vec![codec::amf0::Amf0Value::Null, codec::amf0::Amf0Value::Undefined],
                    }
                    .to_message(0),
                    events,
                );
            }
            Command::FcUnpublish { .. } => {}
            Command::Publish {
                stream_name,
                publish_type,
                ..
            } => {
                if publish_type != PublishType::Live {
                    debug!("rtmp: treating {publish_type:?} as live");
                }
                // Accept or reject only after the driver claimed the
                // source; see publish_accept / publish_reject.
                events.push(SessionEvent::StartPublish(self.stream_path(&stream_name)?));
            }
            Command::Play { stream_name, .. } => {
                events.push(SessionEvent::StartPlay(self.stream_path(&stream_name)?));
            }
            Command::Pause { .. } => {
                // Live relays do not rewind; pause only mutes delivery and
                // the driver handles it as a no-op.
            }
            Command::CloseStream { .. } | Command::DeleteStream { .. } => {
                events.push(SessionEvent::CloseStream);
            }
            Command::Response { .. } | Command::OnStatus { .. } => {
                // Server role: unexpected but harmless.
            }
        }
        Ok(())
    }

    fn stream_path(&self, stream_name: &str) -> Result<StreamPath> {
        let stream = stream_name.split('?').next().unwrap_or(stream_name);
        if self.app.is_empty() || stream.is_empty() {
            return Err(Error::StreamIdMalformed(format!(
                "{}/{}",
                self.app, stream_name
            )));
        }
        Ok(StreamPath::new(self.vhost.clone(), self.app.clone(), stream))
    }

    fn send_message(&self, out_cid: u32, msg: RtmpMessage, events: &mut Vec<SessionEvent>) {
        events.push(SessionEvent::Send(self.encoder.write_message(out_cid, &msg)));
    }
}

fn vhost_from_tc_url(tc_url: &str) -> Option<String> {
    // rtmp://host[:port]/app[?vhost=...]
    if let Some((_, query)) = tc_url.split_once('?') {
        for pair in query.split('&') {
            if let Some(v) = pair.strip_prefix("vhost=") {
                return Some(v.to_string());
            }
        }
    }
    let rest = tc_url.strip_prefix("rtmp://")?;
    let host = rest.split(['/', ':']).next()?;
    if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() || host == "localhost" {
        return None;
    }
    Some(host.to_string())
}

/// Classifies an RTMP media message into the hub packet shape.
fn media_packet_from_message(msg: &RtmpMessage) -> Option<MediaPacket> {
    if msg.payload.is_empty() {
        return None;
    }
    match msg.header.message_type {
        msg_type::VIDEO => {
            let codec = match msg.payload[0] & 0x0F {
                flv::CODEC_AVC => MediaCodec::H264,
                flv::CODEC_HEVC => MediaCodec::H265,
                other => {
                    debug!("rtmp: unsupported video codec id {other}");
                    return None;
                }
            };
            let tag = flv::VideoTagBody::parse(&msg.payload).ok()?;
            Some(MediaPacket {
                kind: PacketKind::Video,
                codec,
                dts: msg.header.timestamp,
                cts: tag.cts,
                keyframe: tag.keyframe && tag.packet_type == flv::AVC_NALU,
                sequence_header: tag.packet_type == flv::AVC_SEQUENCE_HEADER,
                payload: msg.payload.clone(),
            })
        }
        msg_type::AUDIO => {
            let sound_format = msg.payload[0] >> 4;
            let codec = match sound_format {
                flv::SOUND_AAC => MediaCodec::Aac,
                flv::SOUND_MP3 => MediaCodec::Mp3,
                other => {
                    debug!("rtmp: unsupported audio format {other}");
                    return None;
                }
            };
            Some(MediaPacket {
                kind: PacketKind::Audio,
                codec,
                dts: msg.header.timestamp,
                cts: 0,
                keyframe: false,
                sequence_header: flv::is_audio_sequence_header(&msg.payload),
                payload: msg.payload.clone(),
            })
        }
        _ => None,
    }
}

/// Runs one accepted RTMP connection to completion.
pub async fn run(
    mut stream: TcpStream,
    hub: Arc<Hub>,
    config: SharedConfig,
    hooks: SharedHooks,
    interrupt: Interrupt,
    context_id: u64,
) -> Result<()> {
    let peer_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut session = RtmpServerSession::new(config.chunk_size());
    let mut buf = BytesMut::with_capacity(64 * 1024);

    // Phase 1: handshake and command exchange until a role is known.
    // Media pipelined behind publish in the same read is kept, not lost.
    let mut pending: Vec<MediaPacket> = Vec::new();
    let role = loop {
        buf.clear();
        let n = tokio::select! {
            r = stream.read_buf(&mut buf) => r?,
            _ = interrupt.stopped() => return Ok(()),
        };
        if n == 0 {
            return Err(Error::TransportClosed);
        }
        let events = session.handle_bytes(&buf[..n])?;
        let mut role = None;
        for event in events {
            match event {
                SessionEvent::Send(bytes) => stream.write_all(&bytes).await?,
                SessionEvent::StartPublish(path) => role = Some((true, path)),
                SessionEvent::StartPlay(path) => role = Some((false, path)),
                SessionEvent::Media(packet) if role.is_some() => pending.push(packet),
                SessionEvent::Media(_) | SessionEvent::CloseStream => {}
            }
        }
        if let Some(role) = role {
            break role;
        }
    };

    match role {
        (true, path) => {
            run_publisher(
                stream, session, buf, pending, hub, config, hooks, interrupt, context_id, path,
                peer_ip,
            )
            .await
        }
        (false, path) => {
            run_player(
                stream, session, hub, config, hooks, interrupt, context_id, path, peer_ip,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_publisher(
    mut stream: TcpStream,
    mut session: RtmpServerSession,
    mut buf: BytesMut,
    pending: Vec<MediaPacket>,
    hub: Arc<Hub>,
    config: SharedConfig,
    hooks: SharedHooks,
    interrupt: Interrupt,
    context_id: u64,
    path: StreamPath,
    peer_ip: String,
) -> Result<()> {
    let source = hub.fetch_or_create(&path)?;
    if let Err(e) = source.set_publisher(context_id) {
        stream.write_all(&session.publish_reject()).await?;
        return Err(e);
    }
    for bytes in session.publish_accept() {
        stream.write_all(&bytes).await?;
    }
    hooks.dispatch(HookEvent::OnPublish, context_id, &path, &peer_ip);
    info!("rtmp: publish start {path} from {peer_ip}");
    for packet in pending {
        source.on_publisher_packet(packet);
    }

    let grace = config.source_grace(&path.vhost);
    let result: Result<()> = async {
        loop {
            buf.clear();
            let n = tokio::select! {
                r = stream.read_buf(&mut buf) => r?,
                _ = interrupt.stopped() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            for event in session.handle_bytes(&buf[..n])? {
                match event {
                    SessionEvent::Send(bytes) => stream.write_all(&bytes).await?,
                    SessionEvent::Media(packet) => source.on_publisher_packet(packet),
                    SessionEvent::CloseStream => return Ok(()),
                    SessionEvent::StartPublish(_) | SessionEvent::StartPlay(_) => {
                        return Err(Error::StreamBusy(path.to_string()));
                    }
                }
            }
        }
    }
    .await;

    source.on_publisher_gone(grace);
    hooks.dispatch(HookEvent::OnUnpublish, context_id, &path, &peer_ip);
    info!("rtmp: publish stop {path}");
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_player(
    mut stream: TcpStream,
    mut session: RtmpServerSession,
    hub: Arc<Hub>,
    config: SharedConfig,
    hooks: SharedHooks,
    interrupt: Interrupt,
    context_id: u64,
    path: StreamPath,
    peer_ip: String,
) -> Result<()> {
    let source = hub.fetch_or_create(&path)?;
    let realtime = config.realtime(&path.vhost);
    let mw_msgs = config.mw_msgs(&path.vhost, realtime).max(1);
    let consumer = source.add_consumer(config.gop_cache_max_frames(&path.vhost))?;
    for bytes in session.play_accept() {
        stream.write_all(&bytes).await?;
    }
    hooks.dispatch(HookEvent::OnPlay, context_id, &path, &peer_ip);
    info!("rtmp: play start {path} to {peer_ip}");

    let mut read_buf = BytesMut::with_capacity(4096);
    let result: Result<()> = async {
        loop {
            tokio::select! {
                // Keep draining control traffic (pings, closeStream).
                r = stream.read_buf(&mut read_buf) => {
                    let n = r?;
                    if n == 0 {
                        return Ok(());
                    }
                    let events = session.handle_bytes(&read_buf[..n])?;
                    read_buf.clear();
                    for event in events {
                        match event {
                            SessionEvent::Send(bytes) => stream.write_all(&bytes).await?,
                            SessionEvent::CloseStream => return Ok(()),
                            _ => {}
                        }
                    }
                }
                event = consumer.pull(Duration::from_secs(1)) => {
                    let mut batch = Vec::with_capacity(mw_msgs);
                    match event {
                        Some(SourceEvent::Media(packet)) => batch.push(packet),
                        Some(SourceEvent::Eos) => {
                            stream.write_all(&session.stream_eof()).await?;
                            return Ok(());
                        }
                        None => continue,
                    }
                    // Merged writes: drain what is already queued, bounded.
                    while batch.len() < mw_msgs {
                        match consumer.try_pull() {
                            Some(SourceEvent::Media(packet)) => batch.push(packet),
                            Some(SourceEvent::Eos) => {
                                stream.write_all(&session.encode_media_batch(&batch)).await?;
                                stream.write_all(&session.stream_eof()).await?;
                                return Ok(());
                            }
                            None => break,
                        }
                    }
                    stream.write_all(&session.encode_media_batch(&batch)).await?;
                    // A consumer continuously behind a full GOP gets cut
                    // loose instead of dragging the source down.
                    if consumer.dropped() > config.gop_cache_max_frames(&path.vhost) as u64 {
                        stream.write_all(&session.stream_eof()).await?;
                        return Err(Error::QueueOverflow);
                    }
                }
                _ = interrupt.stopped() => return Ok(()),
            }
        }
    }
    .await;

    hooks.dispatch(HookEvent::OnStop, context_id, &path, &peer_ip);
    info!("rtmp: play stop {path}");
    drop(consumer);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmp::handshake::ClientSimpleHandshake;

    /// Drives the byte-level client half of a handshake + connect +
    /// publish exchange against the session core.
    #[test]
    fn test_publish_flow_produces_events() {
        let mut session = RtmpServerSession::new(4096);
        let mut client_hs = ClientSimpleHandshake::new();

        let c0c1 = client_hs.poll_write().unwrap();
        let events = session.handle_bytes(&c0c1).unwrap();
        let s0s1s2 = match &events[..] {
            [SessionEvent::Send(bytes)] => bytes.clone(),
            other => panic!("unexpected {other:?}"),
        };
        client_hs.handle_read(&s0s1s2).unwrap();
        let c2 = client_hs.poll_write().unwrap();
        assert!(session.handle_bytes(&c2).unwrap().is_empty());

        // connect
        let enc = ChunkEncoder::new();
        let connect = Command::Connect {
            transaction_id: 1.0,
            app: "live".into(),
            tc_url: Some("rtmp://example.com/live".into()),
            object_encoding: 0.0,
        };
        let wire = enc.write_message(cid::OVER_CONNECTION, &connect.to_message(0));
        let events = session.handle_bytes(&wire).unwrap();
        // WindowAck, SetPeerBw, SetChunkSize, _result
        assert_eq!(events.len(), 4);
        assert_eq!(session.vhost(), "example.com");

        // The server switched to its configured out chunk size; mimic a
        // client that keeps sending at 128.
        let publish = Command::Publish {
            transaction_id: 4.0,
            stream_name: "feed".into(),
            publish_type: PublishType::Live,
        };
        let wire = enc.write_message(cid::OVER_STREAM, &publish.to_message(MEDIA_STREAM_ID));
        let events = session.handle_bytes(&wire).unwrap();
        match &events[..] {
            [SessionEvent::StartPublish(path)] => {
                assert_eq!(path.vhost, "example.com");
                assert_eq!(path.app, "live");
                assert_eq!(path.stream, "feed");
            }
            other => panic!("unexpected {other:?}"),
        }
        // Driver-side acceptance produces the status messages.
        assert_eq!(session.publish_accept().len(), 2);

        // Media message becomes a hub packet.
        let video = RtmpMessage::new(
            msg_type::VIDEO,
            40,
            MEDIA_STREAM_ID,
            flv::VideoTagBody {
                keyframe: true,
                codec_id: flv::CODEC_AVC,
                packet_type: flv::AVC_NALU,
                cts: 0,
                data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            }
            .encode(),
        );
        let wire = enc.write_message(cid::VIDEO, &video);
        let events = session.handle_bytes(&wire).unwrap();
        match &events[..] {
            [SessionEvent::Media(packet)] => {
                assert_eq!(packet.kind, PacketKind::Video);
                assert_eq!(packet.codec, MediaCodec::H264);
                assert_eq!(packet.dts, 40);
                assert!(packet.keyframe);
                assert!(!packet.sequence_header);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_play_flow() {
        let mut session = RtmpServerSession::new(4096);
        let mut client_hs = ClientSimpleHandshake::new();
        let c0c1 = client_hs.poll_write().unwrap();
        let events = session.handle_bytes(&c0c1).unwrap();
        if let [SessionEvent::Send(bytes)] = &events[..] {
            client_hs.handle_read(bytes).unwrap();
        }
        session
            .handle_bytes(&client_hs.poll_write().unwrap())
            .unwrap();

        let enc = ChunkEncoder::new();
        let connect = Command::Connect {
            transaction_id: 1.0,
            app: "live".into(),
            tc_url: None,
            object_encoding: 0.0,
        };
        session
            .handle_bytes(&enc.write_message(cid::OVER_CONNECTION, &connect.to_message(0)))
            .unwrap();

        let play = Command::Play {
            transaction_id: 2.0,
            stream_name: "feed".into(),
            start: -2.0,
            duration: -1.0,
            reset: true,
        };
        let events = session
            .handle_bytes(&enc.write_message(cid::OVER_STREAM, &play.to_message(MEDIA_STREAM_ID)))
            .unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StartPlay(p) if p.stream == "feed")));
        assert_eq!(events.len(), 1);
        // StreamBegin + Play.Reset + Play.Start on acceptance.
        assert_eq!(session.play_accept().len(), 3);
    }

    #[test]
    fn test_ping_answered() {
        let mut session = RtmpServerSession::new(4096);
        // Skip handshake by feeding it directly.
        let mut client_hs = ClientSimpleHandshake::new();
        let c0c1 = client_hs.poll_write().unwrap();
        let events = session.handle_bytes(&c0c1).unwrap();
        if let [SessionEvent::Send(bytes)] = &events[..] {
            client_hs.handle_read(bytes).unwrap();
        }
        session
            .handle_bytes(&client_hs.poll_write().unwrap())
            .unwrap();

        let enc = ChunkEncoder::new();
        let ping = ProtocolControl::UserControl(UserControlEvent::PingRequest(777)).to_message();
        let events = session
            .handle_bytes(&enc.write_message(cid::PROTOCOL_CONTROL, &ping))
            .unwrap();
        assert_eq!(events.len(), 1);
        // Decode the reply and check it is a pong with the same timestamp.
        let mut dec = ChunkDecoder::new();
        if let SessionEvent::Send(bytes) = &events[0] {
            dec.handle_read(bytes).unwrap();
            let reply = dec.poll_message().unwrap();
            assert_eq!(
                ProtocolControl::parse(&reply).unwrap(),
                Some(ProtocolControl::UserControl(UserControlEvent::PingResponse(
                    777
                )))
            );
        }
    }

    #[test]
    fn test_vhost_from_tc_url() {
        assert_eq!(
            vhost_from_tc_url("rtmp://example.com/live"),
            Some("example.com".into())
        );
        assert_eq!(vhost_from_tc_url("rtmp://127.0.0.1:1935/live"), None);
        assert_eq!(
            vhost_from_tc_url("rtmp://127.0.0.1/live?vhost=demo.net"),
            Some("demo.net".into())
        );
        assert_eq!(vhost_from_tc_url("rtmp://localhost/live"), None);
    }
}
