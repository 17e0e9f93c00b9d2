//! Per-peer connection: state machine, demux, SRTP transport, SSRC
//! routing, address migration.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info, warn};

use rtcp::RtcpPacket;
use sdp::MediaTrackDesc;
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};
use shared::time::{compact_ntp, SystemInstant};
use srtp::{SrtpContext, Transport};
use stun::message::attr;
use stun::Message;

use crate::demux::{classify, PacketClass};
use crate::dtls::DtlsTransport;
use crate::player::RtcPlayer;
use crate::publisher::{PublishState, RtcPublisher};
use crate::ssrc_cache::FastSsrcMap;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Init,
    WaitingStun,
    DoingDtlsHandshake,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Publisher,
    Player,
}

#[derive(Debug, Clone)]
struct EndpointRef {
    kind: EndpointKind,
    url: String,
}

/// What the connection wants the server loop to do.
#[derive(Debug, PartialEq)]
pub enum RtcEvent {
    /// Send to the active peer address.
    SendDatagram(Bytes),
    /// DTLS finished; deferred publishers and players may start.
    Established,
    /// Decrypted media from a publisher, ready for the hub.
    PublisherRtp { url: String, packet: rtp::Packet },
    /// A player needs a keyframe from the named stream.
    KeyframeRequest { url: String, ssrc: u32 },
    Closed,
}

/// One WebRTC peer connection.
pub struct RtcConnection {
    pub state: SessionState,
    ice_ufrag: String,
    ice_pwd: String,
    dtls: Box<dyn DtlsTransport>,
    transport: Transport,
    publishers: HashMap<String, RtcPublisher>,
    players: HashMap<String, RtcPlayer>,
    recv_routes: FastSsrcMap<EndpointRef>,
    send_routes: FastSsrcMap<EndpointRef>,
    /// Every source address this peer was seen from; owned until close.
    peer_addrs: HashMap<SocketAddr, i64>,
    active_addr: Option<SocketAddr>,
    last_stun_us: i64,
    session_timeout_us: i64,
    epoch: SystemInstant,
    /// Consecutive SRTP auth failures; past the limit the connection dies.
    crypto_failures: u32,
}

const MAX_CRYPTO_FAILURES: u32 = 100;

impl RtcConnection {
    pub fn new(
        ice_ufrag: String,
        ice_pwd: String,
        dtls: Box<dyn DtlsTransport>,
        session_timeout_us: i64,
    ) -> Self {
        Self {
            state: SessionState::Init,
            ice_ufrag,
            ice_pwd,
            dtls,
            transport: Transport::Plaintext,
            publishers: HashMap::new(),
            players: HashMap::new(),
            recv_routes: FastSsrcMap::new(),
            send_routes: FastSsrcMap::new(),
            peer_addrs: HashMap::new(),
            active_addr: None,
            last_stun_us: 0,
            session_timeout_us,
            epoch: SystemInstant::now(),
            crypto_failures: 0,
        }
    }

    pub fn active_addr(&self) -> Option<SocketAddr> {
        self.active_addr
    }

    pub fn known_addrs(&self) -> Vec<SocketAddr> {
        self.peer_addrs.keys().copied().collect()
    }

    /// Registers a publisher negotiated out-of-band.
    pub fn add_publisher(&mut self, url: &str, tracks: Vec<MediaTrackDesc>, drop_for_pt: u8) -> Result<()> {
        let publisher = RtcPublisher::new(url.to_string(), tracks, drop_for_pt)?;
        for ssrc in publisher.ssrcs() {
            if self.recv_routes.get(ssrc).is_some() {
                return Err(Error::DuplicateSsrc(ssrc));
            }
            self.recv_routes.insert(
                ssrc,
                EndpointRef {
                    kind: EndpointKind::Publisher,
                    url: url.to_string(),
                },
            );
        }
        self.publishers.insert(url.to_string(), publisher);
        Ok(())
    }

    pub fn add_player(&mut self, url: &str, tracks: Vec<MediaTrackDesc>, nack_no_copy: bool) -> Result<()> {
        let player = RtcPlayer::new(url.to_string(), tracks, nack_no_copy);
        for ssrc in player.ssrcs() {
            if self.send_routes.get(ssrc).is_some() {
                return Err(Error::DuplicateSsrc(ssrc));
            }
            self.send_routes.insert(
                ssrc,
                EndpointRef {
                    kind: EndpointKind::Player,
                    url: url.to_string(),
                },
            );
        }
        self.players.insert(url.to_string(), player);
        Ok(())
    }

    pub fn set_load_critical(&mut self, critical: bool) {
        for p in self.publishers.values_mut() {
            p.set_load_critical(critical);
        }
    }

    /// One datagram from the UDP socket.
    pub fn handle_datagram(
        &mut self,
        now_us: i64,
        from: SocketAddr,
        mut data: BytesMut,
    ) -> Result<Vec<RtcEvent>> {
        if self.state == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        match classify(&data) {
            PacketClass::Stun => self.on_stun(now_us, from, &data),
            PacketClass::Dtls => self.on_dtls(&data),
            PacketClass::Rtp => self.on_rtp(now_us, &mut data),
            PacketClass::Rtcp => self.on_rtcp(now_us, &mut data),
            PacketClass::Unknown => {
                debug!("rtc: dropping unclassifiable {} byte datagram", data.len());
                Ok(Vec::new())
            }
        }
    }

    fn on_stun(&mut self, now_us: i64, from: SocketAddr, data: &[u8]) -> Result<Vec<RtcEvent>> {
        let msg = Message::decode(data)?;
        if !msg.is_binding_request() {
            return Ok(Vec::new());
        }
        Message::verify(data, &self.ice_pwd)?;

        self.last_stun_us = now_us;
        // Address migration: latest source wins; the cache entry (and its
        // socket, owned by the server loop) lives until close.
        self.peer_addrs.entry(from).or_insert(now_us);
        if self.active_addr != Some(from) {
            if self.active_addr.is_some() {
                info!("rtc: peer migrated to {from}");
            }
            self.active_addr = Some(from);
        }

        let mut events = Vec::new();
        if matches!(self.state, SessionState::Init | SessionState::WaitingStun) {
            // A binding request moves INIT through WAITING_STUN straight to
            // the handshake: the peer is now reachable, so DTLS starts.
            self.state = SessionState::DoingDtlsHandshake;
            self.dtls.start_active_handshake()?;
            while let Some(flight) = self.dtls.poll_write() {
                events.push(RtcEvent::SendDatagram(flight));
            }
        }

        let mut resp = Message::binding_success(msg.transaction_id);
        resp.add_xor_mapped_address(&from);
        if let Some(username) = msg.get(attr::USERNAME) {
            resp.add(attr::USERNAME, username.clone());
        }
        events.push(RtcEvent::SendDatagram(
            resp.encode_with_integrity(&self.ice_pwd),
        ));

        events.extend(self.maybe_established()?);
        Ok(events)
    }

    fn on_dtls(&mut self, data: &[u8]) -> Result<Vec<RtcEvent>> {
        let mut events = Vec::new();
        match self.dtls.handle_record(data) {
            Ok(replies) => {
                for r in replies {
                    events.push(RtcEvent::SendDatagram(r));
                }
            }
            Err(e) => {
                // Crypto failures drop the datagram, not the connection,
                // unless they keep coming.
                warn!("rtc: dtls record error: {e}");
                self.crypto_failures += 1;
                if self.crypto_failures > MAX_CRYPTO_FAILURES {
                    return Err(Error::DtlsHandshake("too many failures".into()));
                }
                return Ok(events);
            }
        }
        events.extend(self.maybe_established()?);
        Ok(events)
    }

    fn maybe_established(&mut self) -> Result<Vec<RtcEvent>> {
        if self.state == SessionState::Established || !self.dtls.is_established() {
            return Ok(Vec::new());
        }
        let keys = self.dtls.export_keying_material()?;
        self.transport = Transport::Secure {
            local: SrtpContext::new(&keys.local_key, &keys.local_salt)?,
            remote: SrtpContext::new(&keys.remote_key, &keys.remote_salt)?,
        };
        self.state = SessionState::Established;
        info!("rtc: session established");
        Ok(vec![RtcEvent::Established])
    }

    fn on_rtp(&mut self, now_us: i64, data: &mut BytesMut) -> Result<Vec<RtcEvent>> {
        if self.state != SessionState::Established {
            return Ok(Vec::new());
        }
        if data.len() < 12 {
            return Err(Error::RtpHeaderTooShort);
        }
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let Some(route) = self.recv_routes.get(ssrc) else {
            debug!("rtc: rtp for unrouted ssrc {ssrc}");
            return Ok(Vec::new());
        };
        let publisher = self
            .publishers
            .get_mut(&route.url)
            .ok_or(Error::SourceGone)?;

        // TWCC counts the packet even when unprotect fails below.
        publisher.on_rtp_prepass(data, ssrc, now_us);

        if let Err(e) = self.transport.unprotect_rtp(data) {
            self.crypto_failures += 1;
            debug!("rtc: srtp unprotect failed: {e}");
            if self.crypto_failures > MAX_CRYPTO_FAILURES {
                return Err(e);
            }
            return Ok(Vec::new());
        }
        self.crypto_failures = 0;

        let mut buf: Bytes = data.clone().freeze();
        let packet = rtp::Packet::unmarshal(&mut buf)?;
        if !publisher.on_rtp(&packet, now_us)? {
            return Ok(Vec::new());
        }
        Ok(vec![RtcEvent::PublisherRtp {
            url: route.url.clone(),
            packet,
        }])
    }

    fn on_rtcp(&mut self, now_us: i64, data: &mut BytesMut) -> Result<Vec<RtcEvent>> {
        if self.state != SessionState::Established {
            return Ok(Vec::new());
        }
        if let Err(e) = self.transport.unprotect_rtcp(data) {
            self.crypto_failures += 1;
            debug!("rtc: srtcp unprotect failed: {e}");
            return Ok(Vec::new());
        }
        let packets = rtcp::compound::decode(&data.clone().freeze())?;

        let now_ntp = compact_ntp(self.epoch.ntp(Instant::now()));
        let mut events = Vec::new();
        for packet in &packets {
            // Feedback addressed to our sending tracks goes to players;
            // everything else describes the publisher's media.
            match packet {
                RtcpPacket::TransportLayerNack(nack) => {
                    if let Some(route) = self.send_routes.get(nack.media_ssrc) {
                        events.extend(self.player_feedback(&route.url, packet, now_ntp)?);
                    }
                }
                RtcpPacket::PictureLossIndication(pli) => {
                    if let Some(route) = self.send_routes.get(pli.media_ssrc) {
                        events.extend(self.player_feedback(&route.url, packet, now_ntp)?);
                    }
                }
                RtcpPacket::ReceiverReport(_) => {
                    for player in self.players.values_mut() {
                        player.on_rtcp(packet, now_ntp);
                    }
                }
                _ => {
                    for publisher in self.publishers.values_mut() {
                        publisher.on_rtcp(packet, now_us);
                    }
                }
            }
        }
        Ok(events)
    }

    fn player_feedback(
        &mut self,
        url: &str,
        packet: &RtcpPacket,
        now_ntp: u32,
    ) -> Result<Vec<RtcEvent>> {
        let player = self.players.get_mut(url).ok_or(Error::SourceGone)?;
        let retransmits = player.on_rtcp(packet, now_ntp);
        let mut events = Vec::new();
        for pkt in retransmits {
            events.extend(self.send_rtp_inner(&pkt)?);
        }
        Ok(events)
    }

    /// Whether any player's PLI queue has work for the PLI worker.
    pub fn pli_pending(&self) -> bool {
        self.players.values().any(|p| !p.pli.is_empty())
    }

    /// Sends a PLI toward a publishing peer, asking it for an IDR.
    pub fn request_publisher_keyframe(&mut self, url: &str) -> Result<Vec<RtcEvent>> {
        let Some(publisher) = self.publishers.get(url) else {
            return Ok(Vec::new());
        };
        let sender_ssrc = publisher.sender_ssrc();
        let batch: Vec<RtcpPacket> = publisher
            .video_ssrcs()
            .into_iter()
            .map(|media_ssrc| {
                RtcpPacket::PictureLossIndication(
                    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication {
                        sender_ssrc,
                        media_ssrc,
                    },
                )
            })
            .collect();
        self.send_rtcp(&batch)
    }

    /// Sends one media packet toward the peer through a player.
    pub fn send_media(&mut self, url: &str, packet: &rtp::Packet) -> Result<Vec<RtcEvent>> {
        if self.state != SessionState::Established {
            return Ok(Vec::new());
        }
        let player = self.players.get_mut(url).ok_or(Error::SourceGone)?;
        player.on_send_rtp(packet);
        self.send_rtp_inner(packet)
    }

    fn send_rtp_inner(&mut self, packet: &rtp::Packet) -> Result<Vec<RtcEvent>> {
        let raw = packet.marshal()?;
        let mut buf = BytesMut::from(&raw[..]);
        self.transport.protect_rtp(&mut buf)?;
        Ok(vec![RtcEvent::SendDatagram(buf.freeze())])
    }

    fn send_rtcp(&mut self, packets: &[RtcpPacket]) -> Result<Vec<RtcEvent>> {
        if packets.is_empty() {
            return Ok(Vec::new());
        }
        let raw = rtcp::compound::encode(packets)?;
        let mut buf = BytesMut::from(&raw[..]);
        self.transport.protect_rtcp(&mut buf)?;
        Ok(vec![RtcEvent::SendDatagram(buf.freeze())])
    }

    /// 20 ms tick: publisher NACKs.
    pub fn on_tick_20ms(&mut self, now_us: i64) -> Result<Vec<RtcEvent>> {
        let mut batch = Vec::new();
        for p in self.publishers.values_mut() {
            batch.extend(p.on_tick_20ms(now_us));
        }
        self.send_rtcp(&batch)
    }

    /// 100 ms tick: TWCC feedback.
    pub fn on_tick_100ms(&mut self) -> Result<Vec<RtcEvent>> {
        let mut batch = Vec::new();
        for p in self.publishers.values_mut() {
            batch.extend(p.on_tick_100ms());
        }
        self.send_rtcp(&batch)
    }

    /// 1 s tick: RR/XR from publishers, SR from players; also the place
    /// inactivity is noticed.
    pub fn on_tick_1s(&mut self, now_us: i64) -> Result<Vec<RtcEvent>> {
        if self.last_stun_us > 0 && now_us - self.last_stun_us > self.session_timeout_us {
            info!("rtc: session timeout, closing");
            self.close();
            return Ok(vec![RtcEvent::Closed]);
        }
        let now = Instant::now();
        let mut batch = Vec::new();
        let epoch = self.epoch;
        for p in self.publishers.values_mut() {
            batch.extend(p.on_tick_1s(&epoch, now, now_us));
        }
        for player in self.players.values_mut() {
            batch.extend(player.on_tick_1s(&epoch, now));
        }
        self.send_rtcp(&batch)
    }

    /// Drains PLI workers: one PLI per requested SSRC, plus keyframe
    /// requests toward the sources feeding those players.
    pub fn drain_pli(&mut self) -> Result<Vec<RtcEvent>> {
        let mut events = Vec::new();
        let mut batch = Vec::new();
        for player in self.players.values_mut() {
            if player.pli.is_empty() {
                continue;
            }
            let sender = player.video_ssrc().unwrap_or(0);
            let plis = player.pli.drain(sender);
            for pli in &plis {
                if let RtcpPacket::PictureLossIndication(p) = pli {
                    events.push(RtcEvent::KeyframeRequest {
                        url: player.url.clone(),
                        ssrc: p.media_ssrc,
                    });
                }
            }
            batch.extend(plis);
        }
        events.extend(self.send_rtcp(&batch)?);
        Ok(events)
    }

    pub fn publisher_state(&self, url: &str) -> Option<PublishState> {
        self.publishers.get(url).map(|p| p.state)
    }

    /// Idempotent close; unlinking from the registry is the server's job.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        for p in self.publishers.values_mut() {
            p.stop();
        }
        // peer_addrs (and the sockets cached against them) drop here, at
        // destruction time, not on migration.
        self.peer_addrs.clear();
    }
}
