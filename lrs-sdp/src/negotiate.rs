//! Offer/answer negotiation producing the track-description tree the
//! session layer routes by.

use serde::{Deserialize, Serialize};

use shared::error::{Error, Result};

use crate::description::{Direction, MediaDescription, MediaKind, PayloadDesc, SessionDescription};

/// Codecs the relay is willing to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackCodec {
    H264,
    H265,
    Av1,
    Opus,
    Aac,
}

impl TrackCodec {
    fn matches(&self, p: &PayloadDesc) -> bool {
        match self {
            TrackCodec::H264 => {
                p.encoding.eq_ignore_ascii_case("H264")
                    && p.fmtp_param("packetization-mode") == Some("1")
            }
            TrackCodec::H265 => p.encoding.eq_ignore_ascii_case("H265"),
            TrackCodec::Av1 => p.encoding.eq_ignore_ascii_case("AV1"),
            TrackCodec::Opus => p.encoding.eq_ignore_ascii_case("opus"),
            TrackCodec::Aac => p.encoding.eq_ignore_ascii_case("MP4A-ADTS"),
        }
    }
}

/// Local negotiation policy; what the server enables per vhost.
#[derive(Debug, Clone)]
pub struct LocalPolicy {
    pub nack_enabled: bool,
    pub twcc_enabled: bool,
    pub h265_enabled: bool,
    pub aac_enabled: bool,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
}

impl Default for LocalPolicy {
    fn default() -> Self {
        Self {
            nack_enabled: true,
            twcc_enabled: true,
            h265_enabled: false,
            aac_enabled: false,
            ice_ufrag: random_ice_string(4),
            ice_pwd: random_ice_string(24),
            fingerprint: String::new(),
        }
    }
}

fn random_ice_string(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| ALPHABET[rand::random::<u32>() as usize % ALPHABET.len()] as char)
        .collect()
}

/// One negotiated track: the mapping from a remote m-line to local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrackDesc {
    pub mid: String,
    pub is_video: bool,
    pub codec: TrackCodec,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Remote SSRCs for receiving tracks (media first, then RTX/FEC).
    pub remote_ssrcs: Vec<u32>,
    /// Locally generated SSRC for sending tracks.
    pub local_ssrc: u32,
    pub nack: bool,
    pub pli: bool,
    pub twcc: bool,
    /// TWCC extension id, when offered and enabled.
    pub twcc_ext_id: Option<u8>,
    pub direction: Direction,
    /// FID/FEC groups preserved from the offer.
    pub ssrc_groups: Vec<(String, Vec<u32>)>,
}

/// Intersects the remote offer with local policy.
///
/// Returns the answer plus the track descriptions. Unsupportable m-lines
/// are rejected (port-0 style: empty payload list, inactive) rather than
/// failing the whole exchange, matching the Unsupported error policy.
pub fn negotiate(
    offer: &SessionDescription,
    policy: &LocalPolicy,
) -> Result<(SessionDescription, Vec<MediaTrackDesc>)> {
    let mut answer = SessionDescription {
        session_name: "lrs".to_string(),
        ice_lite: true,
        ..Default::default()
    };
    let mut tracks = Vec::new();

    for (index, media) in offer.medias.iter().enumerate() {
        let is_video = media.kind == Some(MediaKind::Video);
        let chosen = match media.kind {
            Some(MediaKind::Video) => {
                // 42e01f constrained-baseline preferred among H264 payloads.
                let h264 = media
                    .payloads
                    .iter()
                    .filter(|p| TrackCodec::H264.matches(p))
                    .max_by_key(|p| p.fmtp_param("profile-level-id") == Some("42e01f"));
                let h265 = if policy.h265_enabled {
                    media.payloads.iter().find(|p| TrackCodec::H265.matches(p))
                } else {
                    None
                };
                h264.map(|p| (p, TrackCodec::H264))
                    .or(h265.map(|p| (p, TrackCodec::H265)))
                    .or(media
                        .payloads
                        .iter()
                        .find(|p| TrackCodec::Av1.matches(p))
                        .map(|p| (p, TrackCodec::Av1)))
            }
            Some(MediaKind::Audio) => {
                let opus = media.payloads.iter().find(|p| TrackCodec::Opus.matches(p));
                let aac = if policy.aac_enabled {
                    media.payloads.iter().find(|p| TrackCodec::Aac.matches(p))
                } else {
                    None
                };
                opus.map(|p| (p, TrackCodec::Opus))
                    .or(aac.map(|p| (p, TrackCodec::Aac)))
            }
            _ => None,
        };

        let Some((payload, codec)) = chosen else {
            log::warn!("sdp: no compatible codec for m-line {index}, rejecting");
            answer.medias.push(MediaDescription {
                kind: media.kind,
                mid: media.mid.clone(),
                direction: Direction::Inactive,
                ..Default::default()
            });
            if media.kind.is_none() {
                return Err(Error::NoCompatibleCodec(index));
            }
            continue;
        };

        // Feedback set is the intersection of what the peer offered and
        // what policy allows; PLI follows NACK policy.
        let offered_nack = payload.rtcp_fb.iter().any(|f| f == "nack");
        let offered_pli = payload.rtcp_fb.iter().any(|f| f == "nack pli");
        let offered_twcc = payload.rtcp_fb.iter().any(|f| f == "transport-cc");
        let nack = offered_nack && policy.nack_enabled && is_video;
        let pli = offered_pli && is_video;
        let twcc = offered_twcc && policy.twcc_enabled;

        // TWCC is the only extension answered.
        let twcc_ext_id = media
            .extmaps
            .iter()
            .find(|(_, uri)| uri.contains("transport-wide-cc"))
            .map(|(id, _)| *id)
            .filter(|_| twcc);

        let mut fb = Vec::new();
        if nack {
            fb.push("nack".to_string());
        }
        if pli {
            fb.push("nack pli".to_string());
        }
        if twcc {
            fb.push("transport-cc".to_string());
        }

        let local_ssrc: u32 = rand::random();
        let direction = media.direction.reverse();

        let answered_payload = PayloadDesc {
            pt: payload.pt,
            encoding: payload.encoding.clone(),
            clock_rate: payload.clock_rate,
            channels: payload.channels,
            fmtp: payload.fmtp.clone(),
            rtcp_fb: fb,
        };

        let mut answer_media = MediaDescription {
            kind: media.kind,
            mid: media.mid.clone(),
            direction,
            payloads: vec![answered_payload],
            payload_order: vec![payload.pt],
            extmaps: twcc_ext_id
                .map(|id| {
                    vec![(
                        id,
                        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
                            .to_string(),
                    )]
                })
                .unwrap_or_default(),
            ice_ufrag: policy.ice_ufrag.clone(),
            ice_pwd: policy.ice_pwd.clone(),
            fingerprint: policy.fingerprint.clone(),
            setup: "passive".to_string(),
            rtcp_mux: true,
            ..Default::default()
        };
        if direction == Direction::SendOnly || direction == Direction::SendRecv {
            answer_media.ssrcs.push(local_ssrc);
        }
        answer.medias.push(answer_media);

        tracks.push(MediaTrackDesc {
            mid: media.mid.clone(),
            is_video,
            codec,
            payload_type: payload.pt,
            clock_rate: payload.clock_rate,
            remote_ssrcs: media.ssrcs.clone(),
            local_ssrc,
            nack,
            pli,
            twcc,
            twcc_ext_id,
            direction,
            ssrc_groups: media.ssrc_groups.clone(),
        });
    }

    Ok((answer, tracks))
}
