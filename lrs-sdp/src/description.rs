//! Line-oriented SDP parsing, covering the subset WHIP/WHEP-style
//! publishers and players actually send.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

use shared::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl MediaKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            "application" => Some(MediaKind::Application),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Application => "application",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// The direction the answerer uses in response.
    pub fn reverse(&self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

/// One payload type declared by an m-line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PayloadDesc {
    pub pt: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub fmtp: String,
    pub rtcp_fb: Vec<String>,
}

impl PayloadDesc {
    /// Value of one `key=value` fmtp parameter.
    pub fn fmtp_param(&self, key: &str) -> Option<&str> {
        self.fmtp
            .split(';')
            .map(str::trim)
            .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaDescription {
    pub kind: Option<MediaKind>,
    pub mid: String,
    pub direction: Direction,
    pub payloads: Vec<PayloadDesc>,
    /// Declared m-line payload order, which doubles as offer preference.
    pub payload_order: Vec<u8>,
    pub extmaps: Vec<(u8, String)>,
    pub ssrcs: Vec<u32>,
    /// `a=ssrc-group:<semantics> <ssrc>…`, FID and FEC preserved.
    pub ssrc_groups: Vec<(String, Vec<u32>)>,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
    pub setup: String,
    pub rtcp_mux: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionDescription {
    pub session_name: String,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
    pub ice_lite: bool,
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines().map(str::trim_end).filter(|l| !l.is_empty());
        match lines.next() {
            Some("v=0") => {}
            _ => return Err(Error::SdpMissingVersion),
        }

        let mut sd = SessionDescription::default();
        let mut current: Option<MediaDescription> = None;
        let mut payload_map: HashMap<u8, PayloadDesc> = HashMap::new();

        let flush =
            |current: &mut Option<MediaDescription>, payload_map: &mut HashMap<u8, PayloadDesc>, sd: &mut SessionDescription| {
                if let Some(mut media) = current.take() {
                    for pt in &media.payload_order {
                        if let Some(desc) = payload_map.remove(pt) {
                            media.payloads.push(desc);
                        }
                    }
                    payload_map.clear();
                    sd.medias.push(media);
                }
            };

        for line in lines {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::SdpBadLine(line.to_string()))?;
            match key {
                "s" => sd.session_name = value.to_string(),
                "m" => {
                    flush(&mut current, &mut payload_map, &mut sd);
                    let mut parts = value.split_whitespace();
                    let kind = parts.next().and_then(MediaKind::parse);
                    let _port = parts.next();
                    let _proto = parts.next();
                    let mut media = MediaDescription {
                        kind,
                        ..Default::default()
                    };
                    for pt in parts {
                        if let Ok(pt) = pt.parse::<u8>() {
                            media.payload_order.push(pt);
                        }
                    }
                    current = Some(media);
                }
                "a" => Self::parse_attribute(value, &mut sd, &mut current, &mut payload_map)?,
                // c=, t=, o=, b= and friends carry nothing the relay uses
                _ => {}
            }
        }
        flush(&mut current, &mut payload_map, &mut sd);
        Ok(sd)
    }

    fn parse_attribute(
        value: &str,
        sd: &mut SessionDescription,
        current: &mut Option<MediaDescription>,
        payload_map: &mut HashMap<u8, PayloadDesc>,
    ) -> Result<()> {
        let (name, rest) = match value.split_once(':') {
            Some((n, r)) => (n, r),
            None => (value, ""),
        };

        match name {
            "ice-lite" => sd.ice_lite = true,
            "ice-ufrag" => match current {
                Some(m) => m.ice_ufrag = rest.to_string(),
                None => sd.ice_ufrag = rest.to_string(),
            },
            "ice-pwd" => match current {
                Some(m) => m.ice_pwd = rest.to_string(),
                None => sd.ice_pwd = rest.to_string(),
            },
            "fingerprint" => match current {
                Some(m) => m.fingerprint = rest.to_string(),
                None => sd.fingerprint = rest.to_string(),
            },
            "sendrecv" | "sendonly" | "recvonly" | "inactive" => {
                if let Some(m) = current {
                    m.direction = match name {
                        "sendonly" => Direction::SendOnly,
                        "recvonly" => Direction::RecvOnly,
                        "inactive" => Direction::Inactive,
                        _ => Direction::SendRecv,
                    };
                }
            }
            "mid" => {
                if let Some(m) = current {
                    m.mid = rest.to_string();
                }
            }
            "setup" => {
                if let Some(m) = current {
                    m.setup = rest.to_string();
                }
            }
            "rtcp-mux" => {
                if let Some(m) = current {
                    m.rtcp_mux = true;
                }
            }
            "rtpmap" => {
                let (pt, spec) = rest
                    .split_once(' ')
                    .ok_or_else(|| Error::SdpBadLine(format!("rtpmap:{rest}")))?;
                let pt: u8 = pt
                    .parse()
                    .map_err(|_| Error::SdpBadLine(format!("rtpmap:{rest}")))?;
                let mut spec_parts = spec.split('/');
                let encoding = spec_parts.next().unwrap_or_default().to_string();
                let clock_rate = spec_parts
                    .next()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(90000);
                let channels = spec_parts.next().and_then(|c| c.parse().ok()).unwrap_or(1);
                let entry = payload_map.entry(pt).or_default();
                entry.pt = pt;
                entry.encoding = encoding;
                entry.clock_rate = clock_rate;
                entry.channels = channels;
            }
            "fmtp" => {
                if let Some((pt, params)) = rest.split_once(' ') {
                    if let Ok(pt) = pt.parse::<u8>() {
                        let entry = payload_map.entry(pt).or_default();
                        entry.pt = pt;
                        entry.fmtp = params.to_string();
                    }
                }
            }
            "rtcp-fb" => {
                if let Some((pt, fb)) = rest.split_once(' ') {
                    if let Ok(pt) = pt.parse::<u8>() {
                        let entry = payload_map.entry(pt).or_default();
                        entry.pt = pt;
                        entry.rtcp_fb.push(fb.to_string());
                    }
                }
            }
            "extmap" => {
                if let Some(m) = current {
                    if let Some((id, uri)) = rest.split_once(' ') {
                        if let Ok(id) = id.parse::<u8>() {
                            m.extmaps.push((id, uri.to_string()));
                        }
                    }
                }
            }
            "ssrc" => {
                if let Some(m) = current {
                    let ssrc_str = rest.split_whitespace().next().unwrap_or_default();
                    if let Ok(ssrc) = ssrc_str.parse::<u32>() {
                        if !m.ssrcs.contains(&ssrc) {
                            m.ssrcs.push(ssrc);
                        }
                    }
                }
            }
            "ssrc-group" => {
                if let Some(m) = current {
                    let mut parts = rest.split_whitespace();
                    let semantics = parts.next().unwrap_or_default().to_string();
                    let ssrcs: Vec<u32> = parts.filter_map(|s| s.parse().ok()).collect();
                    m.ssrc_groups.push((semantics, ssrcs));
                }
            }
            // candidate, msid, rtcp, group etc.: not needed by an
            // ICE-lite answerer
            _ => {}
        }
        Ok(())
    }

    /// Renders this description back to SDP text.
    pub fn marshal(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        let _ = writeln!(
            out,
            "o=- {} 2 IN IP4 127.0.0.1\r",
            rand::random::<u32>()
        );
        let _ = writeln!(out, "s={}\r", if self.session_name.is_empty() { "-" } else { &self.session_name });
        out.push_str("t=0 0\r\n");
        if self.ice_lite {
            out.push_str("a=ice-lite\r\n");
        }
        for media in &self.medias {
            let pts: Vec<String> = media.payloads.iter().map(|p| p.pt.to_string()).collect();
            let _ = writeln!(
                out,
                "m={} 9 UDP/TLS/RTP/SAVPF {}\r",
                media.kind.map_or("application", |k| k.as_str()),
                pts.join(" ")
            );
            out.push_str("c=IN IP4 0.0.0.0\r\n");
            if !media.ice_ufrag.is_empty() {
                let _ = writeln!(out, "a=ice-ufrag:{}\r", media.ice_ufrag);
                let _ = writeln!(out, "a=ice-pwd:{}\r", media.ice_pwd);
            }
            if !media.fingerprint.is_empty() {
                let _ = writeln!(out, "a=fingerprint:{}\r", media.fingerprint);
            }
            if !media.setup.is_empty() {
                let _ = writeln!(out, "a=setup:{}\r", media.setup);
            }
            if !media.mid.is_empty() {
                let _ = writeln!(out, "a=mid:{}\r", media.mid);
            }
            let _ = writeln!(out, "a={}\r", media.direction.as_str());
            if media.rtcp_mux {
                out.push_str("a=rtcp-mux\r\n");
            }
            for (id, uri) in &media.extmaps {
                let _ = writeln!(out, "a=extmap:{id} {uri}\r");
            }
            for p in &media.payloads {
                if p.channels > 1 {
                    let _ = writeln!(out, "a=rtpmap:{} {}/{}/{}\r", p.pt, p.encoding, p.clock_rate, p.channels);
                } else {
                    let _ = writeln!(out, "a=rtpmap:{} {}/{}\r", p.pt, p.encoding, p.clock_rate);
                }
                if !p.fmtp.is_empty() {
                    let _ = writeln!(out, "a=fmtp:{} {}\r", p.pt, p.fmtp);
                }
                for fb in &p.rtcp_fb {
                    let _ = writeln!(out, "a=rtcp-fb:{} {}\r", p.pt, fb);
                }
            }
            for (semantics, ssrcs) in &media.ssrc_groups {
                let list: Vec<String> = ssrcs.iter().map(u32::to_string).collect();
                let _ = writeln!(out, "a=ssrc-group:{} {}\r", semantics, list.join(" "));
            }
            for ssrc in &media.ssrcs {
                let _ = writeln!(out, "a=ssrc:{ssrc} cname:lrs\r");
            }
        }
        out
    }
}
