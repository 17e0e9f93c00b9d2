//! SRTP cryptographic context: RFC 3711 key derivation, AES-CM keystream,
//! HMAC-SHA1-80 authentication.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use shared::error::{Error, Result};

use crate::replay::ReplayWindow;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
pub const AUTH_TAG_LEN: usize = 10;
const AUTH_KEY_LEN: usize = 20;
const SRTCP_INDEX_LEN: usize = 4;

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

/// Negotiated protection profile. Only the default the original negotiates
/// is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrtpProfile {
    #[default]
    Aes128CmHmacSha1_80,
}

struct SsrcState {
    roc: u32,
    highest_seq: u16,
    started: bool,
    replay: ReplayWindow,
}

impl Default for SsrcState {
    fn default() -> Self {
        Self {
            roc: 0,
            highest_seq: 0,
            started: false,
            replay: ReplayWindow::default(),
        }
    }
}

/// One direction's session keys plus per-SSRC rollover state.
pub struct SrtpContext {
    rtp_session_key: [u8; MASTER_KEY_LEN],
    rtp_session_salt: [u8; MASTER_SALT_LEN],
    rtp_auth_key: [u8; AUTH_KEY_LEN],
    rtcp_session_key: [u8; MASTER_KEY_LEN],
    rtcp_session_salt: [u8; MASTER_SALT_LEN],
    rtcp_auth_key: [u8; AUTH_KEY_LEN],
    ssrc_states: HashMap<u32, SsrcState>,
    rtcp_index: u32,
    rtcp_replay: ReplayWindow,
}

impl SrtpContext {
    /// Derives session keys from the master key/salt exported by DTLS.
    pub fn new(master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        if master_key.len() != MASTER_KEY_LEN || master_salt.len() != MASTER_SALT_LEN {
            return Err(Error::SrtpBadKeyLength);
        }
        let mut ctx = SrtpContext {
            rtp_session_key: [0; MASTER_KEY_LEN],
            rtp_session_salt: [0; MASTER_SALT_LEN],
            rtp_auth_key: [0; AUTH_KEY_LEN],
            rtcp_session_key: [0; MASTER_KEY_LEN],
            rtcp_session_salt: [0; MASTER_SALT_LEN],
            rtcp_auth_key: [0; AUTH_KEY_LEN],
            ssrc_states: HashMap::new(),
            rtcp_index: 0,
            rtcp_replay: ReplayWindow::default(),
        };
        derive_key(master_key, master_salt, LABEL_RTP_ENCRYPTION, &mut ctx.rtp_session_key);
        derive_key(master_key, master_salt, LABEL_RTP_AUTH, &mut ctx.rtp_auth_key);
        derive_key(master_key, master_salt, LABEL_RTP_SALT, &mut ctx.rtp_session_salt);
        derive_key(master_key, master_salt, LABEL_RTCP_ENCRYPTION, &mut ctx.rtcp_session_key);
        derive_key(master_key, master_salt, LABEL_RTCP_AUTH, &mut ctx.rtcp_auth_key);
        derive_key(master_key, master_salt, LABEL_RTCP_SALT, &mut ctx.rtcp_session_salt);
        Ok(ctx)
    }

    /// Encrypts payload and appends the auth tag. Returns the new length.
    pub fn protect_rtp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        if packet.len() < 12 {
            return Err(Error::SrtpTooShort);
        }
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let header_len = rtp_header_len(packet)?;

        let state = self.ssrc_states.entry(ssrc).or_default();
        if state.started && seq < state.highest_seq && state.highest_seq - seq > 0x8000 {
            state.roc = state.roc.wrapping_add(1);
        }
        if !state.started || seq_newer(seq, state.highest_seq) {
            state.highest_seq = seq;
        }
        state.started = true;
        let roc = state.roc;

        let iv = rtp_iv(&self.rtp_session_salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new((&self.rtp_session_key).into(), (&iv).into());
        cipher.apply_keystream(&mut packet[header_len..]);

        let tag = rtp_auth_tag(&self.rtp_auth_key, packet, roc);
        packet.extend_from_slice(&tag);
        Ok(packet.len())
    }

    /// Verifies the auth tag, decrypts, strips the tag. Returns the new
    /// length.
    pub fn unprotect_rtp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        if packet.len() < 12 + AUTH_TAG_LEN {
            return Err(Error::SrtpTooShort);
        }
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let header_len = rtp_header_len(packet)?;

        let state = self.ssrc_states.entry(ssrc).or_default();
        let roc = estimate_roc(state, seq);

        let body_len = packet.len() - AUTH_TAG_LEN;
        let expected = rtp_auth_tag(&self.rtp_auth_key, &packet[..body_len], roc);
        let received = &packet[body_len..];
        if expected.ct_eq(received).unwrap_u8() != 1 {
            return Err(Error::SrtpAuthFailed);
        }

        let index = ((roc as u64) << 16) | seq as u64;
        if !state.replay.check(index) {
            return Err(Error::SrtpReplayed);
        }

        // Commit rollover state only after authentication.
        if !state.started || seq_newer(seq, state.highest_seq) {
            state.highest_seq = seq;
            state.roc = roc;
        }
        state.started = true;

        packet.truncate(body_len);
        let iv = rtp_iv(&self.rtp_session_salt, ssrc, roc, seq);
        let mut cipher = Aes128Ctr::new((&self.rtp_session_key).into(), (&iv).into());
        cipher.apply_keystream(&mut packet[header_len..]);
        Ok(packet.len())
    }

    /// SRTCP: encrypts everything after the first 8 bytes, appends the
    /// E-flagged index and the auth tag.
    pub fn protect_rtcp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        if packet.len() < 8 {
            return Err(Error::SrtpTooShort);
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        self.rtcp_index = (self.rtcp_index + 1) & 0x7FFF_FFFF;
        let index = self.rtcp_index;

        let iv = rtcp_iv(&self.rtcp_session_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new((&self.rtcp_session_key).into(), (&iv).into());
        cipher.apply_keystream(&mut packet[8..]);

        packet.extend_from_slice(&(index | 0x8000_0000).to_be_bytes());
        let tag = hmac_tag(&self.rtcp_auth_key, &[&packet[..]]);
        packet.extend_from_slice(&tag);
        Ok(packet.len())
    }

    pub fn unprotect_rtcp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        if packet.len() < 8 + SRTCP_INDEX_LEN + AUTH_TAG_LEN {
            return Err(Error::SrtpTooShort);
        }
        let body_len = packet.len() - AUTH_TAG_LEN;
        let expected = hmac_tag(&self.rtcp_auth_key, &[&packet[..body_len]]);
        if expected.ct_eq(&packet[body_len..]).unwrap_u8() != 1 {
            return Err(Error::SrtcpAuthFailed);
        }

        let index_pos = body_len - SRTCP_INDEX_LEN;
        let e_index = u32::from_be_bytes([
            packet[index_pos],
            packet[index_pos + 1],
            packet[index_pos + 2],
            packet[index_pos + 3],
        ]);
        let encrypted = e_index & 0x8000_0000 != 0;
        let index = e_index & 0x7FFF_FFFF;
        if !self.rtcp_replay.check(index as u64) {
            return Err(Error::SrtpReplayed);
        }

        packet.truncate(index_pos);
        if encrypted {
            let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            let iv = rtcp_iv(&self.rtcp_session_salt, ssrc, index);
            let mut cipher = Aes128Ctr::new((&self.rtcp_session_key).into(), (&iv).into());
            cipher.apply_keystream(&mut packet[8..]);
        }
        Ok(packet.len())
    }
}

fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// RFC 3711 index estimation from the highest seen sequence number.
fn estimate_roc(state: &SsrcState, seq: u16) -> u32 {
    if !state.started {
        return 0;
    }
    let s_l = state.highest_seq;
    if s_l < 0x8000 {
        if seq > s_l && seq - s_l > 0x8000 {
            state.roc.wrapping_sub(1)
        } else {
            state.roc
        }
    } else if s_l - 0x8000 > seq {
        state.roc.wrapping_add(1)
    } else {
        state.roc
    }
}

fn rtp_header_len(packet: &[u8]) -> Result<usize> {
    let csrc_count = (packet[0] & 0x0F) as usize;
    let mut len = 12 + 4 * csrc_count;
    if packet[0] & 0x10 != 0 {
        if packet.len() < len + 4 {
            return Err(Error::SrtpTooShort);
        }
        let ext_words =
            u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
        len += 4 + ext_words * 4;
    }
    if packet.len() < len {
        return Err(Error::SrtpTooShort);
    }
    Ok(len)
}

/// AES-CM key derivation (RFC 3711 §4.3.1) with kdr = 0.
fn derive_key(master_key: &[u8], master_salt: &[u8], label: u8, out: &mut [u8]) {
    let mut x = [0u8; MASTER_SALT_LEN];
    x.copy_from_slice(master_salt);
    x[7] ^= label;
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(&x);

    out.fill(0);
    let key: &[u8; 16] = master_key.try_into().expect("master key length checked");
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(out);
}

/// IV = (salt * 2^16) XOR (ssrc * 2^64) XOR (index * 2^16)
fn rtp_iv(salt: &[u8; MASTER_SALT_LEN], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(salt);
    let ssrc_bytes = ssrc.to_be_bytes();
    for (i, b) in ssrc_bytes.iter().enumerate() {
        iv[4 + i] ^= b;
    }
    let index: u64 = ((roc as u64) << 16) | seq as u64;
    let index_bytes = index.to_be_bytes()[2..].to_vec(); // 48 bits
    for (i, b) in index_bytes.iter().enumerate() {
        iv[8 + i] ^= b;
    }
    iv
}

fn rtcp_iv(salt: &[u8; MASTER_SALT_LEN], ssrc: u32, index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(salt);
    let ssrc_bytes = ssrc.to_be_bytes();
    for (i, b) in ssrc_bytes.iter().enumerate() {
        iv[4 + i] ^= b;
    }
    let index_bytes = index.to_be_bytes();
    for (i, b) in index_bytes.iter().enumerate() {
        iv[10 + i] ^= b;
    }
    iv
}

fn rtp_auth_tag(auth_key: &[u8], packet: &[u8], roc: u32) -> [u8; AUTH_TAG_LEN] {
    hmac_tag(auth_key, &[packet, &roc.to_be_bytes()])
}

fn hmac_tag(auth_key: &[u8], parts: &[&[u8]]) -> [u8; AUTH_TAG_LEN] {
    let mut mac = HmacSha1::new_from_slice(auth_key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&digest[..AUTH_TAG_LEN]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SrtpContext {
        SrtpContext::new(&[0xE1u8; MASTER_KEY_LEN], &[0x0Fu8; MASTER_SALT_LEN]).unwrap()
    }

    fn rtp_packet(seq: u16, payload: &[u8]) -> BytesMut {
        let mut pkt = BytesMut::new();
        pkt.extend_from_slice(&[0x80, 96]);
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&1234u32.to_be_bytes());
        pkt.extend_from_slice(&0xABCDu32.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn test_rtp_round_trip() {
        let mut tx = ctx();
        let mut rx = ctx();
        for seq in [1u16, 2, 3] {
            let clear = rtp_packet(seq, b"hello srtp");
            let mut wire = clear.clone();
            tx.protect_rtp(&mut wire).unwrap();
            assert_eq!(wire.len(), clear.len() + AUTH_TAG_LEN);
            rx.unprotect_rtp(&mut wire).unwrap();
            assert_eq!(wire, clear);
        }
    }

    #[test]
    fn test_tampered_packet_fails_auth() {
        let mut tx = ctx();
        let mut rx = ctx();
        let mut wire = rtp_packet(5, b"payload");
        tx.protect_rtp(&mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert_eq!(rx.unprotect_rtp(&mut wire), Err(Error::SrtpAuthFailed));
    }

    #[test]
    fn test_replay_rejected() {
        let mut tx = ctx();
        let mut rx = ctx();
        let mut wire = rtp_packet(9, b"payload");
        tx.protect_rtp(&mut wire).unwrap();
        let copy = wire.clone();
        rx.unprotect_rtp(&mut wire).unwrap();
        let mut again = copy;
        assert_eq!(rx.unprotect_rtp(&mut again), Err(Error::SrtpReplayed));
    }

    #[test]
    fn test_rollover_tracking() {
        let mut tx = ctx();
        let mut rx = ctx();
        for seq in [65534u16, 65535, 0, 1] {
            let clear = rtp_packet(seq, b"wrap");
            let mut wire = clear.clone();
            tx.protect_rtp(&mut wire).unwrap();
            rx.unprotect_rtp(&mut wire).unwrap();
            assert_eq!(wire, clear);
        }
        assert_eq!(rx.ssrc_states.get(&0xABCD).unwrap().roc, 1);
    }

    #[test]
    fn test_rtcp_round_trip() {
        let mut tx = ctx();
        let mut rx = ctx();
        // A minimal RR: header + ssrc.
        let mut clear = BytesMut::new();
        clear.extend_from_slice(&[0x80, 201, 0, 1]);
        clear.extend_from_slice(&0x1111u32.to_be_bytes());
        let mut wire = clear.clone();
        tx.protect_rtcp(&mut wire).unwrap();
        assert_eq!(wire.len(), clear.len() + SRTCP_INDEX_LEN + AUTH_TAG_LEN);
        rx.unprotect_rtcp(&mut wire).unwrap();
        assert_eq!(wire, clear);
    }

    #[test]
    fn test_bad_master_key_len() {
        assert_eq!(
            SrtpContext::new(&[0u8; 8], &[0u8; MASTER_SALT_LEN]).err(),
            Some(Error::SrtpBadKeyLength)
        );
    }

    #[test]
    fn test_kdf_is_deterministic_and_label_separated() {
        let a = ctx();
        let b = ctx();
        assert_eq!(a.rtp_session_key, b.rtp_session_key);
        assert_ne!(a.rtp_session_key, a.rtcp_session_key[..]);
        assert_ne!(a.rtp_session_salt, a.rtcp_session_salt);
    }
}
