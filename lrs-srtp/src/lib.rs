#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod context;
pub mod replay;

use bytes::BytesMut;
use shared::error::Result;

pub use context::{SrtpContext, SrtpProfile, MASTER_KEY_LEN, MASTER_SALT_LEN};

/// The media transport of one connection, chosen at session init.
///
/// `Secure` is the production mode; `Semi` (RTCP protected, RTP clear) and
/// `Plaintext` exist for interop debugging and tests only.
pub enum Transport {
    Secure {
        /// Keys for traffic we send.
        local: SrtpContext,
        /// Keys for traffic the peer sends.
        remote: SrtpContext,
    },
    Semi {
        local: SrtpContext,
        remote: SrtpContext,
    },
    Plaintext,
}

impl Transport {
    pub fn protect_rtp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Secure { local, .. } => local.protect_rtp(packet),
            Transport::Semi { .. } | Transport::Plaintext => Ok(packet.len()),
        }
    }

    pub fn unprotect_rtp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Secure { remote, .. } => remote.unprotect_rtp(packet),
            Transport::Semi { .. } | Transport::Plaintext => Ok(packet.len()),
        }
    }

    pub fn protect_rtcp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Secure { local, .. } | Transport::Semi { local, .. } => {
                local.protect_rtcp(packet)
            }
            Transport::Plaintext => Ok(packet.len()),
        }
    }

    pub fn unprotect_rtcp(&mut self, packet: &mut BytesMut) -> Result<usize> {
        match self {
            Transport::Secure { remote, .. } | Transport::Semi { remote, .. } => {
                remote.unprotect_rtcp(packet)
            }
            Transport::Plaintext => Ok(packet.len()),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Secure { .. })
    }
}
