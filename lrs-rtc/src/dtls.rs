//! Seam to the external DTLS implementation.
//!
//! The record layer and handshake crypto are collaborators outside the
//! core; the session only needs to pump records, know when the handshake
//! finished, and export SRTP keying material.

use bytes::Bytes;

use shared::error::Result;
use srtp::{MASTER_KEY_LEN, MASTER_SALT_LEN};

/// Exported keying material, already split per RFC 5764.
#[derive(Clone)]
pub struct SrtpKeyingMaterial {
    pub local_key: [u8; MASTER_KEY_LEN],
    pub local_salt: [u8; MASTER_SALT_LEN],
    pub remote_key: [u8; MASTER_KEY_LEN],
    pub remote_salt: [u8; MASTER_SALT_LEN],
}

pub trait DtlsTransport: Send {
    /// Kicks off the handshake; called when the first STUN binding
    /// arrives and the peer is known.
    fn start_active_handshake(&mut self) -> Result<()>;

    /// Feeds one incoming DTLS record; returns records to send back.
    fn handle_record(&mut self, record: &[u8]) -> Result<Vec<Bytes>>;

    /// Records waiting to be flushed (handshake flights, retransmits).
    fn poll_write(&mut self) -> Option<Bytes>;

    fn is_established(&self) -> bool;

    /// Available once established.
    fn export_keying_material(&self) -> Result<SrtpKeyingMaterial>;
}

/// Handshake-free stand-in used by tests and by `Plaintext` transports.
pub struct NullDtls {
    established: bool,
    keys: SrtpKeyingMaterial,
}

impl Default for NullDtls {
    fn default() -> Self {
        Self {
            established: false,
            keys: SrtpKeyingMaterial {
                local_key: [0x11; MASTER_KEY_LEN],
                local_salt: [0x22; MASTER_SALT_LEN],
                remote_key: [0x11; MASTER_KEY_LEN],
                remote_salt: [0x22; MASTER_SALT_LEN],
            },
        }
    }
}

impl DtlsTransport for NullDtls {
    fn start_active_handshake(&mut self) -> Result<()> {
        self.established = true;
        Ok(())
    }

    fn handle_record(&mut self, _record: &[u8]) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    fn poll_write(&mut self) -> Option<Bytes> {
        None
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn export_keying_material(&self) -> Result<SrtpKeyingMaterial> {
        Ok(self.keys.clone())
    }
}
