//! PLI coalescing queue.
//!
//! Each subscriber's PLI worker drains a set of SSRCs; set semantics make
//! any number of requests between two drains collapse into one outbound
//! PLI per SSRC. The cooperative worker task lives in the server crate;
//! it parks on its cond-var until `request` signals work.

use std::collections::BTreeSet;

use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::RtcpPacket;

#[derive(Default)]
pub struct PliQueue {
    pending: BTreeSet<u32>,
}

impl PliQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a keyframe request. Returns true when the worker should be
    /// signaled (the set was empty).
    pub fn request(&mut self, media_ssrc: u32) -> bool {
        let was_empty = self.pending.is_empty();
        self.pending.insert(media_ssrc);
        was_empty
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the set into one PLI per SSRC.
    pub fn drain(&mut self, sender_ssrc: u32) -> Vec<RtcpPacket> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .map(|media_ssrc| {
                RtcpPacket::PictureLossIndication(PictureLossIndication {
                    sender_ssrc,
                    media_ssrc,
                })
            })
            .collect()
    }
}
