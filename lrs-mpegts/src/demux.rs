//! Transport stream demultiplexer.
//!
//! Routes 188-byte packets by PID: PAT on 0x0000, the PMT pid the PAT
//! declares, elementary PIDs the PMT declares into PES assembly. Anything
//! else is dropped.

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::collections::HashMap;

use shared::error::{Error, Result};
use shared::util::LogThrottle;

use crate::packet::{TsHeader, TS_PACKET_SIZE};
use crate::pes::PesHeader;
use crate::psi::{Pat, Pmt};
use crate::{packet::AdaptationField, pids, TsCodec};

#[derive(Debug, Clone, PartialEq)]
pub enum TsEvent {
    /// A PMT was (re)parsed; elementary routing is now active.
    ProgramMapped { pmt: Pmt },
    /// One complete PES payload.
    Pes {
        pid: u16,
        codec: Option<TsCodec>,
        dts: u64,
        pts: u64,
        payload: Bytes,
    },
}

struct PesAssembly {
    header: PesHeader,
    payload: BytesMut,
    dts: u64,
    pts: u64,
}

impl PesAssembly {
    /// Expected payload length, when the PES declares one.
    fn expected(&self) -> Option<usize> {
        if self.header.packet_length == 0 {
            None
        } else {
            Some(self.header.packet_length - (self.header.header_len - 6))
        }
    }
}

pub struct TsDemuxer {
    pat: Option<Pat>,
    pmt: Option<Pmt>,
    assemblies: HashMap<u16, PesAssembly>,
    last_cc: HashMap<u16, u8>,
    last_dts: u64,
    last_pts: u64,
    gap_warns: LogThrottle,
    /// Continuity gaps observed; each is a loss.
    pub continuity_gaps: u64,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self {
            pat: None,
            pmt: None,
            assemblies: HashMap::new(),
            last_cc: HashMap::new(),
            last_dts: 0,
            last_pts: 0,
            gap_warns: LogThrottle::new(16),
            continuity_gaps: 0,
        }
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a buffer of back-to-back 188-byte packets.
    pub fn push(&mut self, buf: &[u8]) -> Result<Vec<TsEvent>> {
        if buf.len() % TS_PACKET_SIZE != 0 {
            return Err(Error::BadTsPacketSize(buf.len()));
        }
        let mut events = Vec::new();
        for pkt in buf.chunks_exact(TS_PACKET_SIZE) {
            self.push_packet(pkt, &mut events)?;
        }
        Ok(events)
    }

    fn push_packet(&mut self, pkt: &[u8], events: &mut Vec<TsEvent>) -> Result<()> {
        let header = TsHeader::decode(pkt)?;
        if header.transport_error {
            warn!("ts: transport_error_indicator set on pid {}", header.pid);
            return Ok(());
        }
        if header.pid == pids::NULL {
            return Ok(());
        }

        let mut pos = 4;
        if header.adaptation_control.has_adaptation() {
            let af = AdaptationField::decode(&pkt[4..])?;
            pos += af.byte_len;
        }
        if !header.adaptation_control.has_payload() || pos >= pkt.len() {
            return Ok(());
        }

        // Continuity advances by 1 mod 16 across payload-bearing packets of
        // a PID; same value means a duplicate, anything else is loss.
        if let Some(&last) = self.last_cc.get(&header.pid) {
            let expected = (last + 1) & 0x0F;
            if header.continuity_counter == last {
                debug!("ts: duplicate packet on pid {}", header.pid);
                return Ok(());
            }
            if header.continuity_counter != expected {
                self.continuity_gaps += 1;
                if self.gap_warns.should_log() {
                    warn!(
                        "ts: continuity gap on pid {}: expected {expected}, got {} ({} total)",
                        header.pid, header.continuity_counter, self.continuity_gaps
                    );
                }
                // The partial PES is unusable.
                self.assemblies.remove(&header.pid);
            }
        }
        self.last_cc.insert(header.pid, header.continuity_counter);

        let payload = &pkt[pos..];

        if header.pid == pids::PAT {
            if header.payload_unit_start {
                let pat = Pat::decode(payload)?;
                self.pat = Some(pat);
            }
            return Ok(());
        }

        if let Some(pat) = &self.pat {
            if pat.programs.iter().any(|&(_, pid)| pid == header.pid) {
                if header.payload_unit_start {
                    let pmt = Pmt::decode(payload)?;
                    events.push(TsEvent::ProgramMapped { pmt: pmt.clone() });
                    self.pmt = Some(pmt);
                }
                return Ok(());
            }
        }

        let stream_type = match &self.pmt {
            Some(pmt) => match pmt.streams.iter().find(|s| s.pid == header.pid) {
                Some(s) => s.stream_type,
                None => return Ok(()), // undeclared PID
            },
            None => return Ok(()),
        };

        if header.payload_unit_start {
            // A zero-length video PES terminates at the next PUSI.
            if let Some(done) = self.assemblies.remove(&header.pid) {
                self.deliver(header.pid, stream_type, done, events);
            }
            let pes = PesHeader::parse(payload)?;
            let dts = pes.dts.or(pes.pts).unwrap_or(self.last_dts);
            let pts = pes.pts.unwrap_or(self.last_pts);
            self.last_dts = dts;
            self.last_pts = pts;
            let mut assembly = PesAssembly {
                header: pes,
                payload: BytesMut::new(),
                dts,
                pts,
            };
            assembly
                .payload
                .extend_from_slice(&payload[pes.header_len..]);
            self.maybe_complete(header.pid, stream_type, assembly, events);
        } else if let Some(mut assembly) = self.assemblies.remove(&header.pid) {
            assembly.payload.extend_from_slice(payload);
            self.maybe_complete(header.pid, stream_type, assembly, events);
        }
        // Continuation without an open assembly: leading garbage, dropped.

        Ok(())
    }

    fn maybe_complete(
        &mut self,
        pid: u16,
        stream_type: u8,
        assembly: PesAssembly,
        events: &mut Vec<TsEvent>,
    ) {
        match assembly.expected() {
            Some(expected) if assembly.payload.len() >= expected => {
                self.deliver(pid, stream_type, assembly, events)
            }
            _ => {
                self.assemblies.insert(pid, assembly);
            }
        }
    }

    fn deliver(
        &mut self,
        pid: u16,
        stream_type: u8,
        mut assembly: PesAssembly,
        events: &mut Vec<TsEvent>,
    ) {
        if let Some(expected) = assembly.expected() {
            if assembly.payload.len() > expected {
                assembly.payload.truncate(expected);
            }
        }
        if assembly.payload.is_empty() {
            return;
        }
        events.push(TsEvent::Pes {
            pid,
            codec: TsCodec::from_stream_type(stream_type),
            dts: assembly.dts,
            pts: assembly.pts,
            payload: assembly.payload.freeze(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::TsMuxer;

    #[test]
    fn test_demux_muxed_video_declared_length() {
        let mut mux = TsMuxer::new();
        let payload = Bytes::from(vec![0xABu8; 10_000]);
        let out = mux
            .write_frame(TsCodec::H264, true, 900_000, 900_000, payload.clone())
            .unwrap();

        let mut demux = TsDemuxer::new();
        let events = demux.push(&out).unwrap();
        let pes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TsEvent::Pes { payload, dts, .. } => Some((payload.clone(), *dts)),
                _ => None,
            })
            .collect();
        assert_eq!(pes.len(), 1);
        assert_eq!(pes[0].0, payload);
        assert_eq!(pes[0].1, 900_000);
        assert_eq!(demux.continuity_gaps, 0);
    }

    #[test]
    fn test_demux_zero_length_video_flushes_on_next_pusi() {
        // Payloads past 64KiB force PES_packet_length = 0, which terminates
        // only at the next payload_unit_start on the same PID.
        let mut mux = TsMuxer::new();
        let payload = Bytes::from(vec![0xCDu8; 70_000]);
        let out = mux
            .write_frame(TsCodec::H264, true, 900_000, 900_000, payload.clone())
            .unwrap();

        let mut demux = TsDemuxer::new();
        let mut events = demux.push(&out).unwrap();
        assert!(events
            .iter()
            .all(|e| !matches!(e, TsEvent::Pes { .. })));

        let out2 = mux
            .write_frame(TsCodec::H264, false, 903_600, 903_600, Bytes::from_static(&[1, 2, 3]))
            .unwrap();
        events.extend(demux.push(&out2).unwrap());

        let pes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TsEvent::Pes { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(pes.len(), 2);
        assert_eq!(pes[0], payload);
        assert_eq!(&pes[1][..], &[1, 2, 3]);
    }

    #[test]
    fn test_demux_audio_declared_length() {
        let mut mux = TsMuxer::new();
        mux.set_codecs(None, Some(TsCodec::Aac));
        let payload = Bytes::from(vec![0x55u8; 300]);
        let out = mux
            .write_frame(TsCodec::Aac, false, 90_000, 90_000, payload.clone())
            .unwrap();

        let mut demux = TsDemuxer::new();
        let events = demux.push(&out).unwrap();
        let pes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TsEvent::Pes { payload, codec, .. } => Some((payload.clone(), *codec)),
                _ => None,
            })
            .collect();
        // Audio PES declares its length, so it completes without a flush.
        assert_eq!(pes.len(), 1);
        assert_eq!(pes[0].0, payload);
        assert_eq!(pes[0].1, Some(TsCodec::Aac));
    }

    #[test]
    fn test_bad_sync_rejected() {
        let mut demux = TsDemuxer::new();
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = 0x46;
        assert_eq!(demux.push(&pkt), Err(Error::BadSync(0x46)));
    }

    #[test]
    fn test_odd_length_rejected() {
        let mut demux = TsDemuxer::new();
        assert_eq!(
            demux.push(&[0x47, 0, 0]),
            Err(Error::BadTsPacketSize(3))
        );
    }
}
