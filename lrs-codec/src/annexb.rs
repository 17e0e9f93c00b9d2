//! Annex-B elementary stream scanning.

use bytes::Bytes;
use memchr::memchr_iter;

/// H264NalUnitType is the type of a NAL
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum H264NaluType {
    /// Unspecified
    #[default]
    Unspecified = 0,
    /// Coded slice of a non-IDR picture
    CodedSliceNonIdr = 1,
    /// Coded slice of an IDR picture
    CodedSliceIdr = 5,
    /// Supplemental enhancement information (SEI)
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// Filler data
    Filler = 12,
    /// Everything else
    Other,
}

impl From<u8> for H264NaluType {
    fn from(v: u8) -> Self {
        match v {
            0 => H264NaluType::Unspecified,
            1 => H264NaluType::CodedSliceNonIdr,
            5 => H264NaluType::CodedSliceIdr,
            6 => H264NaluType::Sei,
            7 => H264NaluType::Sps,
            8 => H264NaluType::Pps,
            9 => H264NaluType::Aud,
            12 => H264NaluType::Filler,
            _ => H264NaluType::Other,
        }
    }
}

/// Subset of H.265 NAL types the relay cares about (ITU-T H.265 Table 7-1).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum H265NaluType {
    #[default]
    TrailN = 0,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    Vps = 32,
    Sps = 33,
    Pps = 34,
    Aud = 35,
    Filler = 38,
    PrefixSei = 39,
    SuffixSei = 40,
    Other,
}

impl From<u8> for H265NaluType {
    fn from(v: u8) -> Self {
        match v {
            0 => H265NaluType::TrailN,
            19 => H265NaluType::IdrWRadl,
            20 => H265NaluType::IdrNLp,
            21 => H265NaluType::CraNut,
            32 => H265NaluType::Vps,
            33 => H265NaluType::Sps,
            34 => H265NaluType::Pps,
            35 => H265NaluType::Aud,
            38 => H265NaluType::Filler,
            39 => H265NaluType::PrefixSei,
            40 => H265NaluType::SuffixSei,
            _ => H265NaluType::Other,
        }
    }
}

/// Which codec the scanner classifies NAL headers for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NaluCodec {
    H264,
    H265,
}

/// One NAL unit, without its start code.
#[derive(Debug, Clone, PartialEq)]
pub struct Nalu {
    pub data: Bytes,
}

impl Nalu {
    pub fn h264_type(&self) -> H264NaluType {
        H264NaluType::from(self.data.first().map_or(0, |b| b & 0x1F))
    }

    pub fn h265_type(&self) -> H265NaluType {
        H265NaluType::from(self.data.first().map_or(0, |b| (b >> 1) & 0x3F))
    }

    pub fn is_h264_keyframe(&self) -> bool {
        self.h264_type() == H264NaluType::CodedSliceIdr
    }

    pub fn is_h265_keyframe(&self) -> bool {
        matches!(
            self.h265_type(),
            H265NaluType::IdrWRadl | H265NaluType::IdrNLp | H265NaluType::CraNut
        )
    }
}

/// Splits an annex-B buffer into NAL units on 3- or 4-byte start codes,
/// dropping AUD and filler units and, when `sei_filter` is set, SEI.
pub struct NaluScanner {
    codec: NaluCodec,
    sei_filter: bool,
}

impl NaluScanner {
    pub fn new(codec: NaluCodec, sei_filter: bool) -> Self {
        Self { codec, sei_filter }
    }

    pub fn split(&self, buf: &Bytes) -> Vec<Nalu> {
        let mut nalus = Vec::new();
        let mut starts: Vec<(usize, usize)> = Vec::new(); // (payload offset, code len)

        for pos in memchr_iter(1, buf) {
            if pos >= 2 && buf[pos - 1] == 0 && buf[pos - 2] == 0 {
                let code_len = if pos >= 3 && buf[pos - 3] == 0 { 4 } else { 3 };
                starts.push((pos + 1, code_len));
            }
        }

        for (i, &(start, _)) in starts.iter().enumerate() {
            let end = match starts.get(i + 1) {
                Some(&(next_start, next_code)) => next_start - next_code,
                None => buf.len(),
            };
            if end <= start {
                continue;
            }
            let nalu = Nalu {
                data: buf.slice(start..end),
            };
            if self.keep(&nalu) {
                nalus.push(nalu);
            }
        }

        nalus
    }

    fn keep(&self, nalu: &Nalu) -> bool {
        match self.codec {
            NaluCodec::H264 => match nalu.h264_type() {
                H264NaluType::Aud | H264NaluType::Filler => false,
                H264NaluType::Sei => !self.sei_filter,
                _ => true,
            },
            NaluCodec::H265 => match nalu.h265_type() {
                H265NaluType::Aud | H265NaluType::Filler => false,
                H265NaluType::PrefixSei | H265NaluType::SuffixSei => !self.sei_filter,
                _ => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use bytes::BytesMut;

    fn annexb(units: &[&[u8]]) -> Bytes {
        let mut b = BytesMut::new();
        for (i, u) in units.iter().enumerate() {
            if i == 0 {
                b.put_slice(&[0, 0, 0, 1]);
            } else {
                b.put_slice(&[0, 0, 1]);
            }
            b.put_slice(u);
        }
        b.freeze()
    }

    #[test]
    fn test_split_mixed_start_codes() {
        let sps = [0x67u8, 0x42, 0xE0, 0x1F];
        let pps = [0x68u8, 0xCE, 0x38, 0x80];
        let idr = [0x65u8, 0x88, 0x84, 0x00];
        let buf = annexb(&[&sps, &pps, &idr]);

        let scanner = NaluScanner::new(NaluCodec::H264, false);
        let nalus = scanner.split(&buf);
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalus[0].h264_type(), H264NaluType::Sps);
        assert_eq!(nalus[1].h264_type(), H264NaluType::Pps);
        assert_eq!(nalus[2].h264_type(), H264NaluType::CodedSliceIdr);
        assert!(nalus[2].is_h264_keyframe());
        assert_eq!(&nalus[0].data[..], &sps[..]);
    }

    #[test]
    fn test_aud_and_filler_dropped() {
        let aud = [0x09u8, 0xF0];
        let filler = [0x0Cu8, 0xFF, 0xFF];
        let slice = [0x41u8, 0x9A];
        let buf = annexb(&[&aud, &slice, &filler]);

        let nalus = NaluScanner::new(NaluCodec::H264, false).split(&buf);
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].h264_type(), H264NaluType::CodedSliceNonIdr);
    }

    #[test]
    fn test_sei_filter_toggle() {
        let sei = [0x06u8, 0x05, 0x01, 0x00];
        let idr = [0x65u8, 0x00];
        let buf = annexb(&[&sei, &idr]);

        assert_eq!(NaluScanner::new(NaluCodec::H264, true).split(&buf).len(), 1);
        assert_eq!(NaluScanner::new(NaluCodec::H264, false).split(&buf).len(), 2);
    }

    #[test]
    fn test_h265_classification() {
        // nal_unit_type lives in bits 6..1 of the first byte.
        let idr = [(19u8 << 1), 0x01, 0xAA];
        let buf = annexb(&[&idr]);
        let nalus = NaluScanner::new(NaluCodec::H265, false).split(&buf);
        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].h265_type(), H265NaluType::IdrWRadl);
        assert!(nalus[0].is_h265_keyframe());
    }

    #[test]
    fn test_no_start_code_yields_nothing() {
        let buf = Bytes::from_static(&[0x65, 0x00, 0x01, 0x02]);
        assert!(NaluScanner::new(NaluCodec::H264, false).split(&buf).is_empty());
    }
}
