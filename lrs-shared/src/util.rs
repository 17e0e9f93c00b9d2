// match_range is a MatchFunc that accepts packets with the first byte in [lower..upper]
fn match_range(lower: u8, upper: u8, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let b = buf[0];
    b >= lower && b <= upper
}

/// MatchFuncs as described in RFC7983
/// <https://tools.ietf.org/html/rfc7983>
///              +----------------+
///              |        [0..3] -+--> forward to STUN
///              |                |
///              |      [20..63] -+--> forward to DTLS
///              |                |
///  packet -->  |    [128..191] -+--> forward to RTP/RTCP
///              +----------------+
pub fn match_stun(buf: &[u8]) -> bool {
    match_range(0, 3, buf)
}

/// match_dtls accepts packets with the first byte in [20..63]
pub fn match_dtls(buf: &[u8]) -> bool {
    match_range(20, 63, buf)
}

/// match_srtp_or_srtcp accepts packets with the first byte in [128..191]
pub fn match_srtp_or_srtcp(buf: &[u8]) -> bool {
    match_range(128, 191, buf)
}

/// RTCP is distinguished from RTP by its packet type byte [RFC 5761].
pub fn is_rtcp(buf: &[u8]) -> bool {
    // Not long enough to determine RTP/RTCP
    if buf.len() < 4 {
        return false;
    }

    let rtcp_packet_type = buf[1];
    (192..=223).contains(&rtcp_packet_type)
}

/// match_srtp only matches SRTP and not SRTCP
pub fn match_srtp(buf: &[u8]) -> bool {
    match_srtp_or_srtcp(buf) && !is_rtcp(buf)
}

/// match_srtcp only matches SRTCP and not SRTP
pub fn match_srtcp(buf: &[u8]) -> bool {
    match_srtp_or_srtcp(buf) && is_rtcp(buf)
}

/// Token counter for rate-limiting repetitive warn logs: passes the
/// first N occurrences, then every Nth.
#[derive(Debug)]
pub struct LogThrottle {
    every: u64,
    count: u64,
}

impl LogThrottle {
    pub fn new(every: u64) -> Self {
        Self { every, count: 0 }
    }

    pub fn should_log(&mut self) -> bool {
        self.count += 1;
        self.count <= self.every || self.count % self.every == 0
    }

    pub fn occurrences(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttle() {
        let mut t = LogThrottle::new(3);
        let fired: Vec<bool> = (0..9).map(|_| t.should_log()).collect();
        assert_eq!(
            fired,
            vec![true, true, true, false, false, true, false, false, true]
        );
        assert_eq!(t.occurrences(), 9);
    }

    #[test]
    fn test_demux_ranges() {
        assert!(match_stun(&[0x00, 0x01]));
        assert!(!match_stun(&[]));
        assert!(match_dtls(&[22, 254, 253]));
        assert!(match_srtp_or_srtcp(&[0x80, 96, 0, 0]));
        assert!(match_srtp(&[0x80, 96, 0, 0]));
        assert!(match_srtcp(&[0x80, 200, 0, 6]));
        assert!(!match_srtp(&[0x80, 200, 0, 6]));
    }
}
