//! Compound RTCP datagram (de)multiplexing.

use bytes::{Bytes, BytesMut};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::extended_report::ExtendedReport;
use crate::goodbye::Goodbye;
use crate::header::{packet_type, Header, FORMAT_NACK, FORMAT_PLI, FORMAT_TWCC, HEADER_LENGTH};
use crate::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;
use crate::source_description::SourceDescription;
use crate::transport_feedbacks::transport_layer_cc::TransportLayerCc;
use crate::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use crate::RtcpPacket;

/// Decodes a compound datagram into its packets, preserving order.
///
/// A malformed element poisons the whole datagram; callers drop it and
/// keep the session (ProtocolMalformed policy).
pub fn decode(data: &Bytes) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < HEADER_LENGTH {
            return Err(Error::BadRtcpLength);
        }
        let mut head = data.slice(pos..pos + HEADER_LENGTH);
        let header = Header::unmarshal(&mut head)?;
        let total = HEADER_LENGTH + header.body_len();
        if data.len() - pos < total {
            return Err(Error::BadRtcpLength);
        }
        let mut body = data.slice(pos + HEADER_LENGTH..pos + total);

        let packet = match (header.packet_type, header.count) {
            (packet_type::SENDER_REPORT, _) => {
                RtcpPacket::SenderReport(SenderReport::unmarshal_body(&mut body, header)?)
            }
            (packet_type::RECEIVER_REPORT, _) => {
                RtcpPacket::ReceiverReport(ReceiverReport::unmarshal_body(&mut body, header)?)
            }
            (packet_type::SOURCE_DESCRIPTION, _) => RtcpPacket::SourceDescription(
                SourceDescription::unmarshal_body(&mut body, header)?,
            ),
            (packet_type::GOODBYE, _) => {
                RtcpPacket::Goodbye(Goodbye::unmarshal_body(&mut body, header)?)
            }
            (packet_type::TRANSPORT_FEEDBACK, FORMAT_NACK) => RtcpPacket::TransportLayerNack(
                TransportLayerNack::unmarshal_body(&mut body, header)?,
            ),
            (packet_type::TRANSPORT_FEEDBACK, FORMAT_TWCC) => {
                RtcpPacket::TransportLayerCc(TransportLayerCc::unmarshal_body(&mut body, header)?)
            }
            (packet_type::PAYLOAD_FEEDBACK, FORMAT_PLI) => RtcpPacket::PictureLossIndication(
                PictureLossIndication::unmarshal_body(&mut body, header)?,
            ),
            (packet_type::EXTENDED_REPORT, _) => {
                RtcpPacket::ExtendedReport(ExtendedReport::unmarshal_body(&mut body, header)?)
            }
            // APP, REMB and anything else ride through untouched.
            _ => RtcpPacket::Raw {
                header,
                body: data.slice(pos + HEADER_LENGTH..pos + total),
            },
        };
        packets.push(packet);
        pos += total;
    }
    if packets.is_empty() {
        return Err(Error::EmptyCompound);
    }
    Ok(packets)
}

/// Encodes packets back into one compound datagram, preserving order.
pub fn encode(packets: &[RtcpPacket]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for p in packets {
        let bytes = match p {
            RtcpPacket::SenderReport(x) => x.marshal()?,
            RtcpPacket::ReceiverReport(x) => x.marshal()?,
            RtcpPacket::SourceDescription(x) => x.marshal()?,
            RtcpPacket::Goodbye(x) => x.marshal()?,
            RtcpPacket::TransportLayerNack(x) => x.marshal()?,
            RtcpPacket::TransportLayerCc(x) => x.marshal()?,
            RtcpPacket::PictureLossIndication(x) => x.marshal()?,
            RtcpPacket::ExtendedReport(x) => x.marshal()?,
            RtcpPacket::Raw { header, body } => {
                let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len());
                buf.resize(HEADER_LENGTH, 0);
                header.marshal_to(&mut buf)?;
                buf.extend_from_slice(body);
                buf.freeze()
            }
        };
        out.extend_from_slice(&bytes);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reception_report::ReceptionReport;
    use crate::transport_feedbacks::transport_layer_nack::NackPair;

    #[test]
    fn test_compound_round_trip_preserves_set_and_order() {
        let packets = vec![
            RtcpPacket::ReceiverReport(ReceiverReport {
                ssrc: 1,
                reports: vec![ReceptionReport {
                    ssrc: 2,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            RtcpPacket::TransportLayerNack(TransportLayerNack {
                sender_ssrc: 1,
                media_ssrc: 2,
                nacks: vec![NackPair {
                    packet_id: 102,
                    lost_packets: 0,
                }],
            }),
            RtcpPacket::PictureLossIndication(PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
            }),
        ];
        let wire = encode(&packets).unwrap();
        let got = decode(&wire).unwrap();
        assert_eq!(got, packets);
    }

    #[test]
    fn test_unknown_type_survives_round_trip() {
        let app = RtcpPacket::Raw {
            header: Header {
                padding: false,
                count: 0,
                packet_type: packet_type::APP,
                length: 2,
            },
            body: Bytes::from_static(&[0, 0, 0, 1, b'n', b'a', b'm', b'e']),
        };
        let wire = encode(std::slice::from_ref(&app)).unwrap();
        let got = decode(&wire).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], app);
    }

    #[test]
    fn test_truncated_compound_rejected() {
        let pli = RtcpPacket::PictureLossIndication(PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 2,
        });
        let wire = encode(std::slice::from_ref(&pli)).unwrap();
        assert_eq!(
            decode(&wire.slice(..wire.len() - 1)),
            Err(Error::BadRtcpLength)
        );
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(decode(&Bytes::new()), Err(Error::EmptyCompound));
    }

    #[test]
    fn test_remb_kept_raw() {
        // PSFB with FMT=15 is REMB; the relay ignores it but must not
        // drop it from the compound.
        let remb = RtcpPacket::Raw {
            header: Header {
                padding: false,
                count: 15,
                packet_type: packet_type::PAYLOAD_FEEDBACK,
                length: 2,
            },
            body: Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 2]),
        };
        let wire = encode(std::slice::from_ref(&remb)).unwrap();
        let got = decode(&wire).unwrap();
        assert_eq!(got[0], remb);
    }
}
