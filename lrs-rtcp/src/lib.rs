#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod compound;
pub mod extended_report;
pub mod goodbye;
pub mod header;
pub mod payload_feedbacks;
pub mod receiver_report;
pub mod reception_report;
pub mod sender_report;
pub mod source_description;
pub mod transport_feedbacks;

use bytes::Bytes;

use extended_report::ExtendedReport;
use goodbye::Goodbye;
use header::Header;
use payload_feedbacks::picture_loss_indication::PictureLossIndication;
use receiver_report::ReceiverReport;
use sender_report::SenderReport;
use source_description::SourceDescription;
use transport_feedbacks::transport_layer_cc::TransportLayerCc;
use transport_feedbacks::transport_layer_nack::TransportLayerNack;

/// One RTCP packet out of a compound datagram.
///
/// Types the session does not act on (SDES, BYE are parsed for logging;
/// APP, REMB and other unhandled formats are retained raw) survive a
/// decode/encode round trip in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
    TransportLayerNack(TransportLayerNack),
    TransportLayerCc(TransportLayerCc),
    PictureLossIndication(PictureLossIndication),
    ExtendedReport(ExtendedReport),
    /// Anything else, kept verbatim (header + body).
    Raw { header: Header, body: Bytes },
}
