#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod adts;
pub mod amf0;
pub mod annexb;
pub mod reader;

pub use adts::AdtsHeader;
pub use amf0::Amf0Value;
pub use annexb::{H264NaluType, H265NaluType, NaluScanner};
pub use reader::{BytesReader, BytesWriter};
