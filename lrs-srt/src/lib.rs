#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod bridge;
pub mod mix;
pub mod streamid;

pub use bridge::{FlvTag, TagKind, Ts2FlvBridge};
pub use mix::MixCorrectQueue;
pub use streamid::{SrtMode, SrtRoute};
