#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod description;
pub mod negotiate;

pub use description::{Direction, MediaDescription, MediaKind, PayloadDesc, SessionDescription};
pub use negotiate::{negotiate, LocalPolicy, MediaTrackDesc, TrackCodec};
