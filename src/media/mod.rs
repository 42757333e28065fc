//! Media handling
//!
//! FLV tag-body inspection, codec configuration parsing (H.264, H.265,
//! AAC), and the GOP cache that fans one publisher out to many players.
//!
//! The session engine only looks at payload bytes far enough to classify
//! them: sequence header or not, keyframe or not, which codec. Everything
//! deeper is the recorders' and players' business.

pub mod aac;
pub mod flv;
pub mod gop;
pub mod h264;
pub mod hevc;

pub use aac::AudioSpecificConfig;
pub use flv::{AudioCodec, TagView, VideoCodec};
pub use gop::{Cursor, CursorRead, GopCache, Packet, PacketKind};
pub use h264::AvcConfig;
pub use hevc::HevcConfig;
