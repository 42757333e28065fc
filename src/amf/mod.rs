//! AMF (Action Message Format) implementation
//!
//! AMF0 is the binary serialization used by RTMP command and data
//! messages. AMF3 payloads (message types 0x11/0x0F) are carried inside an
//! AMF0 envelope; this server strips the envelope marker and answers in
//! AMF0, which every known encoder accepts.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::AmfValue;
