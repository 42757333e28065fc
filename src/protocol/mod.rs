//! RTMP wire protocol implementation
//!
//! Handshake (C0C1C2/S0S1S2 exchange), chunk stream multiplexing and
//! reassembly, message framing.

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use handshake::{Handshake, HandshakeRole};
pub use message::RtmpMessage;
