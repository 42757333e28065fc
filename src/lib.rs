//! rtmpd: an RTMP ingest and distribution server
//!
//! Publishers push live audio/video over RTMP; players pull the same
//! streams. One publisher fans out to any number of players through a
//! per-publisher GOP cache — the publisher writes each packet once,
//! every player owns a cursor into the ring, and `bytes::Bytes`
//! reference counting keeps payloads shared rather than copied. Slow
//! players fall behind, get resynchronised at the next keyframe, and
//! never make the server buffer unboundedly.
//!
//! # Example: serve publishers and players
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtmpd::{RtmpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::with_addr("0.0.0.0:1935");
//!     let server = Arc::new(RtmpServer::new(config));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Publish with ffmpeg (`-f flv rtmp://localhost/live/test`), play with
//! ffplay (`rtmp://localhost/live/test`).

pub mod amf;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;

pub use client::{RelayConfig, RelayPuller};
pub use error::{Error, Result};
pub use registry::{PublisherRegistry, StreamAnchor};
pub use server::{AppConfig, RtmpServer, ServerConfig};
pub use sink::PacketSink;
