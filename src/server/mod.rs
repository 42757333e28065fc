//! RTMP server
//!
//! Accept loops (TCP and UNIX-domain), the per-connection session driver,
//! and the configuration the core consumes.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{AppConfig, ServerConfig};
pub use listener::RtmpServer;
