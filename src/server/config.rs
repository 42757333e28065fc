//! Server configuration
//!
//! The core never reads config files; an external loader builds these
//! structs and the server treats them as immutable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::constants::*;
use crate::sink::PacketSink;

/// Per-application options
#[derive(Clone)]
pub struct AppConfig {
    /// Complete GOPs retained besides the one in progress
    pub max_gop_count: usize,

    /// Consecutive audio packets a player receives with no interleaved
    /// video before its cursor holds for video; 0 disables the hold
    pub audio_after_video_limit: u32,

    /// Recorder factories; each publish gets one sink per factory
    pub sink_factories: Vec<Arc<dyn Fn(&str) -> Arc<dyn PacketSink> + Send + Sync>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_gop_count: DEFAULT_MAX_GOP_COUNT,
            audio_after_video_limit: DEFAULT_AUDIO_AFTER_VIDEO_LIMIT,
            sink_factories: Vec::new(),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("max_gop_count", &self.max_gop_count)
            .field("audio_after_video_limit", &self.audio_after_video_limit)
            .field("sink_factories", &self.sink_factories.len())
            .finish()
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen addresses: `host:port` for TCP, a leading `/` means a
    /// UNIX-domain socket path
    pub listen_addrs: Vec<String>,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Chunk size negotiated outbound
    pub chunk_size: u32,

    /// Window acknowledgement size announced to peers
    pub window_ack_size: u32,

    /// Peer bandwidth announced to peers
    pub peer_bandwidth: u32,

    /// Handshake must complete within this
    pub handshake_timeout: Duration,

    /// Socket read inactivity limit
    pub read_timeout: Duration,

    /// TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// Buffered reader/writer capacity
    pub buffer_size: usize,

    /// Per-app options; the default entry applies to unlisted apps
    pub apps: HashMap<String, AppConfig>,

    /// Fallback for apps without an entry in `apps`
    pub default_app: AppConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![format!("0.0.0.0:{}", RTMP_PORT)],
            max_connections: 0,
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            tcp_nodelay: true,
            buffer_size: 64 * 1024,
            apps: HashMap::new(),
            default_app: AppConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Listen on one address only
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self { listen_addrs: vec![addr.into()], ..Default::default() }
    }

    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen_addrs.push(addr.into());
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn app(mut self, name: impl Into<String>, config: AppConfig) -> Self {
        self.apps.insert(name.into(), config);
        self
    }

    /// Options for an app name, falling back to the default entry
    pub fn app_config(&self, app: &str) -> &AppConfig {
        self.apps.get(app).unwrap_or(&self.default_app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addrs, vec!["0.0.0.0:1935".to_string()]);
        assert_eq!(config.chunk_size, RECOMMENDED_CHUNK_SIZE);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.default_app.max_gop_count, 2);
        assert_eq!(config.default_app.audio_after_video_limit, 115);
    }

    #[test]
    fn test_app_config_fallback() {
        let config = ServerConfig::default().app(
            "vod",
            AppConfig { max_gop_count: 4, ..AppConfig::default() },
        );
        assert_eq!(config.app_config("vod").max_gop_count, 4);
        assert_eq!(config.app_config("live").max_gop_count, 2);
    }

    #[test]
    fn test_chunk_size_clamped() {
        let config = ServerConfig::default().chunk_size(10_000_000);
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }
}
