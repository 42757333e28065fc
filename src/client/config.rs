//! Relay configuration

use std::time::Duration;

use crate::session::url::parse_url;

/// Configuration for one relay pull
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream URL: `rtmp://host[:port]/app/stream`
    pub url: String,

    /// Local anchor the pulled stream is published under; when empty the
    /// upstream app/stream with vhost "localhost" is used
    pub local_vhost: String,

    /// Dial attempts before giving up; never infinite
    pub max_attempts: u32,

    /// Pause between attempts
    pub retry_delay: Duration,

    /// Dial + handshake deadline
    pub connect_timeout: Duration,

    /// Upstream read inactivity limit
    pub read_timeout: Duration,

    /// Flash version string announced upstream
    pub flash_ver: String,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_vhost: "localhost".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            flash_ver: "LNX 9,0,124,2".to_string(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// (host, port, app, stream) of the upstream URL
    pub fn parse(&self) -> Option<(String, u16, String, String)> {
        parse_url(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config = RelayConfig::new("rtmp://upstream:1936/live/feed");
        let (host, port, app, stream) = config.parse().unwrap();
        assert_eq!(host, "upstream");
        assert_eq!(port, 1936);
        assert_eq!(app, "live");
        assert_eq!(stream, "feed");
    }

    #[test]
    fn test_attempts_never_zero() {
        let config = RelayConfig::new("rtmp://h/a/s").max_attempts(0);
        assert_eq!(config.max_attempts, 1);
    }
}
