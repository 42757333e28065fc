//! RTMP URL grammar
//!
//! `rtmp://host[:port]/app[?vhost=V]/stream[?query]`
//!
//! The `vhost` query parameter — in the app segment of the tcUrl or in
//! the stream name — overrides the URL host for anchor computation, so
//! one ingest endpoint can serve many virtual hosts:
//!
//! ```text
//! rtmp://127.0.0.1/live?vhost=cdn.example.com/talk
//!   → anchor cdn.example.com/live/talk
//! ```

use crate::registry::StreamAnchor;

/// Parsed publish/play target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub vhost: String,
    pub app: String,
    /// Stream name with its query stripped
    pub stream: String,
    /// Query string following the stream name, if any
    pub query: Option<String>,
}

impl StreamTarget {
    /// Combine a connect-time tcUrl/app with a publish/play stream name
    pub fn resolve(tc_url: Option<&str>, app: &str, stream_name: &str) -> Self {
        let mut vhost = tc_url.and_then(host_of).unwrap_or_default();

        // vhost override in the app segment (`live?vhost=...`)
        let (app, app_query) = split_query(app);
        if let Some(v) = query_param(app_query, "vhost") {
            vhost = v.to_string();
        }

        // stream query may carry a vhost override too
        let (stream, stream_query) = split_query(stream_name);
        if let Some(v) = query_param(stream_query, "vhost") {
            vhost = v.to_string();
        }

        if vhost.is_empty() {
            vhost = "localhost".to_string();
        }

        Self {
            vhost,
            app: app.to_string(),
            stream: stream.to_string(),
            query: stream_query.map(|q| q.to_string()),
        }
    }

    pub fn anchor(&self) -> StreamAnchor {
        StreamAnchor::new(self.vhost.clone(), self.app.clone(), self.stream.clone())
    }
}

/// Host (without port) of an rtmp:// URL
fn host_of(url: &str) -> Option<String> {
    let rest = url.strip_prefix("rtmp://")?;
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Split `name?query` into (name, Some(query))
fn split_query(s: &str) -> (&str, Option<&str>) {
    match s.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (s, None),
    }
}

/// Value of `key` in a `k=v&k2=v2` query
fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Split an rtmp URL into (host, port, app, stream) for outbound dials
pub fn parse_url(url: &str) -> Option<(String, u16, String, String)> {
    let rest = url.strip_prefix("rtmp://")?;
    let (host_port, path) = rest.split_once('/')?;
    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (host_port.to_string(), crate::protocol::constants::RTMP_PORT),
    };
    let (app, stream) = path.split_once('/')?;
    if host.is_empty() || app.is_empty() || stream.is_empty() {
        return None;
    }
    Some((host, port, app.to_string(), stream.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_target() {
        let t = StreamTarget::resolve(Some("rtmp://cdn.example.com/live"), "live", "talk");
        assert_eq!(t.vhost, "cdn.example.com");
        assert_eq!(t.app, "live");
        assert_eq!(t.stream, "talk");
        assert_eq!(t.anchor().to_string(), "cdn.example.com/live/talk");
    }

    #[test]
    fn test_vhost_in_app_segment() {
        let t = StreamTarget::resolve(
            Some("rtmp://127.0.0.1/live?vhost=cdn.example.com"),
            "live?vhost=cdn.example.com",
            "talk",
        );
        assert_eq!(t.vhost, "cdn.example.com");
        assert_eq!(t.app, "live");
        assert_eq!(t.anchor().to_string(), "cdn.example.com/live/talk");
    }

    #[test]
    fn test_vhost_in_stream_query() {
        let t = StreamTarget::resolve(Some("rtmp://127.0.0.1/live"), "live", "talk?vhost=v.example.com&token=abc");
        assert_eq!(t.vhost, "v.example.com");
        assert_eq!(t.stream, "talk");
        assert_eq!(t.query.as_deref(), Some("vhost=v.example.com&token=abc"));
    }

    #[test]
    fn test_port_stripped_from_vhost() {
        let t = StreamTarget::resolve(Some("rtmp://example.com:1936/live"), "live", "a");
        assert_eq!(t.vhost, "example.com");
    }

    #[test]
    fn test_missing_tcurl_defaults_localhost() {
        let t = StreamTarget::resolve(None, "live", "a");
        assert_eq!(t.vhost, "localhost");
    }

    #[test]
    fn test_parse_url() {
        let (host, port, app, stream) = parse_url("rtmp://upstream.example.com/live/feed").unwrap();
        assert_eq!(host, "upstream.example.com");
        assert_eq!(port, 1935);
        assert_eq!(app, "live");
        assert_eq!(stream, "feed");

        let (host, port, ..) = parse_url("rtmp://10.0.0.1:1936/live/feed").unwrap();
        assert_eq!(host, "10.0.0.1");
        assert_eq!(port, 1936);

        assert!(parse_url("http://example.com/live/feed").is_none());
        assert!(parse_url("rtmp://example.com/live").is_none());
    }
}
