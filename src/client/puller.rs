//! Relay puller
//!
//! Plays a stream from an upstream server and republishes it into the
//! local registry. Local players and recorders see a publisher like any
//! other; its session just happens to read from another server instead
//! of an encoder.
//!
//! Dial failures retry up to `max_attempts` with a fixed delay; once
//! attempts are exhausted the puller returns the last error.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::timeout;

use crate::client::config::RelayConfig;
use crate::client::connector::RtmpConnector;
use crate::error::{Error, Result};
use crate::media::{GopCache, Packet, TagView};
use crate::protocol::message::{encode_data, DataMessage, RtmpMessage};
use crate::protocol::constants::{CMD_ON_METADATA, CMD_SET_DATA_FRAME, DEFAULT_MAX_GOP_COUNT};
use crate::registry::{PublisherHandle, PublisherRegistry, StreamAnchor};

/// Deregisters the relay publisher when the pull ends
struct RelayGuard {
    registry: Arc<PublisherRegistry>,
    anchor: StreamAnchor,
    cache: Arc<GopCache>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.cache.close();
        // relay publishers use session id 0
        self.registry.remove(&self.anchor, 0);
        tracing::info!(anchor = %self.anchor, "Relay publisher deregistered");
    }
}

/// Pulls one upstream stream into the local registry
pub struct RelayPuller {
    config: RelayConfig,
    registry: Arc<PublisherRegistry>,
    max_gop_count: usize,
}

impl RelayPuller {
    pub fn new(config: RelayConfig, registry: Arc<PublisherRegistry>) -> Self {
        Self { config, registry, max_gop_count: DEFAULT_MAX_GOP_COUNT }
    }

    pub fn max_gop_count(mut self, count: usize) -> Self {
        self.max_gop_count = count.max(1);
        self
    }

    /// Anchor the pulled stream is published under locally
    pub fn local_anchor(&self) -> Result<StreamAnchor> {
        let (_, _, app, stream) = self
            .config
            .parse()
            .ok_or_else(|| Error::Config(format!("invalid url {}", self.config.url)))?;
        Ok(StreamAnchor::new(self.config.local_vhost.clone(), app, stream))
    }

    /// Pull until the upstream ends or attempts run out
    pub async fn run(self) -> Result<()> {
        let anchor = self.local_anchor()?;
        let mut last_error = Error::Timeout;

        for attempt in 1..=self.config.max_attempts {
            match RtmpConnector::dial(self.config.clone()).await {
                Ok(connector) => {
                    tracing::info!(url = %self.config.url, attempt = attempt, "Relay connected");
                    return self.consume(connector, &anchor).await;
                }
                Err(e) => {
                    tracing::warn!(url = %self.config.url, attempt = attempt,
                        max_attempts = self.config.max_attempts, error = %e,
                        "Relay dial failed");
                    last_error = e;
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Play the upstream stream and feed the local cache
    async fn consume<S>(&self, mut connector: RtmpConnector<S>, anchor: &StreamAnchor) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        connector.create_stream().await?;
        connector.play().await?;

        let cache = Arc::new(GopCache::with_max_gop_count(self.max_gop_count));
        let handle = Arc::new(PublisherHandle {
            anchor: anchor.clone(),
            session_id: 0,
            cache: Arc::clone(&cache),
            started_at: Instant::now(),
        });
        if !self.registry.insert_if_absent(handle) {
            return Err(Error::PublishConflict(anchor.to_string()));
        }
        let _guard = RelayGuard {
            registry: Arc::clone(&self.registry),
            anchor: anchor.clone(),
            cache: Arc::clone(&cache),
        };

        tracing::info!(anchor = %anchor, "Relay publishing locally");

        loop {
            let msg = match timeout(self.config.read_timeout, connector.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(Error::ConnectionClosed)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::Timeout),
            };

            match msg {
                RtmpMessage::Audio { timestamp, data } => {
                    if data.is_empty() {
                        continue;
                    }
                    let tag = TagView::Audio(data.clone());
                    let is_header = tag.is_audio_sequence_header();
                    cache.push(Packet::audio(timestamp, data, is_header));
                }
                RtmpMessage::Video { timestamp, data } => {
                    if data.is_empty() {
                        continue;
                    }
                    let tag = TagView::Video(data.clone());
                    cache.push(Packet::video(
                        timestamp,
                        data,
                        tag.is_keyframe(),
                        tag.is_video_sequence_header(),
                    ));
                }
                RtmpMessage::Data(data) => {
                    if data.name == CMD_SET_DATA_FRAME || data.name == CMD_ON_METADATA {
                        let values = if data.name == CMD_SET_DATA_FRAME {
                            data.values
                                .iter()
                                .skip_while(|v| v.as_str() == Some(CMD_ON_METADATA))
                                .cloned()
                                .collect()
                        } else {
                            data.values.clone()
                        };
                        let replay = DataMessage {
                            name: CMD_ON_METADATA.to_string(),
                            values,
                            stream_id: data.stream_id,
                        };
                        cache.push(Packet::metadata(encode_data(&replay)));
                    }
                }
                RtmpMessage::UserControl(_) | RtmpMessage::Command(_) => {}
                other => {
                    tracing::trace!(message = ?other, "Relay ignoring message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_anchor() {
        let registry = Arc::new(PublisherRegistry::new());
        let puller =
            RelayPuller::new(RelayConfig::new("rtmp://up.example.com/live/feed"), registry);
        let anchor = puller.local_anchor().unwrap();
        assert_eq!(anchor.to_string(), "localhost/live/feed");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let registry = Arc::new(PublisherRegistry::new());
        let puller = RelayPuller::new(RelayConfig::new("not-a-url"), registry);
        assert!(puller.local_anchor().is_err());
    }

    #[tokio::test]
    async fn test_bounded_retries() {
        // closed port: every dial fails fast; the puller must give up
        // after max_attempts rather than loop forever
        let registry = Arc::new(PublisherRegistry::new());
        let config = RelayConfig::new("rtmp://127.0.0.1:1/live/feed")
            .max_attempts(2);
        let mut config = config;
        config.retry_delay = std::time::Duration::from_millis(10);
        config.connect_timeout = std::time::Duration::from_secs(2);

        let started = std::time::Instant::now();
        let result = RelayPuller::new(config, registry).run().await;
        assert!(result.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
