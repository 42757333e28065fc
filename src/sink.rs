//! Downstream packet sinks
//!
//! Recorders (FLV files, HLS segmenters, anything that wants the raw tag
//! stream) attach to a publisher through this trait. The session engine
//! appends every ingested packet to every attached sink; a sink that
//! errors is detached and the session carries on.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::media::Packet;

/// Append interface for downstream consumers of a publisher's packets
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    /// Short name for log lines
    fn name(&self) -> &str;

    /// Receive one packet. An error detaches this sink.
    async fn append(&self, packet: &Packet) -> Result<()>;

    /// The publisher ended; flush and release resources
    async fn finish(&self) {}
}

/// Sink list owned by a publishing session
///
/// Append is sequential within the publisher task; no locking is needed
/// beyond the `Arc`s themselves.
pub struct SinkSet {
    sinks: Vec<Arc<dyn PacketSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn PacketSink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Fan a packet out to every sink, detaching the ones that fail
    pub async fn append(&mut self, packet: &Packet) {
        if self.sinks.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        for (i, sink) in self.sinks.iter().enumerate() {
            if let Err(e) = sink.append(packet).await {
                tracing::warn!(sink = sink.name(), error = %e, "Sink failed, detaching");
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            self.sinks.swap_remove(i);
        }
    }

    /// Tell every sink the stream is over
    pub async fn finish(&mut self) {
        for sink in self.sinks.drain(..) {
            sink.finish().await;
        }
    }
}

impl Default for SinkSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        appended: AtomicU32,
        fail_after: u32,
    }

    #[async_trait]
    impl PacketSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn append(&self, _packet: &Packet) -> Result<()> {
            let n = self.appended.fetch_add(1, Ordering::SeqCst);
            if self.fail_after != 0 && n >= self.fail_after {
                return Err(Error::ConnectionClosed);
            }
            Ok(())
        }
    }

    fn packet() -> Packet {
        Packet::audio(0, Bytes::from_static(&[0xAF, 0x01]), false)
    }

    #[tokio::test]
    async fn test_append_reaches_all_sinks() {
        let a = Arc::new(CountingSink { appended: AtomicU32::new(0), fail_after: 0 });
        let b = Arc::new(CountingSink { appended: AtomicU32::new(0), fail_after: 0 });
        let mut set = SinkSet::new(vec![a.clone(), b.clone()]);

        set.append(&packet()).await;
        set.append(&packet()).await;

        assert_eq!(a.appended.load(Ordering::SeqCst), 2);
        assert_eq!(b.appended.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_sink_detaches_others_continue() {
        let flaky = Arc::new(CountingSink { appended: AtomicU32::new(0), fail_after: 1 });
        let steady = Arc::new(CountingSink { appended: AtomicU32::new(0), fail_after: 0 });
        let mut set = SinkSet::new(vec![flaky.clone(), steady.clone()]);

        for _ in 0..5 {
            set.append(&packet()).await;
        }

        // flaky saw two appends (one ok, one failing), then was detached
        assert_eq!(flaky.appended.load(Ordering::SeqCst), 2);
        assert_eq!(steady.appended.load(Ordering::SeqCst), 5);
    }
}
