//! GOP cache and cursor fan-out
//!
//! Each publisher owns one [`GopCache`]: a sequence-numbered ring of the
//! most recent packets, bounded by GOP count, plus the cached codec
//! configuration for joiners. Players never touch the publisher session;
//! they hold an `Arc<GopCache>` and a [`Cursor`] — their own read
//! position. The publisher appends once, every cursor reads
//! independently, and `Bytes` reference counting keeps the payloads
//! shared rather than copied.
//!
//! Ring invariant: the oldest retained packet is a video keyframe (or a
//! cached header directly preceding one) whenever the stream has produced
//! a keyframe at all. Eviction only ever advances the ring start to the
//! next keyframe, so a resynchronising cursor always lands on a decode
//! anchor.
//!
//! A cursor that the ring has overtaken is *lagged*: its next poll
//! returns the cached codec configuration and repositions it at the
//! oldest retained keyframe. Slow players lose continuity, not the
//! connection, and the server's memory stays bounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::protocol::constants::DEFAULT_MAX_GOP_COUNT;

/// Hard packet cap for rings that never see a keyframe (audio-only
/// streams); eviction falls back to oldest-first
const KEYFRAMELESS_PACKET_CAP: usize = 4096;

/// Packet classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Metadata,
}

/// The fan-out unit: one audio/video/metadata message, classified
///
/// Cheap to clone; the payload is reference-counted.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    /// Milliseconds; 32-bit wrap is expected on long-lived streams
    pub timestamp: u32,
    /// Video frame-type nibble said keyframe
    pub is_keyframe: bool,
    /// AVC/HEVC/AAC sequence header
    pub is_sequence_header: bool,
    pub payload: Bytes,
}

impl Packet {
    pub fn video(timestamp: u32, payload: Bytes, is_keyframe: bool, is_sequence_header: bool) -> Self {
        Self { kind: PacketKind::Video, timestamp, is_keyframe, is_sequence_header, payload }
    }

    pub fn audio(timestamp: u32, payload: Bytes, is_sequence_header: bool) -> Self {
        Self {
            kind: PacketKind::Audio,
            timestamp,
            is_keyframe: false,
            is_sequence_header,
            payload,
        }
    }

    pub fn metadata(payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Metadata,
            timestamp: 0,
            is_keyframe: false,
            is_sequence_header: false,
            payload,
        }
    }
}

#[derive(Debug, Default)]
struct Ring {
    packets: VecDeque<Packet>,
    /// Sequence number of `packets.front()`
    base_seq: u64,
    /// Sequence numbers of video keyframes currently retained
    keyframe_seqs: VecDeque<u64>,
    max_gop_count: usize,
    video_header: Option<Packet>,
    audio_header: Option<Packet>,
    metadata: Option<Packet>,
}

impl Ring {
    fn next_seq(&self) -> u64 {
        self.base_seq + self.packets.len() as u64
    }

    /// Drop packets below `target_seq` from the front
    fn evict_to(&mut self, target_seq: u64) {
        while self.base_seq < target_seq {
            if self.packets.pop_front().is_none() {
                break;
            }
            self.base_seq += 1;
        }
        while self.keyframe_seqs.front().is_some_and(|&s| s < self.base_seq) {
            self.keyframe_seqs.pop_front();
        }
    }
}

/// Per-publisher packet ring with sequence-numbered fan-out
pub struct GopCache {
    inner: Mutex<Ring>,
    notify: Notify,
    closed: AtomicBool,
}

impl GopCache {
    pub fn new() -> Self {
        Self::with_max_gop_count(DEFAULT_MAX_GOP_COUNT)
    }

    /// `max_gop_count` complete GOPs are retained besides the in-progress
    /// one
    pub fn with_max_gop_count(max_gop_count: usize) -> Self {
        Self {
            inner: Mutex::new(Ring { max_gop_count: max_gop_count.max(1), ..Ring::default() }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append one packet and wake all blocked cursors
    pub fn push(&self, packet: Packet) {
        {
            let mut ring = self.inner.lock().unwrap();
            let seq = ring.next_seq();

            match packet.kind {
                PacketKind::Metadata => {
                    ring.metadata = Some(packet.clone());
                }
                PacketKind::Video if packet.is_sequence_header => {
                    ring.video_header = Some(packet.clone());
                }
                PacketKind::Audio if packet.is_sequence_header => {
                    ring.audio_header = Some(packet.clone());
                }
                PacketKind::Video if packet.is_keyframe => {
                    if ring.keyframe_seqs.is_empty() {
                        // everything before the first keyframe is undecodable
                        ring.evict_to(seq);
                    }
                    ring.keyframe_seqs.push_back(seq);
                    if ring.keyframe_seqs.len() > ring.max_gop_count + 1 {
                        let target = ring.keyframe_seqs[1];
                        ring.evict_to(target);
                    }
                }
                _ => {
                    if ring.keyframe_seqs.is_empty() && ring.packets.len() >= KEYFRAMELESS_PACKET_CAP {
                        let target = ring.base_seq + 1;
                        ring.evict_to(target);
                    }
                }
            }

            ring.packets.push_back(packet);
        }
        self.notify.notify_waiters();
    }

    /// Mark the publisher gone; cursors drain what is retained, then see
    /// [`CursorRead::Closed`]
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current write sequence (the seq the next packet will take)
    pub fn write_seq(&self) -> u64 {
        self.inner.lock().unwrap().next_seq()
    }

    /// Retained packet count
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest cached video sequence header
    pub fn video_header(&self) -> Option<Packet> {
        self.inner.lock().unwrap().video_header.clone()
    }

    /// Latest cached audio sequence header
    pub fn audio_header(&self) -> Option<Packet> {
        self.inner.lock().unwrap().audio_header.clone()
    }

    /// Latest cached metadata
    pub fn metadata(&self) -> Option<Packet> {
        self.inner.lock().unwrap().metadata.clone()
    }

    /// Attach a player: codec config plus the keyframe-aligned tail of
    /// the ring, and a cursor positioned at the live edge
    pub fn attach(cache: &Arc<GopCache>, audio_after_video_limit: u32) -> (Vec<Packet>, Cursor) {
        let ring = cache.inner.lock().unwrap();

        let mut catchup = Vec::new();
        if let Some(m) = &ring.metadata {
            catchup.push(m.clone());
        }
        if let Some(h) = &ring.video_header {
            catchup.push(h.clone());
        }
        if let Some(h) = &ring.audio_header {
            catchup.push(h.clone());
        }

        // most recent GOP, so the first video bytes are a decode anchor
        if let Some(&kf_seq) = ring.keyframe_seqs.back() {
            let start = (kf_seq - ring.base_seq) as usize;
            for p in ring.packets.iter().skip(start) {
                if p.is_sequence_header || p.kind == PacketKind::Metadata {
                    continue; // already replayed above
                }
                catchup.push(p.clone());
            }
        }

        let cursor = Cursor {
            cache: Arc::clone(cache),
            seq: ring.next_seq(),
            audio_since_video: 0,
            audio_after_video_limit,
        };

        (catchup, cursor)
    }

    /// Wait until a packet beyond `seq` exists or the cache closes
    ///
    /// Registration happens before the state re-check, so an append
    /// between a cursor poll and this call cannot be missed.
    pub async fn wait_beyond(&self, seq: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() || self.write_seq() > seq {
                return;
            }
            notified.await;
        }
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one cursor poll
#[derive(Debug)]
pub enum CursorRead {
    /// Deliver this packet
    Packet(Packet),
    /// The ring overtook this cursor: deliver the codec configuration,
    /// the cursor now points at the oldest retained keyframe
    Lagged { resync: Vec<Packet> },
    /// Nothing deliverable right now. `write_seq` is the ring's write
    /// position observed under the lock; pass it to
    /// [`GopCache::wait_beyond`] so only a genuinely new append wakes
    /// the waiter (the cursor can be held before the live edge while
    /// audio waits for video).
    CaughtUp { write_seq: u64 },
    /// Publisher is gone and the ring is drained
    Closed,
}

/// A player's private read position in one publisher's ring
pub struct Cursor {
    cache: Arc<GopCache>,
    seq: u64,
    /// Consecutive audio packets delivered since the last video packet
    audio_since_video: u32,
    audio_after_video_limit: u32,
}

impl Cursor {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn cache(&self) -> &Arc<GopCache> {
        &self.cache
    }

    /// Advance by one packet if possible
    pub fn poll(&mut self) -> CursorRead {
        let cache = Arc::clone(&self.cache);
        let ring = cache.inner.lock().unwrap();
        let next_seq = ring.next_seq();

        if self.seq < ring.base_seq {
            let resync_seq = ring.keyframe_seqs.front().copied().unwrap_or(ring.base_seq);
            self.seq = resync_seq;
            self.audio_since_video = 0;

            let mut resync = Vec::new();
            if let Some(m) = &ring.metadata {
                resync.push(m.clone());
            }
            if let Some(h) = &ring.video_header {
                resync.push(h.clone());
            }
            if let Some(h) = &ring.audio_header {
                resync.push(h.clone());
            }
            return CursorRead::Lagged { resync };
        }

        if self.seq >= next_seq {
            return if self.cache.is_closed() {
                CursorRead::Closed
            } else {
                CursorRead::CaughtUp { write_seq: next_seq }
            };
        }

        let idx = (self.seq - ring.base_seq) as usize;
        let packet = ring.packets[idx].clone();

        match packet.kind {
            PacketKind::Video if !packet.is_sequence_header => {
                self.audio_since_video = 0;
            }
            PacketKind::Audio if !packet.is_sequence_header => {
                if self.audio_after_video_limit != 0
                    && self.audio_since_video >= self.audio_after_video_limit
                {
                    // video stalled: hold audio until video is queued,
                    // so the player does not drift arbitrarily far
                    let video_ahead = ring
                        .packets
                        .iter()
                        .skip(idx + 1)
                        .any(|p| p.kind == PacketKind::Video && !p.is_sequence_header);
                    if !video_ahead {
                        return CursorRead::CaughtUp { write_seq: next_seq };
                    }
                }
                self.audio_since_video += 1;
            }
            _ => {}
        }

        self.seq += 1;
        CursorRead::Packet(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::DEFAULT_AUDIO_AFTER_VIDEO_LIMIT;

    fn keyframe(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]), true, false)
    }

    fn interframe(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]), false, false)
    }

    fn audio(ts: u32) -> Packet {
        Packet::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x21]), false)
    }

    fn video_header() -> Packet {
        Packet::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]), true, true)
    }

    fn audio_header() -> Packet {
        Packet::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]), true)
    }

    fn push_gop(cache: &GopCache, start_ts: u32, frames: u32) {
        cache.push(keyframe(start_ts));
        for i in 1..frames {
            cache.push(interframe(start_ts + i * 33));
        }
    }

    /// The oldest retained packet is a keyframe once any keyframe exists.
    fn assert_ring_starts_at_keyframe(cache: &GopCache) {
        let ring = cache.inner.lock().unwrap();
        if ring.keyframe_seqs.is_empty() {
            return;
        }
        let front = ring.packets.front().expect("ring not empty");
        assert!(front.is_keyframe, "ring starts with {:?}", front.kind);
    }

    #[test]
    fn test_gop_eviction_keeps_keyframe_front() {
        let cache = GopCache::with_max_gop_count(2);
        cache.push(video_header());

        for g in 0..10 {
            push_gop(&cache, g * 1000, 30);
            assert_ring_starts_at_keyframe(&cache);
        }

        // 2 complete GOPs + in-progress = at most 3 keyframes retained
        let ring = cache.inner.lock().unwrap();
        assert_eq!(ring.keyframe_seqs.len(), 3);
        assert!(ring.packets.len() <= 3 * 30 + 1);
    }

    #[test]
    fn test_pre_keyframe_audio_evicted_on_first_keyframe() {
        let cache = GopCache::new();
        for i in 0..50 {
            cache.push(audio(i));
        }
        cache.push(keyframe(2000));
        assert_ring_starts_at_keyframe(&cache);
    }

    #[test]
    fn test_attach_snapshot_starts_with_config_then_keyframe() {
        let cache = Arc::new(GopCache::with_max_gop_count(2));
        cache.push(Packet::metadata(Bytes::from_static(&[0x02])));
        cache.push(video_header());
        cache.push(audio_header());
        push_gop(&cache, 0, 30);
        push_gop(&cache, 1000, 30);

        let (catchup, cursor) = GopCache::attach(&cache, DEFAULT_AUDIO_AFTER_VIDEO_LIMIT);

        assert_eq!(catchup[0].kind, PacketKind::Metadata);
        assert!(catchup[1].is_sequence_header);
        assert!(catchup[2].is_sequence_header);

        // first real video packet is the latest keyframe
        let first_video = catchup
            .iter()
            .find(|p| p.kind == PacketKind::Video && !p.is_sequence_header)
            .unwrap();
        assert!(first_video.is_keyframe);
        assert_eq!(first_video.timestamp, 1000);

        // cursor sits at the live edge
        assert_eq!(cursor.seq(), cache.write_seq());
    }

    #[test]
    fn test_cursor_reads_in_order() {
        let cache = Arc::new(GopCache::new());
        let (_catchup, mut cursor) = GopCache::attach(&cache, 0);

        cache.push(keyframe(0));
        cache.push(interframe(33));
        cache.push(audio(40));

        let mut seen = Vec::new();
        loop {
            match cursor.poll() {
                CursorRead::Packet(p) => seen.push(p.timestamp),
                CursorRead::CaughtUp { .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![0, 33, 40]);
    }

    #[test]
    fn test_lagged_cursor_resyncs_to_keyframe() {
        let cache = Arc::new(GopCache::with_max_gop_count(2));
        cache.push(video_header());
        push_gop(&cache, 0, 5);
        // a cursor parked at the very beginning, then the ring overflows
        let mut cursor = Cursor {
            cache: Arc::clone(&cache),
            seq: 0,
            audio_since_video: 0,
            audio_after_video_limit: 0,
        };
        for g in 1..10 {
            push_gop(&cache, g * 1000, 5);
        }

        match cursor.poll() {
            CursorRead::Lagged { resync } => {
                assert!(resync.iter().any(|p| p.is_sequence_header));
            }
            other => panic!("expected lag, got {:?}", other),
        }

        // after resync the next packet is a keyframe
        match cursor.poll() {
            CursorRead::Packet(p) => assert!(p.is_keyframe),
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_hold_after_video_stalls() {
        let cache = Arc::new(GopCache::new());
        cache.push(keyframe(0));
        let (_catchup, mut cursor) = GopCache::attach(&cache, 3);

        // keyframe was before attach; feed audio only
        for i in 0..10 {
            cache.push(audio(i));
        }

        let mut delivered = 0;
        loop {
            match cursor.poll() {
                CursorRead::Packet(p) => {
                    assert_eq!(p.kind, PacketKind::Audio);
                    delivered += 1;
                }
                CursorRead::CaughtUp { .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        // held at the limit even though more audio is queued
        assert_eq!(delivered, 3);

        // video arrives: held audio drains, then the video packet
        cache.push(interframe(400));
        let mut kinds = Vec::new();
        loop {
            match cursor.poll() {
                CursorRead::Packet(p) => kinds.push(p.kind),
                CursorRead::CaughtUp { .. } => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(kinds.iter().filter(|k| **k == PacketKind::Audio).count(), 7);
        assert_eq!(*kinds.last().unwrap(), PacketKind::Video);
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let cache = Arc::new(GopCache::new());
        let (_catchup, mut cursor) = GopCache::attach(&cache, 0);
        cache.push(keyframe(0));
        cache.push(interframe(33));
        cache.close();

        assert!(matches!(cursor.poll(), CursorRead::Packet(_)));
        assert!(matches!(cursor.poll(), CursorRead::Packet(_)));
        assert!(matches!(cursor.poll(), CursorRead::Closed));
    }

    #[test]
    fn test_sequence_headers_update_mid_stream() {
        let cache = Arc::new(GopCache::new());
        cache.push(video_header());
        push_gop(&cache, 0, 3);

        let new_header =
            Packet::video(500, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0xFF]), true, true);
        cache.push(new_header.clone());

        assert_eq!(cache.video_header().unwrap().payload, new_header.payload);
    }

    #[tokio::test]
    async fn test_wait_beyond_wakes_on_push() {
        let cache = Arc::new(GopCache::new());
        let seq = cache.write_seq();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_beyond(seq).await })
        };

        tokio::task::yield_now().await;
        cache.push(audio(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_beyond_wakes_on_close() {
        let cache = Arc::new(GopCache::new());
        let seq = cache.write_seq();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_beyond(seq).await })
        };

        tokio::task::yield_now().await;
        cache.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
