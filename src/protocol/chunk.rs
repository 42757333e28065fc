//! RTMP chunk stream codec
//!
//! Messages are fragmented into chunks so several message streams can
//! interleave on one TCP connection. Each chunk carries a basic header
//! (fmt + csid), an optional message header, and up to max-chunk-size
//! payload bytes.
//!
//! ```text
//! Basic header:
//! - 1 byte:  fmt(2) + csid(6)         csid 2..63
//! - 2 bytes: fmt(2) + 0 + csid(8)     csid = 64 + byte
//! - 3 bytes: fmt(2) + 1 + csid(16LE)  csid = 64 + u16
//!
//! Message header by fmt:
//! - 0 (11 bytes): timestamp(3) length(3) type(1) stream_id(4, LE)
//! - 1 (7 bytes):  timestamp_delta(3) length(3) type(1)
//! - 2 (3 bytes):  timestamp_delta(3)
//! - 3 (0 bytes):  everything inherited
//!
//! A 3-byte timestamp field of 0xFFFFFF means a 4-byte big-endian
//! extended timestamp follows the message header, and again after the
//! basic header of every type-3 chunk of the same message.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message, reassembled from chunks
#[derive(Debug, Clone)]
pub struct RtmpChunk {
    /// Chunk stream id the message arrived on
    pub csid: u32,
    /// Absolute message timestamp (milliseconds, wraps at 2^32)
    pub timestamp: u32,
    /// Message type id
    pub message_type: u8,
    /// Message stream id
    pub stream_id: u32,
    /// Reassembled payload
    pub payload: Bytes,
}

/// Per-csid reassembly state
#[derive(Debug, Default)]
struct ChunkStreamState {
    /// Current absolute timestamp
    timestamp: u32,
    /// Last timestamp delta
    delta: u32,
    /// Whether the in-flight message carries extended timestamps
    has_extended_ts: bool,
    /// Header type (fmt) that started the in-flight message
    header_type: u8,
    /// Message stream id
    stream_id: u32,
    /// Message type id
    type_id: u8,
    /// Declared message length
    message_length: u32,
    /// Bytes of the in-flight message still outstanding
    remaining: u32,
    /// Payload accumulation buffer
    assembly: BytesMut,
}

/// Chunk stream decoder
///
/// [`ChunkDecoder::decode`] consumes at most one chunk per call and only
/// consumes it whole: if the buffer holds a partial chunk, nothing is
/// advanced and `Ok(None)` is returned.
pub struct ChunkDecoder {
    /// Peer's max chunk size (updated by set-chunk-size)
    chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
    max_message_size: u32,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Apply a peer set-chunk-size. The top bit is reserved and masked
    /// off; values are clamped to [`MAX_CHUNK_SIZE`].
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = (size & 0x7FFF_FFFF).clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Discard the in-flight message on a chunk stream (abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.assembly.clear();
            state.remaining = 0;
        }
    }

    /// Decode one chunk; returns a message when its last chunk arrives
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Basic header, peeked
        let first = buf[0];
        let fmt = first >> 6;
        let csid_low = (first & 0x3F) as u32;
        let (csid, bh_len) = match csid_low {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u32, 2usize)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u32 + ((buf[2] as u32) << 8), 3usize)
            }
            _ => (csid_low, 1usize),
        };

        let mh_len: usize = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < bh_len + mh_len {
            return Ok(None);
        }

        let state = self.streams.entry(csid).or_default();

        if fmt != 3 && state.remaining != 0 {
            return Err(ProtocolError::MessageInProgress { csid, remaining: state.remaining }.into());
        }

        // Message header fields, still peeked
        let header = &buf[bh_len..bh_len + mh_len];
        let ts_field = if fmt == 3 { 0 } else { read_u24(header) };
        let needs_ext = if fmt == 3 { state.has_extended_ts } else { ts_field >= EXTENDED_TIMESTAMP_THRESHOLD };
        let ext_len = if needs_ext { 4 } else { 0 };
        if buf.len() < bh_len + mh_len + ext_len {
            return Ok(None);
        }
        let ext_ts = if needs_ext {
            let e = &buf[bh_len + mh_len..bh_len + mh_len + 4];
            Some(u32::from_be_bytes([e[0], e[1], e[2], e[3]]))
        } else {
            None
        };

        let (message_length, type_id, stream_id) = match fmt {
            0 => (read_u24(&header[3..]), header[6], read_u32_le(&header[7..])),
            1 => (read_u24(&header[3..]), header[6], state.stream_id),
            _ => (state.message_length, state.type_id, state.stream_id),
        };

        if message_length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length,
                max: self.max_message_size,
            }
            .into());
        }

        // Payload share of this chunk; only now do we know the full chunk
        // size, so only now may the buffer be advanced.
        let starting = state.remaining == 0;
        let outstanding = if starting { message_length } else { state.remaining };
        let payload_len = outstanding.min(self.chunk_size) as usize;
        if buf.len() < bh_len + mh_len + ext_len + payload_len {
            return Ok(None);
        }
        buf.advance(bh_len + mh_len + ext_len);

        match fmt {
            0 => {
                state.header_type = 0;
                state.message_length = message_length;
                state.type_id = type_id;
                state.stream_id = stream_id;
                state.has_extended_ts = needs_ext;
                state.timestamp = ext_ts.unwrap_or(ts_field);
            }
            1 | 2 => {
                state.header_type = fmt;
                state.message_length = message_length;
                state.type_id = type_id;
                state.has_extended_ts = needs_ext;
                let delta = ext_ts.unwrap_or(ts_field);
                state.delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
            _ => {
                // The extended timestamp bytes of a continuation chunk are
                // consumed either way; time only advances when this chunk
                // starts a new message.
                if starting {
                    match (ext_ts, state.header_type) {
                        (Some(v), 0) => state.timestamp = v,
                        (Some(v), _) => state.timestamp = state.timestamp.wrapping_add(v),
                        (None, 1) | (None, 2) => {
                            state.timestamp = state.timestamp.wrapping_add(state.delta)
                        }
                        (None, _) => {}
                    }
                }
            }
        }

        if starting {
            state.remaining = message_length;
            state.assembly.reserve(message_length as usize);
        }

        state.assembly.put_slice(&buf[..payload_len]);
        buf.advance(payload_len);
        state.remaining -= payload_len as u32;

        if state.remaining == 0 {
            let payload = state.assembly.split().freeze();
            debug_assert_eq!(payload.len() as u32, state.message_length);
            Ok(Some(RtmpChunk {
                csid,
                timestamp: state.timestamp,
                message_type: state.type_id,
                stream_id: state.stream_id,
                payload,
            }))
        } else {
            Ok(None)
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder
///
/// Serialises each message as one type-0 chunk followed by type-3
/// continuations, each carrying at most the negotiated chunk size.
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }

    /// Raise the outbound chunk size; pair with an outbound
    /// set-chunk-size message.
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into `buf`
    pub fn encode(&mut self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        let needs_ext = chunk.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
        let ts_field = if needs_ext { EXTENDED_TIMESTAMP_THRESHOLD } else { chunk.timestamp };
        let payload_len = chunk.payload.len();

        write_basic_header(chunk.csid, 0, buf);
        write_u24(ts_field, buf);
        write_u24(payload_len as u32, buf);
        buf.put_u8(chunk.message_type);
        buf.put_u32_le(chunk.stream_id);
        if needs_ext {
            buf.put_u32(chunk.timestamp);
        }

        let mut offset = 0;
        loop {
            let n = (payload_len - offset).min(self.chunk_size as usize);
            buf.put_slice(&chunk.payload[offset..offset + n]);
            offset += n;
            if offset >= payload_len {
                break;
            }
            write_basic_header(chunk.csid, 3, buf);
            if needs_ext {
                buf.put_u32(chunk.timestamp);
            }
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u24(b: &[u8]) -> u32 {
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | (b[2] as u32)
}

fn read_u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        let offset = csid - 64;
        buf.put_u8((offset & 0xFF) as u8);
        buf.put_u8(((offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(csid: u32, timestamp: u32, payload_len: usize) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i * 31 + 7) as u8).collect();
        let original = RtmpChunk {
            csid,
            timestamp,
            message_type: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(payload),
        };

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&original, &mut wire);

        let mut decoded = None;
        while decoded.is_none() {
            decoded = decoder.decode(&mut wire).unwrap();
            if decoded.is_none() && wire.is_empty() {
                panic!("wire exhausted before message completed");
            }
        }
        let decoded = decoded.unwrap();

        assert_eq!(decoded.csid, original.csid);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.message_type, original.message_type);
        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.payload, original.payload);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_roundtrip_length_boundaries() {
        for &len in &[1usize, 127, 128, 129, 16383, 16384, 65535, 1_000_000] {
            roundtrip(CSID_VIDEO, 1000, len);
        }
    }

    #[test]
    fn test_roundtrip_csid_forms() {
        // 1-byte, 2-byte and 3-byte basic headers
        for &csid in &[2u32, 3, 63, 64, 319, 320, 65599] {
            roundtrip(csid, 42, 500);
        }
    }

    #[test]
    fn test_roundtrip_extended_timestamps() {
        for &ts in &[0xFFFFFEu32, 0xFFFFFF, 0x0100_0000, 0xFFFF_FFFF] {
            roundtrip(CSID_VIDEO, ts, 300);
        }
    }

    #[test]
    fn test_chunk_size_change_layout() {
        // A 5000-byte message at chunk size 4096 occupies exactly two
        // chunks: 4096 + 904 payload bytes.
        let payload = vec![0xABu8; 5000];
        let chunk = RtmpChunk {
            csid: CSID_VIDEO,
            timestamp: 10,
            message_type: MSG_VIDEO,
            stream_id: 1,
            payload: Bytes::from(payload.clone()),
        };

        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(4096);
        let mut wire = BytesMut::new();
        encoder.encode(&chunk, &mut wire);

        // 1 basic + 11 header + 4096, then 1 basic + 904
        assert_eq!(wire.len(), 1 + 11 + 4096 + 1 + 904);
        // second basic header is fmt 3 on the same csid
        assert_eq!(wire[1 + 11 + 4096], 0xC0 | CSID_VIDEO as u8);

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(4096);
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        let msg = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[test]
    fn test_partial_chunk_consumes_nothing() {
        let chunk = RtmpChunk {
            csid: CSID_AUDIO,
            timestamp: 5,
            message_type: MSG_AUDIO,
            stream_id: 1,
            payload: Bytes::from(vec![0x11u8; 100]),
        };

        let mut encoder = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(&chunk, &mut wire);

        let mut decoder = ChunkDecoder::new();
        // Feed one byte at a time; nothing may be consumed until the
        // whole chunk is present.
        let full = wire.clone();
        let mut partial = BytesMut::new();
        for i in 0..full.len() - 1 {
            partial.put_u8(full[i]);
            let before = partial.len();
            assert!(decoder.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), before);
        }
        partial.put_u8(full[full.len() - 1]);
        let msg = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(msg.payload.len(), 100);
    }

    #[test]
    fn test_new_header_with_message_in_progress_is_error() {
        // fmt 0 header declaring 300 bytes, then only 128 payload bytes,
        // then another fmt 0 header on the same csid.
        let mut wire = BytesMut::new();
        wire.put_u8(0x06); // fmt 0, csid 6
        wire.put_slice(&[0, 0, 1]); // timestamp
        wire.put_slice(&[0, 1, 44]); // length 300
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_slice(&vec![0u8; 128]);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut wire).unwrap().is_none());

        wire.put_u8(0x06);
        wire.put_slice(&[0, 0, 2]);
        wire.put_slice(&[0, 1, 44]);
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_slice(&vec![0u8; 128]);

        let err = decoder.decode(&mut wire).unwrap_err();
        assert!(err.to_string().contains("outstanding"));
    }

    #[test]
    fn test_delta_timestamps_accumulate() {
        // fmt 0 at ts 100, then fmt 2 chunks with delta 40 each.
        let mut wire = BytesMut::new();
        wire.put_u8(0x06);
        wire.put_slice(&[0, 0, 100]);
        wire.put_slice(&[0, 0, 4]);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[1, 2, 3, 4]);

        for _ in 0..2 {
            wire.put_u8(0x86); // fmt 2, csid 6
            wire.put_slice(&[0, 0, 40]);
            wire.put_slice(&[5, 6, 7, 8]);
        }

        let mut decoder = ChunkDecoder::new();
        let m1 = decoder.decode(&mut wire).unwrap().unwrap();
        let m2 = decoder.decode(&mut wire).unwrap().unwrap();
        let m3 = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(m1.timestamp, 100);
        assert_eq!(m2.timestamp, 140);
        assert_eq!(m3.timestamp, 180);
    }

    #[test]
    fn test_fmt3_repeats_last_delta() {
        // fmt 0, then fmt 2 with delta 25, then a bare fmt 3 starting a
        // new message: the delta applies again.
        let mut wire = BytesMut::new();
        wire.put_u8(0x06);
        wire.put_slice(&[0, 0, 10]);
        wire.put_slice(&[0, 0, 2]);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[0xAA, 0xBB]);

        wire.put_u8(0x86);
        wire.put_slice(&[0, 0, 25]);
        wire.put_slice(&[0xCC, 0xDD]);

        wire.put_u8(0xC6); // fmt 3, csid 6
        wire.put_slice(&[0xEE, 0xFF]);

        let mut decoder = ChunkDecoder::new();
        let m1 = decoder.decode(&mut wire).unwrap().unwrap();
        let m2 = decoder.decode(&mut wire).unwrap().unwrap();
        let m3 = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(m1.timestamp, 10);
        assert_eq!(m2.timestamp, 35);
        assert_eq!(m3.timestamp, 60);
    }

    #[test]
    fn test_timestamp_wrap_via_deltas() {
        // Timestamps keep increasing by deltas across the 32-bit boundary.
        let mut wire = BytesMut::new();
        wire.put_u8(0x06);
        wire.put_slice(&[0xFF, 0xFF, 0xFF]); // extended timestamp sentinel
        wire.put_slice(&[0, 0, 1]);
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_u32(0xFFFF_FFF0); // extended timestamp
        wire.put_u8(0x01);

        // delta 0x20 crosses the wrap
        wire.put_u8(0x86);
        wire.put_slice(&[0, 0, 0x20]);
        wire.put_slice(&[0x02]);

        let mut decoder = ChunkDecoder::new();
        let m1 = decoder.decode(&mut wire).unwrap().unwrap();
        let m2 = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(m1.timestamp, 0xFFFF_FFF0);
        assert_eq!(m2.timestamp, 0x10); // wrapped, no off-by-one
    }

    #[test]
    fn test_abort_clears_assembly() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x06);
        wire.put_slice(&[0, 0, 1]);
        wire.put_slice(&[0, 1, 44]); // 300 bytes, partial
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_slice(&vec![0u8; 128]);

        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&mut wire).unwrap().is_none());
        decoder.abort(6);

        // A fresh fmt 0 header is accepted now.
        wire.put_u8(0x06);
        wire.put_slice(&[0, 0, 2]);
        wire.put_slice(&[0, 0, 3]);
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_slice(&[9, 9, 9]);
        let msg = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(msg.payload.len(), 3);
    }

    #[test]
    fn test_inbound_chunk_size_clamped() {
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(0xFFFF_FFFF);
        assert_eq!(decoder.chunk_size(), MAX_CHUNK_SIZE);
        decoder.set_chunk_size(4096);
        assert_eq!(decoder.chunk_size(), 4096);
    }
}
