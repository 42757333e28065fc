//! FLV tag-body inspection
//!
//! RTMP audio/video message payloads are FLV tag bodies. The leading
//! bytes classify the payload:
//!
//! ```text
//! Video:
//! +----------+----------+
//! | FrameType| CodecID  | AVCPacketType (1) | CompositionTime (3) | ...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//!
//! Audio:
//! +-----------+---------+----------+----------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AACPacketType (1) | ...
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  |
//! +-----------+---------+----------+----------+
//! ```
//!
//! Frame-type nibble 1 marks a keyframe; packet-type byte 0 after the
//! codec byte marks a sequence header for AVC, HEVC and AAC alike.

use bytes::Bytes;

/// Video frame type (upper nibble of the first video byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe)
    }
}

/// Video codec id (lower nibble of the first video byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// AVC / H.264
    Avc = 7,
    /// HEVC / H.265, carried under the legacy FLV codec id
    Hevc = 12,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            _ => None,
        }
    }
}

/// Audio codec (upper nibble of the first audio byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Mp3 = 2,
    Aac = 10,
    Speex = 11,
}

impl AudioCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            2 => Some(AudioCodec::Mp3),
            10 => Some(AudioCodec::Aac),
            11 => Some(AudioCodec::Speex),
            _ => None,
        }
    }
}

/// Zero-copy view over an audio or video tag body
#[derive(Debug, Clone)]
pub enum TagView {
    Video(Bytes),
    Audio(Bytes),
}

impl TagView {
    pub fn data(&self) -> &Bytes {
        match self {
            TagView::Video(d) => d,
            TagView::Audio(d) => d,
        }
    }

    /// Video frame type, if this is a non-empty video tag
    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        match self {
            TagView::Video(d) if !d.is_empty() => VideoFrameType::from_byte(d[0]),
            _ => None,
        }
    }

    /// Video codec, if recognised
    pub fn video_codec(&self) -> Option<VideoCodec> {
        match self {
            TagView::Video(d) if !d.is_empty() => VideoCodec::from_byte(d[0]),
            _ => None,
        }
    }

    /// Audio codec, if recognised
    pub fn audio_codec(&self) -> Option<AudioCodec> {
        match self {
            TagView::Audio(d) if !d.is_empty() => AudioCodec::from_byte(d[0]),
            _ => None,
        }
    }

    /// Frame-type nibble says keyframe
    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type().map(|t| t.is_keyframe()).unwrap_or(false)
    }

    /// AVC or HEVC sequence header (packet-type byte 0)
    pub fn is_video_sequence_header(&self) -> bool {
        match self {
            TagView::Video(d) => {
                d.len() >= 2 && VideoCodec::from_byte(d[0]).is_some() && d[1] == 0
            }
            _ => false,
        }
    }

    /// AAC sequence header (AACPacketType byte 0)
    pub fn is_audio_sequence_header(&self) -> bool {
        match self {
            TagView::Audio(d) => {
                d.len() >= 2 && AudioCodec::from_byte(d[0]) == Some(AudioCodec::Aac) && d[1] == 0
            }
            _ => false,
        }
    }

    /// Codec config bytes of a sequence header (past packet type and, for
    /// video, composition time)
    pub fn config_payload(&self) -> Option<Bytes> {
        match self {
            TagView::Video(d) if self.is_video_sequence_header() && d.len() > 5 => {
                Some(d.slice(5..))
            }
            TagView::Audio(d) if self.is_audio_sequence_header() && d.len() > 2 => {
                Some(d.slice(2..))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_type() {
        assert_eq!(VideoFrameType::from_byte(0x17), Some(VideoFrameType::Keyframe));
        assert_eq!(VideoCodec::from_byte(0x17), Some(VideoCodec::Avc));
        assert_eq!(VideoFrameType::from_byte(0x27), Some(VideoFrameType::InterFrame));
        assert_eq!(VideoCodec::from_byte(0x1C), Some(VideoCodec::Hevc));
    }

    #[test]
    fn test_avc_sequence_header() {
        let header = TagView::Video(Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00, 0x01]));
        assert!(header.is_video_sequence_header());
        assert!(header.is_keyframe());
        assert_eq!(header.config_payload().unwrap(), Bytes::from_static(&[0x01]));

        let frame = TagView::Video(Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]));
        assert!(!frame.is_video_sequence_header());
        assert!(frame.is_keyframe());
    }

    #[test]
    fn test_hevc_sequence_header() {
        // frame type 1 + codec 12, packet type 0
        let header = TagView::Video(Bytes::from_static(&[0x1C, 0x00, 0x00, 0x00, 0x00, 0xAB]));
        assert!(header.is_video_sequence_header());
        assert_eq!(header.video_codec(), Some(VideoCodec::Hevc));
    }

    #[test]
    fn test_aac_sequence_header() {
        let header = TagView::Audio(Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(header.is_audio_sequence_header());
        assert_eq!(header.config_payload().unwrap(), Bytes::from_static(&[0x12, 0x10]));

        let frame = TagView::Audio(Bytes::from_static(&[0xAF, 0x01, 0x21, 0x00]));
        assert!(!frame.is_audio_sequence_header());
    }

    #[test]
    fn test_unknown_codec_is_not_header() {
        // codec nibble 9 is not a codec we track
        let tag = TagView::Video(Bytes::from_static(&[0x19, 0x00]));
        assert!(!tag.is_video_sequence_header());
        // mp3 audio has no sequence headers
        let tag = TagView::Audio(Bytes::from_static(&[0x2F, 0x00]));
        assert!(!tag.is_audio_sequence_header());
    }
}
