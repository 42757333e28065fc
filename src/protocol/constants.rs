//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Handshake packet size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Default chunk size until set-chunk-size renegotiates it
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size this server negotiates outbound
pub const RECOMMENDED_CHUNK_SIZE: u32 = 4096;

/// Upper bound enforced on peer-requested chunk sizes
pub const MAX_CHUNK_SIZE: u32 = 65536;

/// Maximum reassembled message size (sanity limit)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamps at or above this need the 4-byte extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFFFFFF;

// Chunk stream IDs this server writes on. Reads accept any csid.

/// Protocol control messages
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// AMF0 command messages
pub const CSID_COMMAND: u32 = 3;

/// User control messages
pub const CSID_USER_CONTROL: u32 = 4;

/// Audio data
pub const CSID_AUDIO: u32 = 6;

/// Video data
pub const CSID_VIDEO: u32 = 7;

// Message type IDs (RTMP spec section 5.4)

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

// User control event types

pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_STREAM_DRY: u16 = 2;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_STREAM_IS_RECORDED: u16 = 4;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// Peer bandwidth limit types

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// Command names

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_GET_STREAM_LENGTH: &str = "getStreamLength";

pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_ON_BW_DONE: &str = "onBWDone";

// FMS-compatible commands sent by OBS/ffmpeg

pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_ON_FC_PUBLISH: &str = "onFCPublish";
pub const CMD_ON_FC_UNPUBLISH: &str = "onFCUnpublish";

// Data message names

pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";
pub const CMD_SAMPLE_ACCESS: &str = "|RtmpSampleAccess";

// NetConnection / NetStream status codes

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const NC_CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PLAY_STOP: &str = "NetStream.Play.Stop";
pub const NS_PLAY_STREAM_NOT_FOUND: &str = "NetStream.Play.StreamNotFound";
pub const NS_DATA_START: &str = "NetStream.Data.Start";
pub const NS_UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";

// Server defaults

/// Default window acknowledgement size (2.5 MB)
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Default peer bandwidth (2.5 MB)
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

/// Read inactivity timeout in seconds
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Complete GOPs retained in the cache besides the one in progress
pub const DEFAULT_MAX_GOP_COUNT: usize = 2;

/// Consecutive audio packets delivered with no interleaved video before a
/// player's cursor holds for video
pub const DEFAULT_AUDIO_AFTER_VIDEO_LIMIT: u32 = 115;

/// Shard count of the publisher registry
pub const REGISTRY_SHARDS: usize = 101;

/// Player writer flush threshold in buffered bytes
pub const WRITER_FLUSH_BYTES: usize = 64 * 1024;

/// Player writer flush threshold in packets
pub const WRITER_FLUSH_PACKETS: usize = 16;
