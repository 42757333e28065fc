//! Unified error types for rtmpd
//!
//! Every error here is fatal to at most one session. The accept loop and
//! the registry never propagate a session's failure to its neighbours.

use std::fmt;
use std::io;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Media payload error
    Media(MediaError),
    /// A publisher is already live under this anchor
    PublishConflict(String),
    /// No live publisher under this anchor
    StreamNotFound(String),
    /// Operation timed out
    Timeout,
    /// Connection was closed by the peer
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::PublishConflict(anchor) => write!(f, "Already publishing: {}", anchor),
            Error::StreamNotFound(anchor) => write!(f, "Stream not found: {}", anchor),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}

/// Protocol-level errors
#[derive(Debug)]
pub enum ProtocolError {
    /// Chunk basic/message header could not be parsed
    InvalidChunkHeader,
    /// A fmt 0/1/2 header arrived while a message was still being
    /// reassembled on the same chunk stream
    MessageInProgress { csid: u32, remaining: u32 },
    /// Declared message length exceeds the sanity limit
    MessageTooLarge { size: u32, max: u32 },
    /// Command message was structurally invalid
    InvalidCommand(String),
    /// A message arrived for a state that cannot accept it
    UnexpectedMessage(String),
    /// No stream with this message stream id
    StreamNotFound(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::MessageInProgress { csid, remaining } => {
                write!(f, "New header on csid {} with {} bytes outstanding", csid, remaining)
            }
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::InvalidCommand(cmd) => write!(f, "Invalid command: {}", cmd),
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            ProtocolError::StreamNotFound(id) => write!(f, "Stream not found: {}", id),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    NestingTooDeep,
    InvalidObjectEnd,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Media payload errors
#[derive(Debug)]
pub enum MediaError {
    InvalidAvcPacket,
    InvalidHevcPacket,
    InvalidAacPacket,
    UnsupportedCodec(String),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::InvalidAvcPacket => write!(f, "Invalid AVC packet"),
            MediaError::InvalidHevcPacket => write!(f, "Invalid HEVC packet"),
            MediaError::InvalidAacPacket => write!(f, "Invalid AAC packet"),
            MediaError::UnsupportedCodec(c) => write!(f, "Unsupported codec: {}", c),
        }
    }
}

impl std::error::Error for MediaError {}
