//! RTMP message types
//!
//! Messages fall into protocol control (types 1-6), media (8, 9), data
//! (15, 18) and command (17, 20) classes. AMF3-encoded commands and data
//! (17, 15) are unwrapped into the same structures as their AMF0
//! counterparts.
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::amf::{amf0, Amf0Decoder, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// Command (types 20 and 17)
    Command(Command),

    /// Data message (types 18 and 15) — metadata and friends
    Data(DataMessage),

    /// Anything else; dropped by the dispatcher with a log line
    Unknown { type_id: u8, data: Bytes },
}

/// User control event
#[derive(Debug, Clone)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, publish, play, ...)
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    /// Command object; null for most responses
    pub command_object: AmfValue,
    /// Positional arguments after the command object
    pub arguments: Vec<AmfValue>,
    /// Message stream id the command arrived on
    pub stream_id: u32,
}

/// Data message (@setDataFrame, onMetaData, |RtmpSampleAccess, ...)
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub name: String,
    pub values: Vec<AmfValue>,
    pub stream_id: u32,
}

/// Parameters of an inbound connect command
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Application name, possibly carrying a ?vhost= query
    pub app: String,
    pub flash_ver: Option<String>,
    pub tc_url: Option<String>,
    /// AMF version the peer wants (0 or 3)
    pub object_encoding: f64,
}

impl ConnectParams {
    /// Extract from the connect command object
    pub fn from_amf(obj: &AmfValue) -> Self {
        let mut params = ConnectParams::default();

        if let Some(map) = obj.as_object() {
            for (key, value) in map {
                match key.as_str() {
                    "app" => {
                        if let Some(s) = value.as_str() {
                            params.app = s.to_string();
                        }
                    }
                    "flashVer" | "flashver" => {
                        params.flash_ver = value.as_str().map(|s| s.to_string());
                    }
                    "tcUrl" | "tcurl" => {
                        params.tc_url = value.as_str().map(|s| s.to_string());
                    }
                    "objectEncoding" => {
                        params.object_encoding = value.as_number().unwrap_or(0.0);
                    }
                    _ => {}
                }
            }
        }

        params
    }
}

impl RtmpMessage {
    /// Parse a reassembled message
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut payload = chunk.payload.clone();

        match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                // top bit is reserved
                Ok(RtmpMessage::SetChunkSize(payload.get_u32() & 0x7FFF_FFFF))
            }

            MSG_ABORT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::Abort { csid: payload.get_u32() })
            }

            MSG_ACKNOWLEDGEMENT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::Acknowledgement { sequence: payload.get_u32() })
            }

            MSG_USER_CONTROL => Self::parse_user_control(&mut payload),

            MSG_WINDOW_ACK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                if payload.len() < 5 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                let size = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(RtmpMessage::Audio { timestamp: chunk.timestamp, data: payload }),

            MSG_VIDEO => Ok(RtmpMessage::Video { timestamp: chunk.timestamp, data: payload }),

            MSG_COMMAND_AMF0 => {
                Ok(RtmpMessage::Command(Self::parse_command(&mut payload, chunk.stream_id)?))
            }

            MSG_COMMAND_AMF3 => {
                // AMF3 command bodies open with a 0x00 envelope marker and
                // continue in AMF0.
                if !payload.is_empty() && payload[0] == 0x00 {
                    payload.advance(1);
                }
                Ok(RtmpMessage::Command(Self::parse_command(&mut payload, chunk.stream_id)?))
            }

            MSG_DATA_AMF0 => {
                Ok(RtmpMessage::Data(Self::parse_data(&mut payload, chunk.stream_id)?))
            }

            MSG_DATA_AMF3 => {
                if !payload.is_empty() && payload[0] == 0x00 {
                    payload.advance(1);
                }
                Ok(RtmpMessage::Data(Self::parse_data(&mut payload, chunk.stream_id)?))
            }

            _ => Ok(RtmpMessage::Unknown { type_id: chunk.message_type, data: payload }),
        }
    }

    fn parse_user_control(payload: &mut Bytes) -> Result<Self> {
        if payload.len() < 6 {
            return Err(ProtocolError::InvalidChunkHeader.into());
        }

        let event_type = payload.get_u16();
        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(payload.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(payload.get_u32()),
            UC_STREAM_DRY => UserControlEvent::StreamDry(payload.get_u32()),
            UC_SET_BUFFER_LENGTH => {
                if payload.len() < 8 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                let stream_id = payload.get_u32();
                let buffer_ms = payload.get_u32();
                UserControlEvent::SetBufferLength { stream_id, buffer_ms }
            }
            UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(payload.get_u32()),
            UC_PING_REQUEST => UserControlEvent::PingRequest(payload.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(payload.get_u32()),
            _ => UserControlEvent::Unknown { event_type, data: payload.clone() },
        };

        Ok(RtmpMessage::UserControl(event))
    }

    fn parse_command(payload: &mut Bytes, stream_id: u32) -> Result<Command> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => return Err(ProtocolError::InvalidCommand("missing command name".into()).into()),
        };

        let transaction_id = match decoder.decode(payload) {
            Ok(AmfValue::Number(n)) => n,
            _ => 0.0,
        };

        let command_object = if payload.has_remaining() {
            decoder.decode(payload)?
        } else {
            AmfValue::Null
        };

        let mut arguments = Vec::new();
        while payload.has_remaining() {
            match decoder.decode(payload) {
                Ok(v) => arguments.push(v),
                Err(AmfError::UnexpectedEof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Command { name, transaction_id, command_object, arguments, stream_id })
    }

    fn parse_data(payload: &mut Bytes, stream_id: u32) -> Result<DataMessage> {
        let mut decoder = Amf0Decoder::new();

        let name = match decoder.decode(payload)? {
            AmfValue::String(s) => s,
            _ => String::new(),
        };

        let mut values = Vec::new();
        while payload.has_remaining() {
            match decoder.decode(payload) {
                Ok(v) => values.push(v),
                Err(AmfError::UnexpectedEof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(DataMessage { name, values, stream_id })
    }

    /// Encode to (message type id, payload)
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*size);
                (MSG_SET_CHUNK_SIZE, buf.freeze())
            }

            RtmpMessage::Abort { csid } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*csid);
                (MSG_ABORT, buf.freeze())
            }

            RtmpMessage::Acknowledgement { sequence } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*sequence);
                (MSG_ACKNOWLEDGEMENT, buf.freeze())
            }

            RtmpMessage::WindowAckSize(size) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*size);
                (MSG_WINDOW_ACK_SIZE, buf.freeze())
            }

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }

            RtmpMessage::UserControl(event) => {
                let mut buf = BytesMut::with_capacity(10);
                match event {
                    UserControlEvent::StreamBegin(id) => {
                        buf.put_u16(UC_STREAM_BEGIN);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamEof(id) => {
                        buf.put_u16(UC_STREAM_EOF);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamDry(id) => {
                        buf.put_u16(UC_STREAM_DRY);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
                        buf.put_u16(UC_SET_BUFFER_LENGTH);
                        buf.put_u32(*stream_id);
                        buf.put_u32(*buffer_ms);
                    }
                    UserControlEvent::StreamIsRecorded(id) => {
                        buf.put_u16(UC_STREAM_IS_RECORDED);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::PingRequest(ts) => {
                        buf.put_u16(UC_PING_REQUEST);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::PingResponse(ts) => {
                        buf.put_u16(UC_PING_RESPONSE);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::Unknown { event_type, data } => {
                        buf.put_u16(*event_type);
                        buf.put_slice(data);
                    }
                }
                (MSG_USER_CONTROL, buf.freeze())
            }

            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),

            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),

            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, encode_command(cmd)),

            RtmpMessage::Data(data) => (MSG_DATA_AMF0, encode_data(data)),

            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        }
    }
}

/// Encode a command to AMF0 bytes
pub fn encode_command(cmd: &Command) -> Bytes {
    let mut values = Vec::with_capacity(3 + cmd.arguments.len());
    values.push(AmfValue::String(cmd.name.clone()));
    values.push(AmfValue::Number(cmd.transaction_id));
    values.push(cmd.command_object.clone());
    values.extend(cmd.arguments.iter().cloned());
    amf0::encode_all(&values)
}

/// Encode a data message to AMF0 bytes
pub fn encode_data(data: &DataMessage) -> Bytes {
    let mut values = Vec::with_capacity(1 + data.values.len());
    values.push(AmfValue::String(data.name.clone()));
    values.extend(data.values.iter().cloned());
    amf0::encode_all(&values)
}

impl Command {
    /// Build a _result response
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Build an _error response
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command {
            name: CMD_ERROR.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// Build an onStatus notification
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        let mut info = HashMap::new();
        info.insert("level".to_string(), AmfValue::String(level.to_string()));
        info.insert("code".to_string(), AmfValue::String(code.to_string()));
        info.insert("description".to_string(), AmfValue::String(description.to_string()));

        Command {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::Object(info)],
            stream_id,
        }
    }

    /// Status code of an onStatus/_result info object, if present
    pub fn status_code(&self) -> Option<&str> {
        self.arguments.first().and_then(|v| v.get_string("code"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_parsing() {
        let mut obj = HashMap::new();
        obj.insert("app".to_string(), AmfValue::String("live".into()));
        obj.insert("tcUrl".to_string(), AmfValue::String("rtmp://localhost/live".into()));
        obj.insert("objectEncoding".to_string(), AmfValue::Number(3.0));

        let params = ConnectParams::from_amf(&AmfValue::Object(obj));
        assert_eq!(params.app, "live");
        assert_eq!(params.tc_url, Some("rtmp://localhost/live".into()));
        assert_eq!(params.object_encoding, 3.0);
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command {
            name: "publish".to_string(),
            transaction_id: 5.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::String("a".into()), AmfValue::String("live".into())],
            stream_id: 1,
        };

        let chunk = RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type: MSG_COMMAND_AMF0,
            stream_id: 1,
            payload: encode_command(&cmd),
        };

        match RtmpMessage::from_chunk(&chunk).unwrap() {
            RtmpMessage::Command(parsed) => {
                assert_eq!(parsed.name, "publish");
                assert_eq!(parsed.transaction_id, 5.0);
                assert_eq!(parsed.arguments.len(), 2);
                assert_eq!(parsed.stream_id, 1);
            }
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_amf3_command_envelope() {
        let cmd = Command {
            name: "connect".to_string(),
            transaction_id: 1.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };

        let mut payload = BytesMut::new();
        payload.put_u8(0x00); // AMF3 envelope marker
        payload.put_slice(&encode_command(&cmd));

        let chunk = RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type: MSG_COMMAND_AMF3,
            stream_id: 0,
            payload: payload.freeze(),
        };

        match RtmpMessage::from_chunk(&chunk).unwrap() {
            RtmpMessage::Command(parsed) => assert_eq!(parsed.name, "connect"),
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_user_control_ping_roundtrip() {
        let msg = RtmpMessage::UserControl(UserControlEvent::PingResponse(0xDEAD));
        let (type_id, payload) = msg.encode();
        assert_eq!(type_id, MSG_USER_CONTROL);

        let chunk = RtmpChunk {
            csid: CSID_USER_CONTROL,
            timestamp: 0,
            message_type: type_id,
            stream_id: 0,
            payload,
        };
        match RtmpMessage::from_chunk(&chunk).unwrap() {
            RtmpMessage::UserControl(UserControlEvent::PingResponse(v)) => assert_eq!(v, 0xDEAD),
            other => panic!("expected ping response, got {:?}", other),
        }
    }

    #[test]
    fn test_set_chunk_size_masks_reserved_bit() {
        let chunk = RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type: MSG_SET_CHUNK_SIZE,
            stream_id: 0,
            payload: Bytes::from_static(&[0x80, 0x00, 0x10, 0x00]),
        };
        match RtmpMessage::from_chunk(&chunk).unwrap() {
            RtmpMessage::SetChunkSize(size) => assert_eq!(size, 0x1000),
            other => panic!("expected set-chunk-size, got {:?}", other),
        }
    }

    #[test]
    fn test_on_status_has_code() {
        let status = Command::on_status(1, "status", NS_PLAY_START, "start");
        assert_eq!(status.status_code(), Some(NS_PLAY_START));
    }

    #[test]
    fn test_unknown_type_passthrough() {
        let chunk = RtmpChunk {
            csid: 3,
            timestamp: 0,
            message_type: 99,
            stream_id: 0,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        match RtmpMessage::from_chunk(&chunk).unwrap() {
            RtmpMessage::Unknown { type_id, data } => {
                assert_eq!(type_id, 99);
                assert_eq!(data.len(), 3);
            }
            other => panic!("expected unknown, got {:?}", other),
        }
    }
}
