//! Outbound RTMP connection
//!
//! Client half of the protocol: handshake, then connect → createStream →
//! play, advancing on the matching `_result`/`onStatus` replies.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::amf::AmfValue;
use crate::client::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{Command, RtmpMessage};
use crate::session::state::{SessionState, Stage};

/// Client-side RTMP connection
pub struct RtmpConnector<S> {
    state: SessionState,
    config: RelayConfig,
    app: String,
    stream: String,
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    chunk_decoder: ChunkDecoder,
    chunk_encoder: ChunkEncoder,
    stream_id: u32,
}

impl RtmpConnector<TcpStream> {
    /// Dial the upstream in `config` and complete the handshake and
    /// connect exchange
    pub async fn dial(config: RelayConfig) -> Result<Self> {
        let (host, port, app, stream) =
            config.parse().ok_or_else(|| Error::Config(format!("invalid url {}", config.url)))?;

        let socket = timeout(config.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| Error::Timeout)??;
        socket.set_nodelay(true)?;

        Self::over(socket, config, app, stream).await
    }
}

impl<S> RtmpConnector<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Run the client protocol over an established stream
    pub async fn over(socket: S, config: RelayConfig, app: String, stream: String) -> Result<Self> {
        let (read_half, write_half) = tokio::io::split(socket);

        let mut connector = Self {
            state: SessionState::new_client(0),
            config,
            app,
            stream,
            reader: BufReader::with_capacity(64 * 1024, read_half),
            writer: BufWriter::with_capacity(64 * 1024, write_half),
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::with_capacity(64 * 1024),
            chunk_decoder: ChunkDecoder::new(),
            chunk_encoder: ChunkEncoder::new(),
            stream_id: 0,
        };

        connector.state.advance(Stage::HandshakeStart);
        connector.do_handshake().await?;
        connector.state.advance(Stage::HandshakeDone);
        connector.do_connect().await?;
        Ok(connector)
    }

    /// Stream name from the config URL
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    async fn do_handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Client);

        let c0c1 = handshake.generate_initial().ok_or(Error::Handshake(
            crate::error::HandshakeError::InvalidState,
        ))?;
        self.writer.write_all(&c0c1).await?;
        self.writer.flush().await?;

        let deadline = self.config.connect_timeout;
        timeout(deadline, async {
            while !handshake.is_done() {
                let n = self.reader.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }

                let mut view = Bytes::copy_from_slice(&self.read_buf);
                let before = view.len();
                let response = handshake.process(&mut view)?;
                self.read_buf.advance(before - view.len());

                if let Some(response) = response {
                    self.writer.write_all(&response).await?;
                    self.writer.flush().await?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout)??;

        Ok(())
    }

    async fn do_connect(&mut self) -> Result<()> {
        let tc_url = self.config.url.rsplit_once('/').map(|(base, _)| base.to_string());

        let mut obj = HashMap::new();
        obj.insert("app".to_string(), AmfValue::String(self.app.clone()));
        obj.insert("type".to_string(), AmfValue::String("nonprivate".into()));
        obj.insert("flashVer".to_string(), AmfValue::String(self.config.flash_ver.clone()));
        if let Some(tc_url) = tc_url {
            obj.insert("tcUrl".to_string(), AmfValue::String(tc_url));
        }
        obj.insert("fpad".to_string(), AmfValue::Boolean(false));
        obj.insert("capabilities".to_string(), AmfValue::Number(15.0));
        obj.insert("audioCodecs".to_string(), AmfValue::Number(3191.0));
        obj.insert("videoCodecs".to_string(), AmfValue::Number(252.0));
        obj.insert("videoFunction".to_string(), AmfValue::Number(1.0));

        let cmd = Command {
            name: CMD_CONNECT.to_string(),
            transaction_id: 1.0,
            command_object: AmfValue::Object(obj),
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(&cmd).await?;

        // read_message handles protocol control inline; only the command
        // replies surface here
        loop {
            match self.read_message().await? {
                RtmpMessage::Command(reply) if reply.name == CMD_RESULT => break,
                RtmpMessage::Command(reply) if reply.name == CMD_ERROR => {
                    return Err(Error::Protocol(crate::error::ProtocolError::UnexpectedMessage(
                        format!("connect rejected: {:?}", reply.status_code()),
                    )));
                }
                _ => {}
            }
        }

        self.chunk_encoder.set_chunk_size(RECOMMENDED_CHUNK_SIZE);
        self.send_message(&RtmpMessage::SetChunkSize(RECOMMENDED_CHUNK_SIZE)).await?;
        Ok(())
    }

    /// createStream, returning the allocated stream id
    pub async fn create_stream(&mut self) -> Result<u32> {
        let cmd = Command {
            name: CMD_CREATE_STREAM.to_string(),
            transaction_id: 2.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(&cmd).await?;

        loop {
            if let RtmpMessage::Command(reply) = self.read_message().await? {
                if reply.name == CMD_RESULT && reply.transaction_id == 2.0 {
                    let id = reply
                        .arguments
                        .first()
                        .and_then(|v| v.as_number())
                        .ok_or(Error::Protocol(
                            crate::error::ProtocolError::UnexpectedMessage(
                                "createStream result without stream id".into(),
                            ),
                        ))?;
                    self.stream_id = id as u32;
                    return Ok(self.stream_id);
                }
            }
        }
    }

    /// play, waiting for NetStream.Play.Start
    pub async fn play(&mut self) -> Result<()> {
        if self.stream_id == 0 {
            self.create_stream().await?;
        }

        let cmd = Command {
            name: CMD_PLAY.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![
                AmfValue::String(self.stream.clone()),
                AmfValue::Number(-2.0), // live or recorded
                AmfValue::Number(-1.0), // until end
                AmfValue::Boolean(true),
            ],
            stream_id: self.stream_id,
        };
        self.send_command(&cmd).await?;

        loop {
            if let RtmpMessage::Command(status) = self.read_message().await? {
                if status.name == CMD_ON_STATUS {
                    match status.status_code() {
                        Some(NS_PLAY_START) => {
                            self.state.start_play(self.stream_id);
                            return Ok(());
                        }
                        Some(code) if code.contains("Failed") || code.contains("NotFound") => {
                            return Err(Error::StreamNotFound(self.stream.clone()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Read the next message, answering protocol control inline
    pub async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            while let Some(chunk) = self.chunk_decoder.decode(&mut self.read_buf)? {
                let msg = RtmpMessage::from_chunk(&chunk)?;
                match msg {
                    RtmpMessage::SetChunkSize(size) => {
                        self.chunk_decoder.set_chunk_size(size);
                    }
                    RtmpMessage::WindowAckSize(size) => {
                        self.state.read_ack_size = size;
                    }
                    other => return Ok(other),
                }
            }

            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            if self.state.add_bytes_received(n as u64) {
                let sequence = self.state.take_ack();
                self.send_message(&RtmpMessage::Acknowledgement { sequence }).await?;
            }
        }
    }

    async fn send_message(&mut self, msg: &RtmpMessage) -> Result<()> {
        let (message_type, payload) = msg.encode();
        let csid = match msg {
            RtmpMessage::Command(_) => CSID_COMMAND,
            RtmpMessage::UserControl(_) => CSID_USER_CONTROL,
            _ => CSID_PROTOCOL_CONTROL,
        };
        let chunk =
            RtmpChunk { csid, timestamp: 0, message_type, stream_id: 0, payload };

        self.write_buf.clear();
        self.chunk_encoder.encode(&chunk, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_command(&mut self, cmd: &Command) -> Result<()> {
        self.send_message(&RtmpMessage::Command(cmd.clone())).await
    }
}
