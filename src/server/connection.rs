//! Per-connection session driver
//!
//! Server path: handshake → command exchange → publishing or playing →
//! teardown.
//!
//! A publishing connection keeps one task: the read loop ingests a/v
//! messages into its GOP cache and sinks. A playing connection hands its
//! socket writer to a dedicated writer task that drains the player's
//! cursor; the read loop keeps running to drain control traffic and to
//! notice the peer going away. Each half of the socket has exactly one
//! owner at all times.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::amf::AmfValue;
use crate::error::{Error, Result};
use crate::media::{
    AudioSpecificConfig, AvcConfig, Cursor, CursorRead, GopCache, HevcConfig, Packet, TagView,
    VideoCodec,
};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{
    encode_data, Command, ConnectParams, DataMessage, RtmpMessage, UserControlEvent,
};
use crate::registry::{PublisherHandle, PublisherRegistry, StreamAnchor};
use crate::server::config::ServerConfig;
use crate::session::state::{SessionState, Stage};
use crate::session::url::StreamTarget;
use crate::sink::SinkSet;
use std::collections::HashMap;

/// Removes the registry entry and closes the cache when the publishing
/// session ends, however it ends
struct PublisherGuard {
    registry: Arc<PublisherRegistry>,
    anchor: StreamAnchor,
    session_id: u64,
    cache: Arc<GopCache>,
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        self.cache.close();
        self.registry.remove(&self.anchor, self.session_id);
        tracing::info!(
            session_id = self.session_id,
            anchor = %self.anchor,
            "Publisher deregistered"
        );
    }
}

/// Publishing-role state
struct Publishing {
    guard: PublisherGuard,
    sinks: SinkSet,
    /// Parsed video config, kept beside the raw bytes in the cache
    video_config: Option<ParsedVideoConfig>,
    audio_config: Option<AudioSpecificConfig>,
}

enum ParsedVideoConfig {
    Avc(AvcConfig),
    Hevc(HevcConfig),
}

/// Per-connection driver
pub struct Connection<S> {
    state: SessionState,
    peer: String,

    reader: BufReader<ReadHalf<S>>,
    /// Present until a successful play hands it to the writer task
    writer: Option<BufWriter<WriteHalf<S>>>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    chunk_decoder: ChunkDecoder,
    chunk_encoder: ChunkEncoder,

    config: ServerConfig,
    registry: Arc<PublisherRegistry>,

    /// From connect
    app: String,
    tc_url: Option<String>,
    object_encoding: f64,

    publishing: Option<Publishing>,
    player: Option<JoinHandle<()>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        session_id: u64,
        socket: S,
        peer: String,
        config: ServerConfig,
        registry: Arc<PublisherRegistry>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);
        let buffer_size = config.buffer_size;

        Self {
            state: SessionState::new_server(session_id),
            peer,
            reader: BufReader::with_capacity(buffer_size, read_half),
            writer: Some(BufWriter::with_capacity(buffer_size, write_half)),
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
            chunk_decoder: ChunkDecoder::new(),
            chunk_encoder: ChunkEncoder::new(),
            config,
            registry,
            app: String::new(),
            tc_url: None,
            object_encoding: 0.0,
            publishing: None,
            player: None,
        }
    }

    /// Drive the session to completion
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;

        self.state.close();

        if let Some(mut publishing) = self.publishing.take() {
            let video = match &publishing.video_config {
                Some(ParsedVideoConfig::Avc(c)) => c.profile_name(),
                Some(ParsedVideoConfig::Hevc(_)) => "HEVC",
                None => "none",
            };
            let audio =
                publishing.audio_config.as_ref().map(|c| c.profile_name()).unwrap_or("none");
            tracing::info!(session_id = self.state.id, video = video, audio = audio,
                "Publish ended");
            publishing.sinks.finish().await;
            // guard drop deregisters and closes the cache
        }
        if let Some(player) = self.player.take() {
            player.abort();
        }

        match &result {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => {}
            Err(e) => {
                tracing::debug!(session_id = self.state.id, peer = %self.peer, error = %e,
                    "Session error");
            }
        }

        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.do_handshake().await?;
        self.state.advance(Stage::HandshakeDone);

        let read_timeout = self.config.read_timeout;
        loop {
            match timeout(read_timeout, self.read_and_process()).await {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => return Ok(()), // clean EOF
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::Timeout),
            }
        }
    }

    async fn do_handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        handshake.generate_initial();

        let deadline = self.config.handshake_timeout;
        timeout(deadline, async {
            while !handshake.is_done() {
                let needed = handshake.bytes_needed();
                while self.read_buf.len() < needed {
                    let n = self.reader.read_buf(&mut self.read_buf).await?;
                    if n == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                }

                let mut view = Bytes::copy_from_slice(&self.read_buf);
                let before = view.len();
                let response = handshake.process(&mut view)?;
                self.read_buf.advance(before - view.len());

                if let Some(response) = response {
                    let writer = self.writer.as_mut().expect("writer present before play");
                    writer.write_all(&response).await?;
                    writer.flush().await?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout)??;

        tracing::debug!(session_id = self.state.id, "Handshake complete");
        Ok(())
    }

    /// Decode and handle buffered chunks, then read more. Returns false
    /// on clean EOF.
    async fn read_and_process(&mut self) -> Result<bool> {
        // data may already be buffered (it arrived with the handshake)
        let mut processed = false;
        while let Some(chunk) = self.chunk_decoder.decode(&mut self.read_buf)? {
            self.handle_chunk(chunk).await?;
            processed = true;
        }
        if processed {
            return Ok(true);
        }

        let n = self.reader.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Ok(false);
        }

        let ack_due = self.state.add_bytes_received(n as u64);

        while let Some(chunk) = self.chunk_decoder.decode(&mut self.read_buf)? {
            self.handle_chunk(chunk).await?;
        }

        if ack_due && self.writer.is_some() {
            let sequence = self.state.take_ack();
            self.send_message(
                CSID_PROTOCOL_CONTROL,
                0,
                &RtmpMessage::Acknowledgement { sequence },
            )
            .await?;
        }

        Ok(true)
    }

    /// Message dispatcher, keyed by message type id
    async fn handle_chunk(&mut self, chunk: RtmpChunk) -> Result<()> {
        let message = RtmpMessage::from_chunk(&chunk)?;

        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.state.id, size = size, "Peer set chunk size");
                self.chunk_decoder.set_chunk_size(size);
            }

            RtmpMessage::Abort { csid } => {
                self.chunk_decoder.abort(csid);
            }

            RtmpMessage::Acknowledgement { .. } => {}

            RtmpMessage::WindowAckSize(size) => {
                self.state.read_ack_size = size;
            }

            RtmpMessage::SetPeerBandwidth { size, .. } => {
                if self.writer.is_some() {
                    self.send_message(CSID_PROTOCOL_CONTROL, 0, &RtmpMessage::WindowAckSize(size))
                        .await?;
                }
            }

            RtmpMessage::UserControl(event) => {
                if let UserControlEvent::PingRequest(ts) = event {
                    if self.writer.is_some() {
                        self.send_message(
                            CSID_USER_CONTROL,
                            0,
                            &RtmpMessage::UserControl(UserControlEvent::PingResponse(ts)),
                        )
                        .await?;
                    }
                }
            }

            RtmpMessage::Command(cmd) => {
                self.handle_command(cmd).await?;
            }

            RtmpMessage::Data(data) => {
                self.handle_data(data).await?;
            }

            RtmpMessage::Audio { timestamp, data } => {
                self.handle_audio(timestamp, data).await?;
            }

            RtmpMessage::Video { timestamp, data } => {
                self.handle_video(timestamp, data).await?;
            }

            RtmpMessage::Unknown { type_id, .. } => {
                tracing::trace!(session_id = self.state.id, type_id = type_id,
                    "Dropping unknown message type");
            }
        }

        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        self.state.transaction_id = cmd.transaction_id;

        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => self.handle_create_stream(cmd).await,
            CMD_RELEASE_STREAM => self.send_bare_result(cmd.transaction_id).await,
            CMD_FC_PUBLISH => self.handle_fc_publish(cmd).await,
            CMD_FC_UNPUBLISH => self.handle_fc_unpublish(cmd).await,
            CMD_GET_STREAM_LENGTH => self.handle_get_stream_length(cmd).await,
            CMD_PUBLISH => self.handle_publish(cmd).await,
            CMD_PLAY => self.handle_play(cmd).await,
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => self.handle_delete_stream(cmd).await,
            other => {
                tracing::trace!(session_id = self.state.id, command = other, "Unknown command");
                Ok(())
            }
        }
    }

    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);
        self.app = params.app.clone();
        self.tc_url = params.tc_url.clone();
        self.object_encoding = params.object_encoding;

        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            &RtmpMessage::WindowAckSize(self.config.window_ack_size),
        )
        .await?;
        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            &RtmpMessage::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
        )
        .await?;
        self.send_message(
            CSID_PROTOCOL_CONTROL,
            0,
            &RtmpMessage::SetChunkSize(self.config.chunk_size),
        )
        .await?;
        self.chunk_encoder.set_chunk_size(self.config.chunk_size);

        let mut props = HashMap::new();
        props.insert("fmsVer".to_string(), AmfValue::String("FMS/3,5,7,7009".into()));
        props.insert("capabilities".to_string(), AmfValue::Number(31.0));
        props.insert("mode".to_string(), AmfValue::Number(1.0));

        let mut info = HashMap::new();
        info.insert("level".to_string(), AmfValue::String("status".into()));
        info.insert("code".to_string(), AmfValue::String(NC_CONNECT_SUCCESS.into()));
        info.insert(
            "description".to_string(),
            AmfValue::String("Connection succeeded.".into()),
        );
        info.insert("objectEncoding".to_string(), AmfValue::Number(self.object_encoding));

        let result = Command::result(
            cmd.transaction_id,
            AmfValue::Object(props),
            AmfValue::Object(info),
        );
        self.send_command(0, &result).await?;

        let bw_done = Command {
            name: CMD_ON_BW_DONE.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::Number(8192.0)],
            stream_id: 0,
        };
        self.send_command(0, &bw_done).await?;

        tracing::info!(session_id = self.state.id, peer = %self.peer, app = %self.app,
            "Connected");
        Ok(())
    }

    async fn handle_create_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = self.state.allocate_stream_id();
        let result =
            Command::result(cmd.transaction_id, AmfValue::Null, AmfValue::Number(stream_id as f64));
        self.send_command(0, &result).await?;
        tracing::debug!(session_id = self.state.id, stream_id = stream_id, "Stream created");
        Ok(())
    }

    async fn send_bare_result(&mut self, transaction_id: f64) -> Result<()> {
        let result = Command {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(0, &result).await
    }

    async fn handle_fc_publish(&mut self, _cmd: Command) -> Result<()> {
        let response = Command {
            name: CMD_ON_FC_PUBLISH.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(0, &response).await
    }

    async fn handle_fc_unpublish(&mut self, _cmd: Command) -> Result<()> {
        let response = Command {
            name: CMD_ON_FC_UNPUBLISH.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![],
            stream_id: 0,
        };
        self.send_command(0, &response).await
    }

    async fn handle_get_stream_length(&mut self, cmd: Command) -> Result<()> {
        // live streams have no length
        let result = Command::result(cmd.transaction_id, AmfValue::Null, AmfValue::Number(0.0));
        self.send_command(0, &result).await
    }

    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if stream_name.is_empty() {
            return Err(Error::Protocol(crate::error::ProtocolError::InvalidCommand(
                "publish without stream name".into(),
            )));
        }

        let target = StreamTarget::resolve(self.tc_url.as_deref(), &self.app, &stream_name);
        let anchor = target.anchor();
        let app_config = self.config.app_config(&target.app).clone();

        let cache = Arc::new(GopCache::with_max_gop_count(app_config.max_gop_count));
        let handle = Arc::new(PublisherHandle {
            anchor: anchor.clone(),
            session_id: self.state.id,
            cache: Arc::clone(&cache),
            started_at: std::time::Instant::now(),
        });

        if !self.registry.insert_if_absent(handle) {
            let status = Command::on_status(
                cmd.stream_id,
                "error",
                NS_PUBLISH_BAD_NAME,
                &format!("Stream {} is already publishing", target.stream),
            );
            self.send_command(cmd.stream_id, &status).await?;
            return Err(Error::PublishConflict(anchor.to_string()));
        }

        let sinks = app_config
            .sink_factories
            .iter()
            .map(|factory| factory(&anchor.to_string()))
            .collect();

        self.publishing = Some(Publishing {
            guard: PublisherGuard {
                registry: Arc::clone(&self.registry),
                anchor: anchor.clone(),
                session_id: self.state.id,
                cache,
            },
            sinks: SinkSet::new(sinks),
            video_config: None,
            audio_config: None,
        });
        self.state.start_publish(cmd.stream_id);

        self.send_message(
            CSID_USER_CONTROL,
            0,
            &RtmpMessage::UserControl(UserControlEvent::StreamBegin(cmd.stream_id)),
        )
        .await?;
        let status = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PUBLISH_START,
            &format!("{} is now published.", target.stream),
        );
        self.send_command(cmd.stream_id, &status).await?;

        tracing::info!(session_id = self.state.id, anchor = %anchor, "Publishing started");
        Ok(())
    }

    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        let stream_name = cmd
            .arguments
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let target = StreamTarget::resolve(self.tc_url.as_deref(), &self.app, &stream_name);
        let anchor = target.anchor();

        let publisher = match self.registry.get(&anchor) {
            Some(p) => p,
            None => {
                let status = Command::on_status(
                    cmd.stream_id,
                    "error",
                    NS_PLAY_STREAM_NOT_FOUND,
                    &format!("Stream {} not found", target.stream),
                );
                self.send_command(cmd.stream_id, &status).await?;
                return Err(Error::StreamNotFound(anchor.to_string()));
            }
        };

        let app_config = self.config.app_config(&target.app);
        let (catchup, cursor) =
            GopCache::attach(&publisher.cache, app_config.audio_after_video_limit);

        self.send_message(
            CSID_USER_CONTROL,
            0,
            &RtmpMessage::UserControl(UserControlEvent::StreamBegin(cmd.stream_id)),
        )
        .await?;
        let reset = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PLAY_RESET,
            &format!("Playing and resetting {}.", target.stream),
        );
        self.send_command(cmd.stream_id, &reset).await?;
        let start = Command::on_status(
            cmd.stream_id,
            "status",
            NS_PLAY_START,
            &format!("Started playing {}.", target.stream),
        );
        self.send_command(cmd.stream_id, &start).await?;

        let sample_access = DataMessage {
            name: CMD_SAMPLE_ACCESS.to_string(),
            values: vec![AmfValue::Boolean(true), AmfValue::Boolean(true)],
            stream_id: cmd.stream_id,
        };
        self.send_data(cmd.stream_id, &sample_access).await?;

        let mut data_start_info = HashMap::new();
        data_start_info.insert("code".to_string(), AmfValue::String(NS_DATA_START.into()));
        let data_start = DataMessage {
            name: CMD_ON_STATUS.to_string(),
            values: vec![AmfValue::Object(data_start_info)],
            stream_id: cmd.stream_id,
        };
        self.send_data(cmd.stream_id, &data_start).await?;

        self.flush().await?;
        self.state.start_play(cmd.stream_id);

        // The write half belongs to the player writer task from here on;
        // this read loop keeps draining control traffic only.
        let writer = self.writer.take().expect("writer still owned by the session");
        let encoder = std::mem::replace(&mut self.chunk_encoder, ChunkEncoder::new());
        let player = PlayerWriter {
            session_id: self.state.id,
            stream_id: cmd.stream_id,
            writer,
            encoder,
            cache: Arc::clone(&publisher.cache),
            cursor,
            write_buf: BytesMut::with_capacity(self.config.buffer_size),
            ts_epoch: None,
            unflushed_bytes: 0,
            unflushed_packets: 0,
        };
        self.player = Some(tokio::spawn(player.run(catchup)));

        tracing::info!(session_id = self.state.id, anchor = %anchor, "Playing started");
        Ok(())
    }

    async fn handle_delete_stream(&mut self, cmd: Command) -> Result<()> {
        let stream_id = cmd
            .arguments
            .first()
            .and_then(|v| v.as_number())
            .map(|n| n as u32)
            .unwrap_or(cmd.stream_id);

        if let Some(mut publishing) = self.publishing.take() {
            publishing.sinks.finish().await;
            drop(publishing);
            self.state.is_publish = false;

            let status = Command::on_status(
                stream_id,
                "status",
                NS_UNPUBLISH_SUCCESS,
                "Stream is now unpublished.",
            );
            self.send_command(stream_id, &status).await?;
        }

        if let Some(player) = self.player.take() {
            player.abort();
            self.state.is_play = false;
            // the writer went with the player task; no reply possible
        }

        tracing::debug!(session_id = self.state.id, stream_id = stream_id, "Stream deleted");
        Ok(())
    }

    async fn handle_data(&mut self, data: DataMessage) -> Result<()> {
        let is_metadata = data.name == CMD_SET_DATA_FRAME
            || data.name == CMD_ON_METADATA
            || data.values.first().and_then(|v| v.as_str()) == Some(CMD_ON_METADATA);

        if !is_metadata {
            tracing::trace!(session_id = self.state.id, name = %data.name, "Dropping data message");
            return Ok(());
        }

        let Some(publishing) = self.publishing.as_mut() else {
            return Ok(());
        };

        // Re-emit as a plain onMetaData message: the @setDataFrame
        // wrapper is publisher-to-server only.
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
        let packet = Packet::metadata(encode_data(&replay));

        publishing.sinks.append(&packet).await;
        publishing.guard.cache.push(packet);
        Ok(())
    }

    async fn handle_audio(&mut self, timestamp: u32, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(publishing) = self.publishing.as_mut() else {
            tracing::trace!(session_id = self.state.id, "Audio outside publishing state, dropped");
            return Ok(());
        };

        let tag = TagView::Audio(data.clone());
        let is_header = tag.is_audio_sequence_header();

        if is_header {
            if let Some(config_bytes) = tag.config_payload() {
                match AudioSpecificConfig::parse(config_bytes) {
                    Ok(config) => {
                        tracing::debug!(session_id = self.state.id,
                            profile = config.profile_name(),
                            sample_rate = config.sampling_frequency,
                            channels = config.channel_configuration,
                            "Audio sequence header");
                        publishing.audio_config = Some(config);
                    }
                    Err(e) => {
                        tracing::warn!(session_id = self.state.id, error = %e,
                            "Bad audio sequence header, keeping raw bytes");
                    }
                }
            }
        }

        let packet = Packet::audio(timestamp, data, is_header);
        publishing.sinks.append(&packet).await;
        publishing.guard.cache.push(packet);
        Ok(())
    }

    async fn handle_video(&mut self, timestamp: u32, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(publishing) = self.publishing.as_mut() else {
            tracing::trace!(session_id = self.state.id, "Video outside publishing state, dropped");
            return Ok(());
        };

        let tag = TagView::Video(data.clone());
        let is_header = tag.is_video_sequence_header();
        let is_keyframe = tag.is_keyframe();

        if is_header {
            if let Some(config_bytes) = tag.config_payload() {
                match tag.video_codec() {
                    Some(VideoCodec::Avc) => match AvcConfig::parse(config_bytes) {
                        Ok(config) => {
                            tracing::debug!(session_id = self.state.id,
                                profile = config.profile_name(),
                                level = config.level,
                                "AVC sequence header");
                            publishing.video_config = Some(ParsedVideoConfig::Avc(config));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = self.state.id, error = %e,
                                "Bad AVC sequence header, keeping raw bytes");
                        }
                    },
                    Some(VideoCodec::Hevc) => match HevcConfig::parse(config_bytes) {
                        Ok(config) => {
                            tracing::debug!(session_id = self.state.id,
                                profile = config.profile,
                                level = config.level,
                                "HEVC sequence header");
                            publishing.video_config = Some(ParsedVideoConfig::Hevc(config));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = self.state.id, error = %e,
                                "Bad HEVC sequence header, keeping raw bytes");
                        }
                    },
                    None => {}
                }
            }
        }

        let packet = Packet::video(timestamp, data, is_keyframe, is_header);
        publishing.sinks.append(&packet).await;
        publishing.guard.cache.push(packet);
        Ok(())
    }

    // === outbound helpers (valid until the writer moves to a player task) ===

    async fn send_message(&mut self, csid: u32, stream_id: u32, msg: &RtmpMessage) -> Result<()> {
        let (message_type, payload) = msg.encode();
        let chunk = RtmpChunk { csid, timestamp: 0, message_type, stream_id, payload };

        let writer = self.writer.as_mut().ok_or(Error::ConnectionClosed)?;
        self.write_buf.clear();
        self.chunk_encoder.encode(&chunk, &mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_command(&mut self, stream_id: u32, cmd: &Command) -> Result<()> {
        let mut cmd = cmd.clone();
        cmd.stream_id = stream_id;
        self.send_message(CSID_COMMAND, stream_id, &RtmpMessage::Command(cmd)).await
    }

    async fn send_data(&mut self, stream_id: u32, data: &DataMessage) -> Result<()> {
        self.send_message(CSID_COMMAND, stream_id, &RtmpMessage::Data(data.clone())).await
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }
}

/// Dedicated egress task of one player session
///
/// Owns the write half, its chunk encoder and the cursor. Wakes on the
/// publisher's cache, drains whatever the cursor yields, and rebases
/// timestamps so the first delivered a/v packet goes out at 0.
struct PlayerWriter<S> {
    session_id: u64,
    stream_id: u32,
    writer: BufWriter<WriteHalf<S>>,
    encoder: ChunkEncoder,
    cache: Arc<GopCache>,
    cursor: Cursor,
    write_buf: BytesMut,
    /// Publisher timestamp that maps to player timestamp 0
    ts_epoch: Option<u32>,
    unflushed_bytes: usize,
    unflushed_packets: usize,
}

impl<S> PlayerWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self, catchup: Vec<Packet>) {
        if let Err(e) = self.run_inner(catchup).await {
            tracing::debug!(session_id = self.session_id, error = %e, "Player writer ended");
        }
    }

    async fn run_inner(&mut self, catchup: Vec<Packet>) -> Result<()> {
        for packet in catchup {
            self.send_packet(&packet).await?;
        }
        self.flush().await?;

        loop {
            match self.cursor.poll() {
                CursorRead::Packet(packet) => {
                    self.send_packet(&packet).await?;
                    if self.unflushed_bytes >= WRITER_FLUSH_BYTES
                        || self.unflushed_packets >= WRITER_FLUSH_PACKETS
                    {
                        self.flush().await?;
                    }
                }
                CursorRead::Lagged { resync } => {
                    tracing::warn!(session_id = self.session_id,
                        "Player lagged, resyncing from keyframe");
                    for packet in resync {
                        self.send_packet(&packet).await?;
                    }
                }
                CursorRead::CaughtUp { write_seq } => {
                    self.flush().await?;
                    self.cache.wait_beyond(write_seq).await;
                }
                CursorRead::Closed => {
                    self.flush().await?;
                    self.send_stream_end().await?;
                    tracing::info!(session_id = self.session_id, "Publisher ended, player closing");
                    return Ok(());
                }
            }
        }
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        use crate::media::PacketKind;

        // config and metadata go out at time zero; the epoch starts at
        // the first real a/v packet
        let timestamp = if packet.is_sequence_header || packet.kind == PacketKind::Metadata {
            0
        } else {
            let epoch = *self.ts_epoch.get_or_insert(packet.timestamp);
            packet.timestamp.wrapping_sub(epoch)
        };

        let (csid, message_type) = match packet.kind {
            PacketKind::Audio => (CSID_AUDIO, MSG_AUDIO),
            PacketKind::Video => (CSID_VIDEO, MSG_VIDEO),
            PacketKind::Metadata => (CSID_COMMAND, MSG_DATA_AMF0),
        };

        let chunk = RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id: self.stream_id,
            payload: packet.payload.clone(),
        };

        self.write_buf.clear();
        self.encoder.encode(&chunk, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        self.unflushed_bytes += self.write_buf.len();
        self.unflushed_packets += 1;
        Ok(())
    }

    async fn send_stream_end(&mut self) -> Result<()> {
        let (message_type, payload) =
            RtmpMessage::UserControl(UserControlEvent::StreamEof(self.stream_id)).encode();
        let chunk = RtmpChunk {
            csid: CSID_USER_CONTROL,
            timestamp: 0,
            message_type,
            stream_id: 0,
            payload,
        };
        self.write_buf.clear();
        self.encoder.encode(&chunk, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;

        let status = Command::on_status(self.stream_id, "status", NS_PLAY_STOP, "Stream ended.");
        let (message_type, payload) = RtmpMessage::Command(status).encode();
        let chunk = RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type,
            stream_id: self.stream_id,
            payload,
        };
        self.write_buf.clear();
        self.encoder.encode(&chunk, &mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.unflushed_bytes > 0 || self.unflushed_packets > 0 {
            self.writer.flush().await?;
            self.unflushed_bytes = 0;
            self.unflushed_packets = 0;
        }
        Ok(())
    }
}
