//! RTMP server that records every published stream to an FLV file
//!
//! Run with: cargo run --example flv_recorder -- /tmp/recordings
//!
//! Publish with ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test
//!
//! Each publish creates `<dir>/<vhost>_<app>_<stream>.flv`. Players can
//! still pull the live stream while it records.
//!
//! # FLV file layout
//!
//! ```text
//! +============+==================+==============+==============+
//! | FLV Header | PrevTagSize0 (0) | Tag 1        | PrevTagSize1 | ...
//! | (9 bytes)  | (4 bytes)        | (11+N bytes) | (4 bytes)    |
//! +============+==================+==============+==============+
//! ```
//!
//! Tag types: 8 = audio, 9 = video, 18 = script data (metadata)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rtmpd::media::{Packet, PacketKind};
use rtmpd::{AppConfig, PacketSink, RtmpServer, ServerConfig};

const FLV_SIGNATURE: [u8; 3] = *b"FLV";
const FLV_VERSION: u8 = 0x01;
/// bit 0 = video present, bit 2 = audio present
const FLV_TYPE_FLAGS_AV: u8 = 0x05;
const FLV_HEADER_SIZE: u32 = 9;

const FLV_TAG_AUDIO: u8 = 8;
const FLV_TAG_VIDEO: u8 = 9;
const FLV_TAG_SCRIPT: u8 = 18;

struct FlvFileState {
    writer: BufWriter<File>,
    /// Publisher timestamp written as 0
    epoch: Option<u32>,
}

/// PacketSink writing one FLV file per publish
struct FlvFileSink {
    name: String,
    state: Mutex<FlvFileState>,
}

impl FlvFileSink {
    fn create(dir: &PathBuf, anchor: &str) -> std::io::Result<Self> {
        let file_name = format!("{}.flv", anchor.replace('/', "_"));
        let path = dir.join(file_name);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&FLV_SIGNATURE)?;
        writer.write_all(&[FLV_VERSION, FLV_TYPE_FLAGS_AV])?;
        writer.write_all(&FLV_HEADER_SIZE.to_be_bytes())?;
        writer.write_all(&0u32.to_be_bytes())?; // PreviousTagSize0

        println!("Recording to {}", path.display());
        Ok(Self {
            name: anchor.to_string(),
            state: Mutex::new(FlvFileState { writer, epoch: None }),
        })
    }
}

/// One FLV tag: 11-byte header, data, 4-byte previous-tag-size
fn write_flv_tag(
    writer: &mut impl Write,
    tag_type: u8,
    timestamp: u32,
    data: &[u8],
) -> std::io::Result<()> {
    let data_size = data.len() as u32;
    writer.write_all(&[tag_type])?;
    writer.write_all(&[
        ((data_size >> 16) & 0xFF) as u8,
        ((data_size >> 8) & 0xFF) as u8,
        (data_size & 0xFF) as u8,
    ])?;
    // lower 24 bits, then the upper 8 as the extension byte
    writer.write_all(&[
        ((timestamp >> 16) & 0xFF) as u8,
        ((timestamp >> 8) & 0xFF) as u8,
        (timestamp & 0xFF) as u8,
        ((timestamp >> 24) & 0xFF) as u8,
    ])?;
    writer.write_all(&[0, 0, 0])?; // stream id
    writer.write_all(data)?;
    writer.write_all(&(11 + data_size).to_be_bytes())?;
    Ok(())
}

#[async_trait]
impl PacketSink for FlvFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, packet: &Packet) -> rtmpd::Result<()> {
        let tag_type = match packet.kind {
            PacketKind::Audio => FLV_TAG_AUDIO,
            PacketKind::Video => FLV_TAG_VIDEO,
            PacketKind::Metadata => FLV_TAG_SCRIPT,
        };

        let mut state = self.state.lock().unwrap();
        let timestamp = if packet.is_sequence_header || packet.kind == PacketKind::Metadata {
            0
        } else {
            let epoch = *state.epoch.get_or_insert(packet.timestamp);
            packet.timestamp.wrapping_sub(epoch)
        };
        write_flv_tag(&mut state.writer, tag_type, timestamp, &packet.payload)?;
        Ok(())
    }

    async fn finish(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Err(e) = state.writer.flush() {
                eprintln!("Flush failed for {}: {}", self.name, e);
            }
        }
        println!("Recording finished: {}", self.name);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmpd=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let dir = PathBuf::from(args.get(1).map(String::as_str).unwrap_or("."));
    std::fs::create_dir_all(&dir)?;

    let recordings = dir.clone();
    let app_config = AppConfig {
        sink_factories: vec![Arc::new(move |anchor: &str| {
            match FlvFileSink::create(&recordings, anchor) {
                Ok(sink) => Arc::new(sink) as Arc<dyn PacketSink>,
                Err(e) => {
                    eprintln!("Cannot open recording for {}: {}", anchor, e);
                    Arc::new(NullSink)
                }
            }
        })],
        ..AppConfig::default()
    };

    let config = ServerConfig::with_addr("0.0.0.0:1935").app("live", app_config);
    let server = Arc::new(RtmpServer::new(config));

    println!("Recording RTMP server on rtmp://localhost:1935 (files under {})", dir.display());
    server
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

/// Fallback sink when the file cannot be created
struct NullSink;

#[async_trait]
impl PacketSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn append(&self, _packet: &Packet) -> rtmpd::Result<()> {
        Ok(())
    }
}
