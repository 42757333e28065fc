//! Simple RTMP server with publish/play fan-out
//!
//! Run with: cargo run --example simple_server
//!
//! ## Publishing (send stream)
//!
//! With OBS:
//!   Server: rtmp://localhost/live
//!   Stream Key: test
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test
//!
//! ## Playing (receive stream)
//!
//! With ffplay:
//!   ffplay rtmp://localhost/live/test
//!
//! Late joiners get the codec configuration and the most recent
//! keyframe-aligned GOP, so playback starts immediately. A second
//! publisher on the same stream key is refused with
//! NetStream.Publish.BadName.

use std::sync::Arc;

use rtmpd::{RtmpServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmpd=info".parse()?),
        )
        .init();

    let config = ServerConfig::with_addr("0.0.0.0:1935");
    let server = Arc::new(RtmpServer::new(config));

    println!("RTMP server on rtmp://localhost:1935");
    println!("  publish: ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test");
    println!("  play:    ffplay rtmp://localhost/live/test");
    println!("Press Ctrl+C to stop.");

    server
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
