//! Relay pull: mirror a stream from another RTMP server
//!
//! Run with: cargo run --example relay_pull -- rtmp://upstream/live/feed
//!
//! The puller plays the upstream stream and republishes it into this
//! server's registry, so local players use
//! rtmp://localhost/live/feed exactly as if the encoder pushed here
//! directly. Dial failures retry a bounded number of times.

use std::sync::Arc;

use rtmpd::{RelayConfig, RelayPuller, RtmpServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmpd=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: relay_pull <rtmp_url>");
        eprintln!("Example: relay_pull rtmp://upstream.example.com/live/feed");
        std::process::exit(1);
    }
    let url = args[1].clone();

    let server = Arc::new(RtmpServer::new(ServerConfig::with_addr("0.0.0.0:1935")));
    let registry = server.registry();

    let puller = RelayPuller::new(
        RelayConfig::new(url.as_str()).max_attempts(5),
        registry,
    );
    tokio::spawn(async move {
        if let Err(e) = puller.run().await {
            eprintln!("Relay ended: {}", e);
        }
    });

    println!("Pulling {} and serving it on rtmp://localhost:1935", url);
    server
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
