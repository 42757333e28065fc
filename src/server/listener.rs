//! Accept loops and server wiring
//!
//! One listener task per configured address; TCP `host:port` strings and
//! UNIX-domain socket paths (leading `/`) are both accepted. Each
//! connection runs in its own task; a panicking session is logged and
//! reaped without touching its neighbours.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::registry::PublisherRegistry;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;

/// Backoff bounds for transient accept errors
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// RTMP ingest/distribution server
pub struct RtmpServer {
    config: ServerConfig,
    registry: Arc<PublisherRegistry>,
    next_session_id: AtomicU64,
    connection_limit: Option<Arc<Semaphore>>,
}

impl RtmpServer {
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry: Arc::new(PublisherRegistry::new()),
            next_session_id: AtomicU64::new(1),
            connection_limit,
        }
    }

    /// The registry, shared with relay pullers and admin surfaces
    pub fn registry(&self) -> Arc<PublisherRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run all listeners until the process ends
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();
        for addr in self.config.listen_addrs.clone() {
            let server = Arc::clone(&self);
            handles.push(tokio::spawn(async move { server.listen_on(&addr).await }));
        }

        for handle in handles {
            match handle.await {
                Ok(Err(e)) => return Err(e),
                Err(e) => tracing::error!(error = %e, "Listener task failed"),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }

    /// Run until the shutdown future resolves
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = Arc::clone(&self).run() => result,
        }
    }

    async fn listen_on(self: Arc<Self>, addr: &str) -> Result<()> {
        if addr.starts_with('/') {
            #[cfg(unix)]
            {
                return self.listen_unix(addr).await;
            }
            #[cfg(not(unix))]
            {
                return Err(crate::error::Error::Config(format!(
                    "unix socket address {} on a non-unix platform",
                    addr
                )));
            }
        }
        self.listen_tcp(addr).await
    }

    async fn listen_tcp(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = addr, "RTMP server listening");

        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    backoff = ACCEPT_BACKOFF_START;
                    if self.config.tcp_nodelay {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!(error = %e, "set_nodelay failed");
                        }
                    }
                    self.spawn_session(socket, peer_addr.to_string());
                }
                Err(e) => {
                    // EMFILE/ECONNABORTED bursts: back off and retry
                    tracing::error!(error = %e, backoff_ms = backoff.as_millis() as u64,
                        "Accept error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }
    }

    #[cfg(unix)]
    async fn listen_unix(self: Arc<Self>, path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        use tokio::net::{UnixListener, UnixStream};

        let listener = match UnixListener::bind(path) {
            Ok(l) => l,
            Err(_) => {
                // A previous instance may have left the socket behind. If
                // nobody answers on it, it is stale: remove and rebind.
                if UnixStream::connect(path).await.is_ok() {
                    return Err(crate::error::Error::Config(format!(
                        "another process is listening on {}",
                        path
                    )));
                }
                std::fs::remove_file(path)?;
                UnixListener::bind(path)?
            }
        };

        // group read/write so local muxers can dial in
        let meta = std::fs::metadata(path)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o060);
        std::fs::set_permissions(path, perms)?;

        tracing::info!(path = path, "RTMP server listening on unix socket");

        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    backoff = ACCEPT_BACKOFF_START;
                    self.spawn_session(socket, format!("unix:{}", path));
                }
                Err(e) => {
                    tracing::error!(error = %e, backoff_ms = backoff.as_millis() as u64,
                        "Accept error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }
    }

    fn spawn_session<S>(&self, socket: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let permit = if let Some(ref limit) = self.connection_limit {
            match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer, "Connection refused: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);

        tracing::debug!(session_id = session_id, peer = %peer, "Accepted connection");

        let worker = tokio::spawn(async move {
            let _permit = permit;
            let mut connection = Connection::new(session_id, socket, peer, config, registry);
            if let Err(e) = connection.run().await {
                tracing::debug!(session_id = session_id, error = %e, "Session ended with error");
            }
            tracing::debug!(session_id = session_id, "Session closed");
        });

        // Panic isolation: reap the task and log; the server survives.
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    tracing::error!(session_id = session_id, panic = ?e, "Session task panicked");
                }
            }
        });
    }
}
