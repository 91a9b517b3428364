//! Recorder wiring
//!
//! One task runs the connection manager, one runs the flush scheduler. They
//! share nothing but the ingest buffer. Shutdown runs in a fixed order inside
//! the grace period: stop reading, final flush, close the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::IngestBuffer;
use crate::config::Config;
use crate::connection::{ConnectionManager, SessionStatus};
use crate::error::RecorderError;
use crate::scheduler::{FlushScheduler, FlushStats};
use crate::server::{run_server, ServerState};
use crate::transport::{Transport, WsTransport};

pub struct Recorder {
    manager: ConnectionManager,
    scheduler: FlushScheduler,
    status: watch::Receiver<SessionStatus>,
    health_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
}

impl Recorder {
    /// Recorder streaming from the configured WebSocket URL.
    pub fn from_config(config: &Config) -> Result<Self, RecorderError> {
        let transport = WsTransport::new(&config.feed.url)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let (buffer, sealed) =
            IngestBuffer::new(config.flush.max_buffer_size, config.flush.max_sealed_batches);
        let buffer = Arc::new(buffer);
        let manager = ConnectionManager::new(config, transport, Arc::clone(&buffer));
        let scheduler = FlushScheduler::new(config, buffer, sealed);
        let status = manager.status();
        Self {
            manager,
            scheduler,
            status,
            health_addr: config.health_addr,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Record until `shutdown` is cancelled.
    ///
    /// Fails if shutdown overran its grace period or any batch was lost.
    pub async fn run(self, shutdown: CancellationToken) -> Result<FlushStats, RecorderError> {
        let connection_token = CancellationToken::new();
        let flush_token = CancellationToken::new();
        let server_token = CancellationToken::new();

        if let Some(addr) = self.health_addr {
            let state = ServerState::new(self.status.clone());
            let token = server_token.clone();
            tokio::spawn(async move {
                if let Err(e) = run_server(addr, state, token).await {
                    error!(error = %e, addr = %addr, "Health server failed");
                }
            });
        }

        let mut connection_task = tokio::spawn(self.manager.run(connection_token.clone()));
        let mut flush_task = tokio::spawn(self.scheduler.run(flush_token.clone()));

        shutdown.cancelled().await;
        info!(
            grace_secs = self.shutdown_grace.as_secs_f64(),
            "Shutdown requested, draining"
        );

        let ordered = async {
            connection_token.cancel();
            let stopped = (&mut connection_task)
                .await
                .map_err(|e| RecorderError::Task(format!("connection task: {}", e)))?;

            flush_token.cancel();
            let stats = (&mut flush_task)
                .await
                .map_err(|e| RecorderError::Task(format!("flush task: {}", e)))?;

            stopped.close().await;
            Ok::<_, RecorderError>(stats)
        };
        let outcome = tokio::time::timeout(self.shutdown_grace, ordered).await;
        server_token.cancel();

        let stats = match outcome {
            Ok(result) => result?,
            Err(_) => {
                error!(
                    grace_secs = self.shutdown_grace.as_secs_f64(),
                    "Shutdown grace period elapsed, aborting remaining tasks"
                );
                connection_task.abort();
                flush_task.abort();
                return Err(RecorderError::ShutdownTimeout(self.shutdown_grace));
            }
        };

        if stats.lost_batches > 0 {
            error!(lost_batches = stats.lost_batches, "Recorder stopped with data loss");
            return Err(RecorderError::DataLoss(stats.lost_batches));
        }
        info!(
            files_written = stats.files_written,
            rows_written = stats.rows_written,
            "Recorder stopped"
        );
        Ok(stats)
    }
}
