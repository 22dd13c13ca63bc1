//! Measurement ingestion over a line-delimited TCP stream.
//!
//! One connection is served at a time. Every line is parsed and validated;
//! accepted samples replace the latest snapshot and are then evaluated by the
//! detector. A bad record is logged and skipped, never fatal.

use crate::activity_log;
use crate::detector::AbnormalityDetector;
use crate::vitals::{parse_record, LatestVitals};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub accepted: u64,
    pub rejected: u64,
}

pub struct IngestServer {
    latest: Arc<LatestVitals>,
    detector: Arc<AbnormalityDetector>,
}

impl IngestServer {
    pub fn new(latest: Arc<LatestVitals>, detector: Arc<AbnormalityDetector>) -> Self {
        Self { latest, detector }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind ingestion socket on {}", addr))
    }

    /// Accept connections until cancelled
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Ingestion listening on {}", addr);
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    info!("Measurement feed connected from {}", peer);
                    let stats = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        stats = self.serve_connection(stream) => stats,
                    };
                    info!(
                        accepted = stats.accepted,
                        rejected = stats.rejected,
                        "Measurement feed from {} closed", peer
                    );
                }
                Err(e) => warn!("Failed to accept ingestion connection: {}", e),
            }
        }
        debug!("Ingestion server stopped");
    }

    /// Read records until the peer closes the stream
    pub async fn serve_connection<R: AsyncRead + Unpin>(&self, reader: R) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Ingestion read failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(&line) {
                Ok(sample) => {
                    self.latest.update(sample.clone());
                    self.detector.evaluate(&sample);
                    stats.accepted += 1;
                }
                Err(e) => {
                    activity_log::log_sample_rejected(&e.to_string());
                    stats.rejected += 1;
                }
            }
        }
        stats
    }
}
