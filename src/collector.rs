//! The UDP syslog ingest point.
//!
//! The Collector never blocks the Manager: it `try_send`s onto a bounded
//! channel and drops the datagram if the Manager is behind, which is
//! consistent with UDP's own loss semantics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::record::{self, SyslogRecord};

pub const INGEST_CHANNEL_CAPACITY: usize = 1024;

pub struct IngestEvent {
    pub source: SocketAddr,
    pub record: SyslogRecord,
}

/// Tracks datagrams dropped because the Manager's ingest channel was
/// full, for observability (not part of the wire protocol).
#[derive(Default)]
pub struct CollectorMetrics {
    pub dropped: AtomicU64,
    pub malformed: AtomicU64,
}

pub struct Collector {
    socket: UdpSocket,
    metrics: Arc<CollectorMetrics>,
}

impl Collector {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(%addr, "collector listening for syslog datagrams");
        Ok(Collector { socket, metrics: Arc::new(CollectorMetrics::default()) })
    }

    pub fn metrics(&self) -> Arc<CollectorMetrics> {
        self.metrics.clone()
    }

    /// Runs until the outbound channel is dropped (Manager shut down).
    pub async fn run(self, ingest: mpsc::Sender<IngestEvent>) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "collector socket read failed");
                    continue;
                }
            };
            let Some(record) = record::decode(&buf[..len], source) else {
                self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if ingest.try_send(IngestEvent { source, record }).is_err() {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
