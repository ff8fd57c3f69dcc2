//! Branch side of the protocol: one request per connection, one connection
//! at a time.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BranchConfig;
use crate::protocol::{is_request, BranchReply};
use crate::provider::SummaryProvider;
use crate::types::{format_amount, BranchResult};

pub struct BranchResponder {
    branch_id: String,
    listener: TcpListener,
    provider: Arc<dyn SummaryProvider>,
    request_timeout: Duration,
    max_request_bytes: usize,
}

impl BranchResponder {
    /// Bind the wildcard address of the configured family.
    pub async fn bind(
        config: &BranchConfig,
        provider: Arc<dyn SummaryProvider>,
    ) -> io::Result<Self> {
        Self::bind_addr(config.listen_addr(), config, provider).await
    }

    pub async fn bind_addr(
        addr: SocketAddr,
        config: &BranchConfig,
        provider: Arc<dyn SummaryProvider>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            branch_id: config.branch_id.clone(),
            listener,
            provider,
            request_timeout: config.request_timeout(),
            max_request_bytes: config.max_request_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        info!(
            branch = %self.branch_id,
            addr = ?self.listener.local_addr().ok(),
            "Branch listening"
        );

        loop {
            select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, remote)) => {
                            if let Err(e) = self.handle_client(socket, remote).await {
                                warn!(%remote, error = %e, "Client exchange failed");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        info!(branch = %self.branch_id, "Branch stopped");
    }

    async fn handle_client(&self, mut socket: TcpStream, remote: SocketAddr) -> io::Result<()> {
        let mut buf = vec![0u8; self.max_request_bytes];
        let n = match timeout(self.request_timeout, socket.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!(%remote, "Client sent no request in time");
                return Ok(());
            }
        };
        if n == 0 {
            debug!(%remote, "Client closed before sending a request");
            return Ok(());
        }
        if !is_request(&buf[..n]) {
            warn!(
                %remote,
                request = %String::from_utf8_lossy(&buf[..n]).trim_end(),
                "Unexpected request, closing"
            );
            return Ok(());
        }

        let reply = self.summarize().await;
        socket.write_all(reply.encode().as_bytes()).await?;
        socket.shutdown().await
    }

    async fn summarize(&self) -> BranchReply {
        let provider = Arc::clone(&self.provider);
        let summary = match spawn_blocking(move || provider.summarize()).await {
            Ok(summary) => summary,
            Err(join_err) => {
                warn!(error = %join_err, "Summary task failed");
                return BranchReply::Error("summary task failed".into());
            }
        };

        match summary {
            Ok(summary) => {
                info!(
                    branch = %self.branch_id,
                    records = summary.record_count,
                    subtotal = %format_amount(summary.subtotal),
                    "Serving summary"
                );
                BranchReply::Summary(BranchResult::new(
                    self.branch_id.clone(),
                    summary.record_count,
                    summary.subtotal,
                ))
            }
            Err(e) => {
                warn!(branch = %self.branch_id, error = %e, "Summary unavailable");
                BranchReply::Error(e.to_string())
            }
        }
    }
}
