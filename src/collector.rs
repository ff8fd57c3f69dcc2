//! Collector orchestrator.
//!
//! One run connects to every configured branch, sends each reachable one a
//! request, then waits for replies against a single deadline shared by all
//! of them. Each reply is decoded and committed to the ledger as soon as it
//! is observed; every per-peer failure stays confined to that peer.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{spawn_blocking, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::{CollectorError, PeerError};
use crate::ledger::{LedgerWriter, DEFAULT_HEADER};
use crate::peer::PeerChannel;
use crate::protocol::decode_reply;
use crate::types::{format_amount, BranchResult, PeerAddr};

/// What happened to one configured peer during a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PeerOutcome {
    Committed { result: BranchResult },
    Unreachable { reason: String },
    SendFailed { reason: String },
    TimedOut,
    ClosedEarly,
    ReadFailed { reason: String },
    Malformed { reason: String },
    LedgerWriteFailed { result: BranchResult, reason: String },
}

impl PeerOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, PeerOutcome::Committed { .. })
    }
}

impl From<PeerError> for PeerOutcome {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Unreachable { reason, .. } => PeerOutcome::Unreachable { reason },
            PeerError::TimedOut { .. } => PeerOutcome::TimedOut,
            PeerError::ClosedEarly { .. } => PeerOutcome::ClosedEarly,
            PeerError::MalformedReply(e) => PeerOutcome::Malformed {
                reason: e.to_string(),
            },
            err @ PeerError::Io { .. } => PeerOutcome::ReadFailed {
                reason: err.to_string(),
            },
        }
    }
}

impl fmt::Display for PeerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerOutcome::Committed { result } => write!(
                f,
                "committed {} ({} records, subtotal {})",
                result.branch_id,
                result.record_count,
                format_amount(result.subtotal)
            ),
            PeerOutcome::Unreachable { reason } => write!(f, "unreachable: {reason}"),
            PeerOutcome::SendFailed { reason } => write!(f, "request not sent: {reason}"),
            PeerOutcome::TimedOut => f.write_str("timed out"),
            PeerOutcome::ClosedEarly => f.write_str("closed without replying"),
            PeerOutcome::ReadFailed { reason } => write!(f, "read failed: {reason}"),
            PeerOutcome::Malformed { reason } => write!(f, "malformed reply: {reason}"),
            PeerOutcome::LedgerWriteFailed { result, reason } => {
                write!(f, "ledger write for {} failed: {reason}", result.branch_id)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub peer: PeerAddr,
    #[serde(flatten)]
    pub outcome: PeerOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every configured peer's result was committed.
    Complete,
    /// Some, but not all, peers were committed.
    Partial,
    /// Nothing was committed.
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub unreachable: usize,
    /// One entry per configured peer, in configuration order.
    pub peers: Vec<PeerReport>,
}

impl RunReport {
    fn new(peers: Vec<PeerReport>) -> Self {
        let count =
            |f: fn(&PeerOutcome) -> bool| peers.iter().filter(|p| f(&p.outcome)).count();
        let succeeded = count(PeerOutcome::is_committed);
        let timed_out = count(|o| matches!(o, PeerOutcome::TimedOut));
        let unreachable = count(|o| matches!(o, PeerOutcome::Unreachable { .. }));
        let failed = peers.len() - succeeded - timed_out - unreachable;

        let status = if succeeded == 0 {
            RunStatus::Failed
        } else if succeeded == peers.len() {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };

        Self {
            status,
            succeeded,
            failed,
            timed_out,
            unreachable,
            peers,
        }
    }

    /// Results committed to the ledger, in configuration order.
    pub fn committed(&self) -> impl Iterator<Item = &BranchResult> {
        self.peers.iter().filter_map(|p| match &p.outcome {
            PeerOutcome::Committed { result } => Some(result),
            _ => None,
        })
    }

    pub fn outcome_for(&self, peer: &PeerAddr) -> Option<&PeerOutcome> {
        self.peers
            .iter()
            .find(|p| &p.peer == peer)
            .map(|p| &p.outcome)
    }
}

// A finished read handed back from a channel's reader task, stamped with
// the moment the read ended
type Completion = (usize, PeerChannel, Result<Vec<u8>, PeerError>, Instant);

pub struct Collector {
    config: CollectorConfig,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub async fn run(
        &self,
        ledger_path: &Path,
        peers: &[PeerAddr],
    ) -> Result<RunReport, CollectorError> {
        self.config.validate()?;
        let writer = LedgerWriter::new(ledger_path);
        let mut outcomes: Vec<Option<PeerOutcome>> = vec![None; peers.len()];

        let channels = self.connect_all(peers, &mut outcomes).await;
        if channels.is_empty() {
            error!(attempted = peers.len(), "No branches available");
            return Err(CollectorError::NoPeersAvailable {
                attempted: peers.len(),
            });
        }

        if self.config.create_ledger {
            self.ensure_ledger(&writer).await;
        }

        // Send every request before the shared deadline starts
        let mut pending = Vec::with_capacity(channels.len());
        for (idx, mut channel) in channels {
            match channel.send_request().await {
                Ok(()) => pending.push((idx, channel)),
                Err(e) => {
                    warn!(peer = %channel.peer(), error = %e, "Failed to send request");
                    channel.retire();
                    outcomes[idx] = Some(PeerOutcome::SendFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.await_replies(&writer, peers, pending, &mut outcomes).await;

        let reports = peers
            .iter()
            .zip(outcomes)
            .map(|(peer, outcome)| PeerReport {
                peer: peer.clone(),
                // Every slot is filled by await_replies
                outcome: outcome.unwrap_or(PeerOutcome::TimedOut),
            })
            .collect();
        let report = RunReport::new(reports);

        info!(
            status = ?report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            unreachable = report.unreachable,
            "Collector run finished"
        );
        Ok(report)
    }

    async fn connect_all(
        &self,
        peers: &[PeerAddr],
        outcomes: &mut [Option<PeerOutcome>],
    ) -> Vec<(usize, PeerChannel)> {
        let handles: Vec<_> = peers
            .iter()
            .cloned()
            .map(|peer| {
                let family = self.config.address_family;
                let connect_timeout = self.config.connect_timeout();
                tokio::spawn(PeerChannel::connect(peer, family, connect_timeout))
            })
            .collect();

        let mut channels = Vec::new();
        for (idx, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.await {
                Ok(Ok(channel)) => {
                    channels.push((idx, channel));
                    continue;
                }
                Ok(Err(e)) => PeerOutcome::from(e),
                Err(join_err) => PeerOutcome::Unreachable {
                    reason: format!("connect task failed: {join_err}"),
                },
            };
            warn!(peer = %peers[idx], %outcome, "Could not connect to branch");
            outcomes[idx] = Some(outcome);
        }
        channels
    }

    async fn ensure_ledger(&self, writer: &LedgerWriter) {
        let writer = writer.clone();
        let deadline = std::time::Instant::now() + self.config.connect_timeout();
        match spawn_blocking(move || writer.initialize_before(DEFAULT_HEADER, deadline)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to create ledger"),
            Err(e) => error!(error = %e, "Ledger initialisation task failed"),
        }
    }

    // The only suspension point of a run: "some pending channel produced a
    // read, or the shared deadline passed". Ledger commits inside the loop
    // are bounded by the same deadline.
    async fn await_replies(
        &self,
        writer: &LedgerWriter,
        peers: &[PeerAddr],
        pending: Vec<(usize, PeerChannel)>,
        outcomes: &mut [Option<PeerOutcome>],
    ) {
        let mut remaining = pending.len();
        let (tx, mut rx) = mpsc::channel::<Completion>(remaining.max(1));
        let mut readers = JoinSet::new();
        for (idx, mut channel) in pending {
            let tx = tx.clone();
            let max_bytes = self.config.max_reply_bytes;
            let framing = self.config.framing;
            readers.spawn(async move {
                let read = channel.recv_reply(max_bytes, framing).await;
                let _ = tx.send((idx, channel, read, Instant::now())).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.config.reply_timeout();
        let mut abandoned_reason = None;
        while remaining > 0 {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((idx, mut channel, read, finished_at))) => {
                    let outcome = if finished_at > deadline {
                        // Queued behind a slow commit, but too late all the same
                        warn!(peer = %channel.peer(), "Reply arrived after the deadline");
                        PeerOutcome::from(PeerError::TimedOut {
                            peer: channel.peer().to_string(),
                        })
                    } else {
                        self.settle(writer, &channel, read, deadline).await
                    };
                    channel.mark(outcome.is_committed());
                    channel.retire();
                    outcomes[idx] = Some(outcome);
                    remaining -= 1;
                }
                Ok(None) => {
                    abandoned_reason = Some("reader task ended without a result");
                    break;
                }
                Err(_) => break,
            }
        }

        // Stop waiting: dropping the readers closes their sockets
        readers.abort_all();
        for (slot, peer) in outcomes.iter_mut().zip(peers) {
            if slot.is_some() {
                continue;
            }
            *slot = Some(match abandoned_reason {
                Some(reason) => PeerOutcome::ReadFailed {
                    reason: reason.to_string(),
                },
                None => PeerOutcome::from(PeerError::TimedOut {
                    peer: peer.to_string(),
                }),
            });
        }
        if remaining > 0 {
            warn!(
                remaining,
                timeout_ms = self.config.reply_timeout_ms,
                "Timeout waiting for branches"
            );
        }
    }

    async fn settle(
        &self,
        writer: &LedgerWriter,
        channel: &PeerChannel,
        read: Result<Vec<u8>, PeerError>,
        deadline: Instant,
    ) -> PeerOutcome {
        let peer = channel.peer();
        let result = match receive(peer, read) {
            Ok(result) => result,
            Err(e) => {
                warn!(%peer, error = %e, "Branch did not deliver a summary");
                return e.into();
            }
        };

        info!(
            %peer,
            branch = %result.branch_id,
            records = result.record_count,
            subtotal = %format_amount(result.subtotal),
            "Received summary"
        );

        let append = {
            let writer = writer.clone();
            let result = result.clone();
            let deadline = deadline.into_std();
            spawn_blocking(move || writer.append_before(&result, deadline)).await
        };
        let reason = match append {
            Ok(Ok(_)) => {
                info!(branch = %result.branch_id, path = ?writer.path(), "Ledger updated");
                return PeerOutcome::Committed { result };
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_err) => format!("ledger task failed: {join_err}"),
        };
        error!(branch = %result.branch_id, %reason, "Failed to update ledger");
        PeerOutcome::LedgerWriteFailed { result, reason }
    }
}

fn receive(peer: &PeerAddr, read: Result<Vec<u8>, PeerError>) -> Result<BranchResult, PeerError> {
    let buf = read?;
    decode_reply(&buf).map_err(|e| {
        debug!(%peer, reply = %String::from_utf8_lossy(&buf), "Rejected reply");
        PeerError::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn report(outcomes: Vec<PeerOutcome>) -> RunReport {
        RunReport::new(
            outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| PeerReport {
                    peer: PeerAddr::new("127.0.0.1", 5000 + i as u16),
                    outcome,
                })
                .collect(),
        )
    }

    fn committed(branch: &str) -> PeerOutcome {
        PeerOutcome::Committed {
            result: BranchResult::new(branch, 1, Decimal::ONE),
        }
    }

    #[test]
    fn counts_and_status() {
        let run = report(vec![
            committed("A"),
            PeerOutcome::TimedOut,
            PeerOutcome::Unreachable { reason: "refused".into() },
            PeerOutcome::Malformed { reason: "bad".into() },
            PeerOutcome::ClosedEarly,
        ]);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(
            (run.succeeded, run.failed, run.timed_out, run.unreachable),
            (1, 2, 1, 1)
        );
        assert_eq!(run.committed().count(), 1);

        assert_eq!(report(vec![committed("A"), committed("B")]).status, RunStatus::Complete);
        assert_eq!(report(vec![PeerOutcome::TimedOut]).status, RunStatus::Failed);
    }

    #[test]
    fn report_serializes_outcome_inline() {
        let run = report(vec![PeerOutcome::TimedOut]);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["peers"][0]["outcome"], "timed_out");
        assert_eq!(json["peers"][0]["peer"]["port"], 5000);
    }

    #[test]
    fn peer_errors_map_to_outcomes() {
        let peer = PeerAddr::new("127.0.0.1", 5001);
        let read = Ok(b"BRANCH_ID: A\nRECORDS: oops\nSUBTOTAL: 1.0\nEND\n".to_vec());
        let err = receive(&peer, read).unwrap_err();
        assert!(matches!(err, PeerError::MalformedReply(_)));
        assert!(matches!(PeerOutcome::from(err), PeerOutcome::Malformed { .. }));

        let timed_out = PeerError::TimedOut {
            peer: peer.to_string(),
        };
        assert_eq!(PeerOutcome::from(timed_out), PeerOutcome::TimedOut);

        let closed = receive(&peer, Err(PeerError::ClosedEarly { peer: peer.to_string() }));
        assert_eq!(PeerOutcome::from(closed.unwrap_err()), PeerOutcome::ClosedEarly);

        let good = Ok(b"BRANCH_ID: A\nRECORDS: 3\nSUBTOTAL: 12.50\nEND\n".to_vec());
        assert_eq!(
            receive(&peer, good).unwrap(),
            BranchResult::new("A", 3, Decimal::new(1250, 2))
        );
    }

    #[tokio::test]
    async fn empty_peer_list_has_no_peers_available() {
        let dir = tempfile::tempdir().unwrap();
        let err = Collector::new(CollectorConfig::default())
            .run(&dir.path().join("main.csv"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::NoPeersAvailable { attempted: 0 }));
    }
}
