// tests/integration_test.rs
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use branch_ledger::ledger::{read_entries, DEFAULT_HEADER};
use branch_ledger::*;

const REPLY_TIMEOUT_MS: u64 = 600;

/// Test harness: a temp ledger plus any number of in-process branches
struct TestHarness {
    dir: TempDir,
    ledger: PathBuf,
    shutdowns: Vec<mpsc::Sender<()>>,
}

/// Scripted misbehaving branches
enum RawPeer {
    /// Reads the request and never answers
    Silent,
    /// Accepts and closes without reading or writing
    CloseImmediately,
    /// Reads the request and answers with these chunks, pausing in between
    Reply(Vec<&'static str>),
    /// Reads the request and answers after a pause
    Delayed(Duration, &'static str),
}

impl TestHarness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let ledger = dir.path().join("main.csv");
        fs::write(&ledger, DEFAULT_HEADER).unwrap();
        Self {
            dir,
            ledger,
            shutdowns: Vec::new(),
        }
    }

    async fn start_branch(&mut self, branch_id: &str, csv: Option<&str>) -> PeerAddr {
        let data_source = self.dir.path().join(format!("{branch_id}.csv"));
        if let Some(csv) = csv {
            fs::write(&data_source, csv).unwrap();
        }

        let config = BranchConfig::new(branch_id, &data_source, 0);
        let responder = BranchResponder::bind_addr(
            "127.0.0.1:0".parse().unwrap(),
            &config,
            Arc::new(CsvSummaryProvider::new(data_source)),
        )
        .await
        .unwrap();
        let port = responder.local_addr().unwrap().port();

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(responder.run(shutdown_rx));
        self.shutdowns.push(shutdown_tx);

        println!("Started branch {} on port {}", branch_id, port);
        PeerAddr::new("127.0.0.1", port)
    }

    async fn start_raw(&self, behaviour: RawPeer) -> PeerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            match behaviour {
                RawPeer::Silent => {
                    let mut buf = [0u8; 64];
                    let _ = socket.read(&mut buf).await;
                    sleep(Duration::from_secs(30)).await;
                }
                RawPeer::CloseImmediately => drop(socket),
                RawPeer::Delayed(pause, reply) => {
                    let mut buf = [0u8; 64];
                    let _ = socket.read(&mut buf).await;
                    sleep(pause).await;
                    let _ = socket.write_all(reply.as_bytes()).await;
                }
                RawPeer::Reply(chunks) => {
                    let mut buf = [0u8; 64];
                    let _ = socket.read(&mut buf).await;
                    for chunk in chunks {
                        // The collector may already have hung up
                        if socket.write_all(chunk.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = socket.flush().await;
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        PeerAddr::new("127.0.0.1", port)
    }

    async fn unreachable_peer(&self) -> PeerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        PeerAddr::new("127.0.0.1", port)
    }

    fn config(&self) -> CollectorConfig {
        CollectorConfig {
            reply_timeout_ms: REPLY_TIMEOUT_MS,
            connect_timeout_ms: 1_000,
            ..CollectorConfig::default()
        }
    }

    async fn run(&self, peers: &[PeerAddr]) -> Result<RunReport, CollectorError> {
        self.run_with(self.config(), peers).await
    }

    async fn run_with(
        &self,
        config: CollectorConfig,
        peers: &[PeerAddr],
    ) -> Result<RunReport, CollectorError> {
        let report = Collector::new(config).run(&self.ledger, peers).await;
        if let Ok(report) = &report {
            for peer in &report.peers {
                println!("{}: {}", peer.peer, peer.outcome);
            }
        }
        report
    }

    fn ledger_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.ledger)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn ledger_branches(&self) -> Vec<String> {
        let mut ids: Vec<_> = read_entries(&self.ledger)
            .unwrap()
            .into_iter()
            .map(|entry| entry.branch_id)
            .collect();
        ids.sort();
        ids
    }
}

fn columns(row: &str) -> Vec<&str> {
    row.split(',').collect()
}

#[tokio::test]
async fn test_no_reachable_peers_fails_without_touching_ledger() {
    let harness = TestHarness::new();
    let before = fs::read(&harness.ledger).unwrap();

    let peers = [
        harness.unreachable_peer().await,
        harness.unreachable_peer().await,
    ];
    let err = harness.run(&peers).await.unwrap_err();

    assert!(matches!(err, CollectorError::NoPeersAvailable { attempted: 2 }));
    assert_eq!(fs::read(&harness.ledger).unwrap(), before);
    assert!(!harness.dir.path().join("main.csv.lock").exists());
}

#[tokio::test]
async fn test_single_branch_scenario_appends_one_row() {
    let mut harness = TestHarness::new();
    let csv = "date,amount\n2024-01-01,10.00\n2024-01-02,2.00\n2024-01-03,0.50\n";
    let a = harness.start_branch("A", Some(csv)).await;
    let b = harness.unreachable_peer().await;

    let report = harness.run(&[a.clone(), b.clone()]).await.unwrap();

    let lines = harness.ledger_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "ts,branch,records,subtotal,ts2");
    let row = columns(&lines[1]);
    assert_eq!(&row[1..4], &["A", "3", "12.50"]);
    assert_eq!(row[0], row[4]);

    assert_eq!(report.status, RunStatus::Partial);
    assert!(report.outcome_for(&a).unwrap().is_committed());
    assert!(matches!(
        report.outcome_for(&b),
        Some(PeerOutcome::Unreachable { .. })
    ));
    assert_eq!((report.unreachable, report.timed_out), (1, 0));
}

#[tokio::test]
async fn test_all_branches_commit_exactly_once() {
    let mut harness = TestHarness::new();
    let a = harness.start_branch("A", Some("date,amount\nx,1.25\n")).await;
    let b = harness.start_branch("B", Some("date,amount\nx,2\ny,3\n")).await;
    let c = harness.start_branch("C", Some("date,amount\n")).await;

    let report = harness.run(&[a, b, c]).await.unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.succeeded, 3);
    assert_eq!(harness.ledger_branches(), ["A", "B", "C"]);

    let entries = read_entries(&harness.ledger).unwrap();
    let b_entry = entries.iter().find(|e| e.branch_id == "B").unwrap();
    assert_eq!(b_entry.record_count, 2);
    assert_eq!(b_entry.subtotal.to_string(), "5.00");
}

#[tokio::test]
async fn test_silent_branch_times_out_on_shared_deadline() {
    let mut harness = TestHarness::new();
    let a = harness.start_branch("A", Some("date,amount\nx,1\n")).await;
    let silent = harness.start_raw(RawPeer::Silent).await;
    let also_silent = harness.start_raw(RawPeer::Silent).await;

    let started = Instant::now();
    let report = harness
        .run(&[silent.clone(), a.clone(), also_silent.clone()])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // One deadline for everyone, not one per silent peer
    assert!(elapsed >= Duration::from_millis(REPLY_TIMEOUT_MS));
    assert!(elapsed < Duration::from_millis(2 * REPLY_TIMEOUT_MS), "{elapsed:?}");

    assert_eq!(report.timed_out, 2);
    assert!(matches!(report.outcome_for(&silent), Some(PeerOutcome::TimedOut)));
    assert!(report.outcome_for(&a).unwrap().is_committed());
    assert_eq!(harness.ledger_branches(), ["A"]);
}

#[tokio::test]
async fn test_malformed_reply_is_isolated() {
    let mut harness = TestHarness::new();
    let good = harness.start_branch("A", Some("date,amount\nx,1\n")).await;
    let bad = harness
        .start_raw(RawPeer::Reply(vec![
            "BRANCH_ID: Z\nRECORDS: oops\nSUBTOTAL: 1.0\nEND\n",
        ]))
        .await;

    let report = harness.run(&[bad.clone(), good]).await.unwrap();

    assert!(matches!(
        report.outcome_for(&bad),
        Some(PeerOutcome::Malformed { .. })
    ));
    assert_eq!(report.failed, 1);
    assert_eq!(harness.ledger_branches(), ["A"]);
}

#[tokio::test]
async fn test_branch_closing_early_is_reported() {
    let mut harness = TestHarness::new();
    let good = harness.start_branch("A", Some("date,amount\nx,1\n")).await;
    let closer = harness.start_raw(RawPeer::CloseImmediately).await;

    let report = harness.run(&[good, closer.clone()]).await.unwrap();

    assert!(matches!(
        report.outcome_for(&closer),
        Some(PeerOutcome::ClosedEarly) | Some(PeerOutcome::ReadFailed { .. })
    ));
    assert_eq!(harness.ledger_branches(), ["A"]);
}

#[tokio::test]
async fn test_branch_without_data_sends_error_reply() {
    let mut harness = TestHarness::new();
    let broken = harness.start_branch("Q", None).await;
    let before = fs::read(&harness.ledger).unwrap();

    let report = harness.run(&[broken.clone()]).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    match report.outcome_for(&broken) {
        Some(PeerOutcome::Malformed { reason }) => assert!(reason.contains("error"), "{reason}"),
        other => panic!("expected error reply, got {other:?}"),
    }
    assert_eq!(fs::read(&harness.ledger).unwrap(), before);
}

#[tokio::test]
async fn test_fragmented_reply_depends_on_framing() {
    let harness = TestHarness::new();
    let fragments = vec!["BRANCH_ID: F\nRECO", "RDS: 2\nSUBTOTAL: 4.20\nEND\n"];

    let single = harness.start_raw(RawPeer::Reply(fragments.clone())).await;
    let report = harness.run(&[single.clone()]).await.unwrap();
    assert!(matches!(
        report.outcome_for(&single),
        Some(PeerOutcome::Malformed { .. })
    ));

    let sentinel = harness.start_raw(RawPeer::Reply(fragments)).await;
    let config = CollectorConfig {
        framing: ReplyFraming::Sentinel,
        ..harness.config()
    };
    let report = harness.run_with(config, &[sentinel.clone()]).await.unwrap();
    assert!(report.outcome_for(&sentinel).unwrap().is_committed());
    assert_eq!(harness.ledger_branches(), ["F"]);
}

#[tokio::test]
async fn test_duplicate_branch_reports_are_both_logged() {
    let mut harness = TestHarness::new();
    let first = harness.start_branch("A", Some("date,amount\nx,1\n")).await;
    let second = harness
        .start_raw(RawPeer::Reply(vec!["BRANCH_ID: A\nRECORDS: 1\nSUBTOTAL: 1.00\nEND\n"]))
        .await;

    let report = harness.run(&[first, second]).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(harness.ledger_branches(), ["A", "A"]);
}

#[tokio::test]
async fn test_missing_ledger_is_per_result_failure() {
    let mut harness = TestHarness::new();
    fs::remove_file(&harness.ledger).unwrap();
    let a = harness.start_branch("A", Some("date,amount\nx,1\n")).await;

    let report = harness.run(&[a.clone()]).await.unwrap();

    assert!(matches!(
        report.outcome_for(&a),
        Some(PeerOutcome::LedgerWriteFailed { .. })
    ));
    assert!(!harness.ledger.exists());

    let config = CollectorConfig {
        create_ledger: true,
        ..harness.config()
    };
    let report = harness.run_with(config, &[a.clone()]).await.unwrap();
    assert!(report.outcome_for(&a).unwrap().is_committed());
    let lines = harness.ledger_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(format!("{}\n", lines[0]), DEFAULT_HEADER);
}

#[tokio::test]
async fn test_branch_serves_repeated_runs() {
    let mut harness = TestHarness::new();
    let a = harness.start_branch("A", Some("date,amount\nx,1\n")).await;

    for _ in 0..3 {
        let report = harness.run(&[a.clone()]).await.unwrap();
        assert_eq!(report.status, RunStatus::Complete);
    }

    assert_eq!(harness.ledger_lines().len(), 4);
}

#[tokio::test]
async fn test_held_ledger_lock_does_not_stretch_the_deadline() {
    let mut harness = TestHarness::new();
    let before = fs::read(&harness.ledger).unwrap();

    // Another writer holds the ledger for longer than the whole run
    let holder = fs::File::create(harness.dir.path().join("main.csv.lock")).unwrap();
    holder.lock_exclusive().unwrap();

    let quick = harness.start_branch("A", Some("date,amount\nx,1\n")).await;
    let late = harness
        .start_raw(RawPeer::Delayed(
            Duration::from_millis(800),
            "BRANCH_ID: B\nRECORDS: 1\nSUBTOTAL: 1.00\nEND\n",
        ))
        .await;
    let config = CollectorConfig {
        reply_timeout_ms: 300,
        ..harness.config()
    };

    let started = Instant::now();
    let report = harness
        .run_with(config, &[quick.clone(), late.clone()])
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
    match report.outcome_for(&quick) {
        Some(PeerOutcome::LedgerWriteFailed { result, reason }) => {
            assert_eq!(result.branch_id, "A");
            assert!(reason.contains("lock"), "{reason}");
        }
        other => panic!("expected ledger write failure, got {other:?}"),
    }
    assert!(matches!(report.outcome_for(&late), Some(PeerOutcome::TimedOut)));
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(fs::read(&harness.ledger).unwrap(), before);

    // Once the lock is released the same branch commits normally
    FileExt::unlock(&holder).unwrap();
    let report = harness.run(&[quick.clone()]).await.unwrap();
    assert!(report.outcome_for(&quick).unwrap().is_committed());
    assert_eq!(harness.ledger_branches(), ["A"]);
}
