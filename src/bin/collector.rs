// src/bin/collector.rs

use std::path::PathBuf;
use std::process::ExitCode;

use branch_ledger::logging::init_logging;
use branch_ledger::{
    AddressFamily, Collector, CollectorConfig, CollectorError, ConfigError, PeerAddr,
    ReplyFraming, RunReport,
};
use clap::error::ErrorKind;
use clap::Parser;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(about = "Collect branch summaries into the shared ledger")]
struct Args {
    /// Ledger file receiving one row per committed branch result
    ledger: PathBuf,

    /// Branch endpoints as HOST PORT pairs
    #[arg(required = true, num_args = 2.., value_name = "HOST PORT")]
    peers: Vec<String>,

    /// JSON config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared deadline for all replies, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    #[arg(long)]
    max_reply_bytes: Option<usize>,

    #[arg(long, value_enum)]
    framing: Option<ReplyFraming>,

    #[arg(long, value_enum)]
    address_family: Option<AddressFamily>,

    /// Create the ledger with its default header if it does not exist
    #[arg(long)]
    create_ledger: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid branch list: {0}")]
    Peers(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error("failed to render report: {0}")]
    Report(#[from] serde_json::Error),
}

impl Args {
    fn collector_config(&self) -> Result<CollectorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => CollectorConfig::load(path)?,
            None => CollectorConfig::default(),
        };
        if let Some(ms) = self.timeout_ms {
            config.reply_timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if let Some(bytes) = self.max_reply_bytes {
            config.max_reply_bytes = bytes;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(family) = self.address_family {
            config.address_family = family;
        }
        config.create_ledger |= self.create_ledger;
        config.validate()?;
        Ok(config)
    }

    fn peer_addrs(&self) -> Result<Vec<PeerAddr>, CliError> {
        if self.peers.len() % 2 != 0 {
            return Err(CliError::Peers(format!(
                "expected HOST PORT pairs, got {} values",
                self.peers.len()
            )));
        }
        self.peers
            .chunks(2)
            .map(|pair| {
                let port = pair[1]
                    .parse::<u16>()
                    .map_err(|_| CliError::Peers(format!("invalid port {:?}", pair[1])))?;
                Ok(PeerAddr::new(pair[0].clone(), port))
            })
            .collect()
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = args.collector_config()?;
    let peers = args.peer_addrs()?;

    let report = Collector::new(config).run(&args.ledger, &peers).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    for peer in &report.peers {
        println!("{}: {}", peer.peer, peer.outcome);
    }
    println!(
        "Collector finished: {:?} (succeeded {}, failed {}, timed out {}, unreachable {})",
        report.status, report.succeeded, report.failed, report.timed_out, report.unreachable
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging("info");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
