// src/bin/branch.rs

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use branch_ledger::logging::init_logging;
use branch_ledger::{AddressFamily, BranchConfig, BranchResponder, ConfigError, CsvSummaryProvider};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "branch")]
#[command(about = "Serve this branch's summary to the collector")]
struct Args {
    /// Identifier reported in every reply
    branch_id: String,

    /// `date,amount` CSV file summarized on each request
    data_source: PathBuf,

    port: u16,

    /// JSON config file; command-line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    address_family: Option<AddressFamily>,

    /// How long a client may take to send its request, in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,
}

impl Args {
    fn branch_config(&self) -> Result<BranchConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => BranchConfig::load(path)?,
            None => BranchConfig::default(),
        };
        config.branch_id = self.branch_id.clone();
        config.data_source = self.data_source.clone();
        config.port = self.port;
        if let Some(family) = self.address_family {
            config.address_family = family;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging("info");
    let args = Args::parse();

    let config = match args.branch_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let provider = Arc::new(CsvSummaryProvider::new(config.data_source.clone()));
    let responder = match BranchResponder::bind(&config, provider).await {
        Ok(responder) => responder,
        Err(e) => {
            error!(addr = %config.listen_addr(), error = %e, "Failed to start branch server");
            eprintln!("Error: cannot listen on port {}: {e}", config.port);
            return ExitCode::FAILURE;
        }
    };
    info!(
        branch = %config.branch_id,
        port = config.port,
        data_source = ?config.data_source,
        "Branch server ready"
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                // Keep the sender alive; the server then runs until killed
                error!(error = %e, "Cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    });

    responder.run(shutdown_rx).await;
    ExitCode::SUCCESS
}
