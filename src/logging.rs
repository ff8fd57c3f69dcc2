//! Process-wide tracing setup shared by both binaries.
//!
//! Logs go to stderr so a collector's stdout only carries its run report.
//! `RUST_LOG` overrides the default directive.

use tracing_subscriber::EnvFilter;

pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A subscriber may already be installed (tests, embedding programs)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
