//! Branch-local data sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::ProviderError;

/// Record count and total amount of one branch's data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub record_count: u64,
    pub subtotal: Decimal,
}

pub trait SummaryProvider: Send + Sync + 'static {
    fn summarize(&self) -> Result<Summary, ProviderError>;
}

/// Summarizes a `date,amount` CSV file. The first line is a header.
///
/// Every later line containing a comma counts as a record. An amount that
/// does not parse still counts as a record, contributing zero.
#[derive(Clone, Debug)]
pub struct CsvSummaryProvider {
    path: PathBuf,
}

impl CsvSummaryProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::DataUnavailable {
            source_path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl SummaryProvider for CsvSummaryProvider {
    fn summarize(&self) -> Result<Summary, ProviderError> {
        let contents =
            fs::read_to_string(&self.path).map_err(|e| self.unavailable(e.to_string()))?;
        let mut lines = contents.lines();
        if lines.next().is_none() {
            return Err(self.unavailable("missing header line"));
        }

        let mut summary = Summary::default();
        for (idx, line) in lines.enumerate() {
            let Some((_, rest)) = line.split_once(',') else {
                continue;
            };
            let amount = rest.split(',').next().unwrap_or_default().trim();
            match Decimal::from_str(amount) {
                Ok(amount) => summary.subtotal += amount,
                Err(_) => warn!(
                    path = ?self.path,
                    line = idx + 2,
                    amount,
                    "Unparsable amount counted as zero"
                ),
            }
            summary.record_count += 1;
        }
        Ok(summary)
    }
}
