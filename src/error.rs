//! Error taxonomy.
//!
//! Per-peer failures ([`PeerError`]) and per-result ledger failures
//! ([`LedgerError`]) are contained by the collector and surface only in the
//! run report. [`CollectorError`] is the only run-fatal error.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reply is missing the {label} field")]
    MissingField { label: &'static str },
    #[error("reply field {label} has invalid value {value:?}")]
    InvalidField { label: &'static str, value: String },
    #[error("branch reported an error: {message}")]
    BranchError { message: String },
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {peer} is unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("peer {peer} did not reply before the deadline")]
    TimedOut { peer: String },
    #[error("peer {peer} closed the connection before replying")]
    ClosedEarly { peer: String },
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] DecodeError),
    #[error("i/o error talking to peer {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger file {path:?} does not exist")]
    Missing { path: PathBuf },
    #[error("failed to lock ledger {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger lock {path:?} still held at the deadline")]
    LockTimedOut { path: PathBuf },
    #[error("failed to read ledger {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create temp file next to {path:?}: {source}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write staged ledger {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to rename staged ledger over {path:?}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger {path:?} line {line} is not a valid row")]
    Corrupt { path: PathBuf, line: usize },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("data source {source_path:?} unavailable: {reason}")]
    DataUnavailable {
        source_path: PathBuf,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no peers available: none of the {attempted} configured branches accepted a connection")]
    NoPeersAvailable { attempted: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
