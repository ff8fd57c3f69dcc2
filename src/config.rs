//! Runtime configuration for both sides of the protocol.
//!
//! Both configs deserialize from JSON with every field optional; the binaries
//! load a file first (if given) and then apply command-line overrides.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_REPLY_BYTES: usize = 4096;
const DEFAULT_MAX_REQUEST_BYTES: usize = 128;
// Large enough for the longest well-formed request line
const MIN_BUFFER_BYTES: usize = 16;
// Read buffers are allocated up front
const MAX_BUFFER_BYTES: usize = 1 << 20;

/// Which address families are used when resolving or binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
    Dual,
}

impl AddressFamily {
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
            AddressFamily::Dual => true,
        }
    }

    /// Wildcard address a listener binds to for this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 | AddressFamily::Dual => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// How the collector reads a reply off a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFraming {
    /// One bounded read is the whole reply.
    #[default]
    SingleRead,
    /// Keep reading until an `END` line, EOF, or the byte bound.
    Sentinel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Shared deadline for all replies, started after every request is sent.
    pub reply_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_reply_bytes: usize,
    pub framing: ReplyFraming,
    pub address_family: AddressFamily,
    /// Write the default header if the ledger file does not exist yet.
    pub create_ledger: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
            framing: ReplyFraming::default(),
            address_family: AddressFamily::default(),
            create_ledger: false,
        }
    }
}

impl CollectorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid("reply_timeout_ms must be positive".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".into()));
        }
        check_buffer("max_reply_bytes", self.max_reply_bytes)?;
        Ok(())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub branch_id: String,
    pub data_source: PathBuf,
    pub port: u16,
    pub address_family: AddressFamily,
    /// How long an accepted client may take to send its request line.
    pub request_timeout_ms: u64,
    pub max_request_bytes: usize,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            branch_id: String::new(),
            data_source: PathBuf::new(),
            port: 0,
            address_family: AddressFamily::default(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl BranchConfig {
    pub fn new(branch_id: impl Into<String>, data_source: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            branch_id: branch_id.into(),
            data_source: data_source.into(),
            port,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branch_id.is_empty() || self.branch_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "branch id {:?} must be a non-empty token without whitespace",
                self.branch_id
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        check_buffer("max_request_bytes", self.max_request_bytes)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address_family.unspecified(), self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn check_buffer(name: &str, bytes: usize) -> Result<(), ConfigError> {
    if !(MIN_BUFFER_BYTES..=MAX_BUFFER_BYTES).contains(&bytes) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be between {MIN_BUFFER_BYTES} and {MAX_BUFFER_BYTES}, got {bytes}"
        )));
    }
    Ok(())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
