//! Branch ledger: collects per-branch summaries over TCP and appends them to a
//! shared ledger file.
//!
//! The collector side lives in [`collector`], [`peer`], [`protocol`] and
//! [`ledger`]. The branch side ([`responder`], [`provider`]) answers one
//! `REQUEST` per connection.

pub mod collector;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod provider;
pub mod responder;
pub mod types;

pub use collector::{Collector, PeerOutcome, PeerReport, RunReport, RunStatus};
pub use config::{AddressFamily, BranchConfig, CollectorConfig, ReplyFraming};
pub use error::{
    CollectorError, ConfigError, DecodeError, LedgerError, PeerError, ProviderError,
};
pub use ledger::{LedgerEntry, LedgerWriter};
pub use peer::{ChannelState, PeerChannel};
pub use protocol::{decode_reply, BranchReply, REQUEST};
pub use provider::{CsvSummaryProvider, Summary, SummaryProvider};
pub use responder::BranchResponder;
pub use types::{BranchResult, PeerAddr};
