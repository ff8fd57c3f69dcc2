use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

// Amounts go over the wire and into the ledger with two decimals
const AMOUNT_SCALE: u32 = 2;

/// One branch's contribution to a run. Produced once per decoded reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch_id: String,
    pub record_count: u64,
    pub subtotal: Decimal,
}

impl BranchResult {
    pub fn new(branch_id: impl Into<String>, record_count: u64, subtotal: Decimal) -> Self {
        Self {
            branch_id: branch_id.into(),
            record_count,
            subtotal,
        }
    }
}

/// A configured branch endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Render an amount the way the wire protocol and the ledger expect (`12.50`).
pub fn format_amount(amount: Decimal) -> String {
    let mut rounded =
        amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(AMOUNT_SCALE);
    rounded.to_string()
}
