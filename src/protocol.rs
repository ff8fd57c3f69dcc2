//! Plain-text wire protocol between the collector and a branch.
//!
//! ```text
//! -> REQUEST
//! <- BRANCH_ID: A
//! <- RECORDS: 3
//! <- SUBTOTAL: 12.50
//! <- END
//! ```
//!
//! A branch that cannot produce a summary answers `ERROR: <message>` then
//! `END`. The decoder looks each label up independently, so field order in
//! the reply does not matter.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::DecodeError;
use crate::types::{format_amount, BranchResult};

pub const REQUEST: &str = "REQUEST\n";

const REQUEST_KEYWORD: &str = "REQUEST";
const BRANCH_ID_LABEL: &str = "BRANCH_ID:";
const RECORDS_LABEL: &str = "RECORDS:";
const SUBTOTAL_LABEL: &str = "SUBTOTAL:";
const ERROR_LABEL: &str = "ERROR:";
const END_LINE: &str = "END";

/// What a branch sends back for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BranchReply {
    Summary(BranchResult),
    Error(String),
}

impl BranchReply {
    pub fn encode(&self) -> String {
        match self {
            BranchReply::Summary(result) => format!(
                "{BRANCH_ID_LABEL} {}\n{RECORDS_LABEL} {}\n{SUBTOTAL_LABEL} {}\n{END_LINE}\n",
                result.branch_id,
                result.record_count,
                format_amount(result.subtotal)
            ),
            // Keep the reply one line per field even if the message spans lines
            BranchReply::Error(message) => format!(
                "{ERROR_LABEL} {}\n{END_LINE}\n",
                message.replace(['\r', '\n'], " ")
            ),
        }
    }
}

/// Whether a request buffer carries the request keyword.
pub fn is_request(buf: &[u8]) -> bool {
    String::from_utf8_lossy(buf).contains(REQUEST_KEYWORD)
}

/// Whether a reply buffer already holds its terminating `END` line.
pub fn has_terminator(buf: &[u8]) -> bool {
    String::from_utf8_lossy(buf)
        .lines()
        .any(|line| line.trim() == END_LINE)
}

/// Decode a raw reply into a [`BranchResult`]. All three fields must be
/// present and valid; there are no partial results.
pub fn decode_reply(buf: &[u8]) -> Result<BranchResult, DecodeError> {
    let text = String::from_utf8_lossy(buf);

    if let Some(message) = field(&text, ERROR_LABEL) {
        return Err(DecodeError::BranchError {
            message: message.to_string(),
        });
    }

    let branch_id = required(&text, BRANCH_ID_LABEL)?
        .split_whitespace()
        .next()
        .ok_or(DecodeError::InvalidField {
            label: BRANCH_ID_LABEL,
            value: String::new(),
        })?
        .to_string();

    let records = required(&text, RECORDS_LABEL)?;
    let record_count = records
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidField {
            label: RECORDS_LABEL,
            value: records.to_string(),
        })?;

    let subtotal = required(&text, SUBTOTAL_LABEL)?;
    let subtotal = Decimal::from_str(subtotal).map_err(|_| DecodeError::InvalidField {
        label: SUBTOTAL_LABEL,
        value: subtotal.to_string(),
    })?;

    Ok(BranchResult {
        branch_id,
        record_count,
        subtotal,
    })
}

fn required<'a>(text: &'a str, label: &'static str) -> Result<&'a str, DecodeError> {
    field(text, label).ok_or(DecodeError::MissingField { label })
}

// First line carrying the label wins
fn field<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    text.lines()
        .find_map(|line| line.trim_start().strip_prefix(label))
        .map(str::trim)
}
