pub mod migrations;
pub mod store;

pub use store::{fallback_message, InsertOutcome, LedgerStore};

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which upstream view a polling loop tracks. Each mode owns its own
/// progress cursor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMode {
    Head,
    Finalized,
}

impl ScrapeMode {
    pub fn as_slug(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for ScrapeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_slug())
    }
}

impl FromStr for ScrapeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(Self::Head),
            "finalized" => Ok(Self::Finalized),
            other => Err(anyhow!("unknown scrape mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Unknown,
    Success,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// One qualifying on-chain transaction, persisted exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub tx_hash: String,
    pub from_address: String,
    pub value_eth: Decimal,
    pub claimed_identity: String,
    pub raw_memo: String,
    pub message: String,
    pub block_number: u64,
    pub tx_index: u32,
    pub timestamp: DateTime<Utc>,
    pub receipt_status: ReceiptStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeProgress {
    pub mode: ScrapeMode,
    pub last_block_number: u64,
    pub transactions_found: u64,
    pub updated_at: DateTime<Utc>,
}
