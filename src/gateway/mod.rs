pub mod history;
pub mod retry;
pub mod rpc;

use thiserror::Error;

use crate::ledger::ReceiptStatus;

/// Normalized transaction shape shared by both providers. Amounts stay as
/// wei strings until the decoder converts them.
#[derive(Debug, Clone)]
pub struct RawTx {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value_wei: String,
    pub input: String,
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_index: u32,
    pub receipt_status: ReceiptStatus,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Retries exhausted. Head-tracking callers treat this as "skip the
    /// tick"; backfill propagates it.
    #[error("{identifier} unavailable after {attempts} attempts: {message}")]
    Unavailable {
        identifier: String,
        attempts: u32,
        message: String,
    },
}

pub(crate) fn parse_hex_u64(raw: &str) -> anyhow::Result<u64> {
    let trimmed = raw.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .map_err(|e| anyhow::anyhow!("invalid hex quantity {raw}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::parse_hex_u64;

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
