use bech32::Variant;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::warn;

use crate::gateway::RawTx;
use crate::ledger::{Donation, ReceiptStatus};

/// Memos are occasionally hex-encoded twice by wallet tooling; allow a few
/// extra passes but never loop unbounded.
const MAX_DECODE_PASSES: usize = 10;

const IDENTITY_HRP: &str = "tnam";
const TRANSFER_SELECTOR: &str = "0xa9059cbb";

static IDENTITY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"tnam[a-zA-Z0-9]+").expect("invalid identity pattern"));

#[derive(Debug, Clone, Copy)]
pub struct CampaignWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CampaignWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// A normalized transaction that passed the window and receipt filters.
/// `claimed_identity` may still be empty; the pipeline drops those before
/// persisting.
#[derive(Debug, Clone)]
pub struct DecodedTx {
    pub tx_hash: String,
    pub from_address: String,
    pub value_eth: Decimal,
    pub memo: String,
    pub claimed_identity: String,
    pub block_number: u64,
    pub tx_index: u32,
    pub timestamp: DateTime<Utc>,
    pub receipt_status: ReceiptStatus,
}

impl DecodedTx {
    pub fn has_identity(&self) -> bool {
        !self.claimed_identity.is_empty()
    }

    pub fn into_donation(self, message: String) -> Donation {
        Donation {
            tx_hash: self.tx_hash,
            from_address: self.from_address,
            value_eth: self.value_eth,
            claimed_identity: self.claimed_identity,
            raw_memo: self.memo,
            message,
            block_number: self.block_number,
            tx_index: self.tx_index,
            timestamp: self.timestamp,
            receipt_status: self.receipt_status,
        }
    }
}

pub fn decode_transactions(txs: &[RawTx], window: &CampaignWindow) -> Vec<DecodedTx> {
    txs.iter()
        .filter_map(|tx| decode_transaction(tx, window))
        .collect()
}

/// Per-transaction decode. Anything malformed degrades to `None` (or an
/// empty identity) rather than aborting the batch.
pub fn decode_transaction(tx: &RawTx, window: &CampaignWindow) -> Option<DecodedTx> {
    let Some(timestamp) = DateTime::<Utc>::from_timestamp(tx.timestamp as i64, 0) else {
        warn!("skipping {}: out-of-range timestamp {}", tx.hash, tx.timestamp);
        return None;
    };
    if !window.contains(timestamp) {
        return None;
    }
    if tx.receipt_status == ReceiptStatus::Failed {
        return None;
    }
    let Some(value_eth) = wei_to_eth(&tx.value_wei) else {
        warn!("skipping {}: unparsable value {}", tx.hash, tx.value_wei);
        return None;
    };
    let memo = decode_memo(&tx.input);
    let claimed_identity = extract_identity(&memo);
    Some(DecodedTx {
        tx_hash: tx.hash.clone(),
        from_address: tx.from.to_lowercase(),
        value_eth,
        memo,
        claimed_identity,
        block_number: tx.block_number,
        tx_index: tx.tx_index,
        timestamp,
        receipt_status: tx.receipt_status,
    })
}

/// Call data to memo text. A recognized structured call is rendered from its
/// typed arguments; anything else is treated as raw bytes with a bounded
/// second decode pass for doubly hex-encoded memos.
pub fn decode_memo(input: &str) -> String {
    if input.is_empty() || input == "0x" {
        return String::new();
    }
    if let Some(rendered) = decode_transfer_call(input) {
        return rendered;
    }
    let mut text = match hex::decode(input.trim_start_matches("0x")) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => return String::new(),
    };
    for _ in 0..MAX_DECODE_PASSES {
        let candidate = text.trim();
        if !looks_like_hex(candidate) {
            break;
        }
        match hex::decode(candidate.trim_start_matches("0x")) {
            Ok(bytes) => text = String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => break,
        }
    }
    text
}

/// First syntactic candidate that survives checksum validation wins; later
/// candidates are only considered when earlier ones fail the checksum.
pub fn extract_identity(memo: &str) -> String {
    for candidate in IDENTITY_PATTERN.find_iter(memo) {
        if is_valid_identity(candidate.as_str()) {
            return candidate.as_str().to_string();
        }
    }
    String::new()
}

fn is_valid_identity(candidate: &str) -> bool {
    match bech32::decode(candidate) {
        Ok((hrp, _, Variant::Bech32m)) => hrp == IDENTITY_HRP,
        _ => false,
    }
}

/// ERC-20 `transfer(address,uint256)`, the one structured call the campaign
/// saw in the wild.
fn decode_transfer_call(input: &str) -> Option<String> {
    if !input.starts_with(TRANSFER_SELECTOR) || input.len() != 138 {
        return None;
    }
    if !input[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let to = &input[34..74];
    let value_hex = input[74..138].trim_start_matches('0');
    let value = if value_hex.is_empty() {
        "0".to_string()
    } else {
        u128::from_str_radix(value_hex, 16)
            .map(|v| v.to_string())
            .unwrap_or_else(|_| format!("0x{value_hex}"))
    };
    Some(format!("transfer(0x{to}, {value})"))
}

fn looks_like_hex(text: &str) -> bool {
    let body = text.strip_prefix("0x").unwrap_or(text);
    !body.is_empty() && body.len() % 2 == 0 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// `None` for anything that is not a decimal string or does not fit in a
/// `Decimal` mantissa. Provider responses are untrusted input.
fn wei_to_eth(value_wei: &str) -> Option<Decimal> {
    let wei = value_wei.parse::<u128>().ok()?;
    let wei = i128::try_from(wei).ok()?;
    Decimal::try_from_i128_with_scale(wei, 18)
        .ok()
        .map(|d| d.normalize())
}

#[cfg(test)]
mod tests {
    use bech32::{ToBase32, Variant};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use super::{
        decode_memo, decode_transaction, extract_identity, wei_to_eth, CampaignWindow,
    };
    use crate::gateway::RawTx;
    use crate::ledger::ReceiptStatus;

    fn valid_identity() -> String {
        bech32::encode("tnam", [7u8; 20].to_base32(), Variant::Bech32m)
            .expect("bech32m encoding")
    }

    fn window() -> CampaignWindow {
        CampaignWindow {
            start: Utc.with_ymd_and_hms(2024, 12, 27, 15, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 1, 9, 15, 0, 0).unwrap(),
        }
    }

    fn raw_tx(input: &str, timestamp: u64) -> RawTx {
        RawTx {
            hash: "0xabc".to_string(),
            from: "0xSenderAA00000000000000000000000000000001".to_string(),
            to: Some("0xtarget".to_string()),
            value_wei: "50000000000000000".to_string(),
            input: input.to_string(),
            timestamp,
            block_number: 1200,
            tx_index: 3,
            receipt_status: ReceiptStatus::Success,
        }
    }

    fn in_window_ts() -> u64 {
        Utc.with_ymd_and_hms(2024, 12, 28, 12, 0, 0)
            .unwrap()
            .timestamp() as u64
    }

    #[test]
    fn extracts_the_identity_from_a_plain_memo() {
        let identity = valid_identity();
        let memo = format!("my address is {identity} thanks");
        assert_eq!(extract_identity(&memo), identity);
    }

    #[test]
    fn first_checksum_valid_candidate_wins_over_earlier_syntactic_match() {
        let identity = valid_identity();
        let memo = format!("tnam1notachecksum then {identity}");
        assert_eq!(extract_identity(&memo), identity);
    }

    #[test]
    fn no_valid_candidate_means_empty_identity() {
        assert_eq!(extract_identity("tnam1broken and nothing else"), "");
        assert_eq!(extract_identity("no candidates at all"), "");
    }

    #[test]
    fn memo_round_trips_through_hex() {
        let identity = valid_identity();
        let memo = format!("gift for {identity}");
        let input = format!("0x{}", hex::encode(&memo));
        let tx = raw_tx(&input, in_window_ts());
        let decoded = decode_transaction(&tx, &window()).expect("in-window decode");
        assert_eq!(decoded.memo, memo);
        assert_eq!(decoded.claimed_identity, identity);
        assert_eq!(decoded.value_eth, dec!(0.05));
    }

    #[test]
    fn doubly_encoded_memo_gets_a_second_pass() {
        let identity = valid_identity();
        let memo = format!("hi {identity}");
        let once = hex::encode(&memo);
        let twice = format!("0x{}", hex::encode(&once));
        assert_eq!(decode_memo(&twice), memo);
    }

    #[test]
    fn empty_call_data_is_an_empty_memo() {
        assert_eq!(decode_memo(""), "");
        assert_eq!(decode_memo("0x"), "");
    }

    #[test]
    fn structured_transfer_call_is_rendered_not_rawdecoded() {
        let input = format!(
            "{}{}{}",
            "0xa9059cbb",
            "000000000000000000000000a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0",
            "0000000000000000000000000000000000000000000000000de0b6b3a7640000"
        );
        let memo = decode_memo(&input);
        assert_eq!(
            memo,
            "transfer(0xa1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0, 1000000000000000000)"
        );
        // No identity inside a structured call.
        assert_eq!(extract_identity(&memo), "");
    }

    #[test]
    fn failed_receipts_are_filtered_even_with_a_valid_memo() {
        let identity = valid_identity();
        let input = format!("0x{}", hex::encode(format!("to {identity}")));
        let mut tx = raw_tx(&input, in_window_ts());
        tx.receipt_status = ReceiptStatus::Failed;
        assert!(decode_transaction(&tx, &window()).is_none());
    }

    #[test]
    fn out_of_window_transactions_are_filtered() {
        let before = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap().timestamp() as u64;
        let tx = raw_tx("0x", before);
        assert!(decode_transaction(&tx, &window()).is_none());
    }

    #[test]
    fn sender_address_is_normalized_to_lowercase() {
        let tx = raw_tx("0x", in_window_ts());
        let decoded = decode_transaction(&tx, &window()).expect("decode");
        assert_eq!(
            decoded.from_address,
            "0xsenderaa00000000000000000000000000000001"
        );
        assert!(!decoded.has_identity());
    }

    #[test]
    fn wei_conversion_is_exact() {
        assert_eq!(wei_to_eth("1").unwrap(), dec!(0.000000000000000001));
        assert_eq!(wei_to_eth("30000000000000000").unwrap(), dec!(0.03));
        assert!(wei_to_eth("not a number").is_none());
    }

    #[test]
    fn oversized_wei_value_is_skipped_not_fatal() {
        // 2^96 wei, one past the Decimal mantissa.
        let oversized = "79228162514264337593543950336";
        assert!(wei_to_eth(oversized).is_none());

        let mut tx = raw_tx("0x", in_window_ts());
        tx.value_wei = oversized.to_string();
        assert!(decode_transaction(&tx, &window()).is_none());
    }
}
