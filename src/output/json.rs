use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;

use crate::allocator::AllocationReport;

/// NAM amounts in the genesis proposal use 6 decimal places.
const PROPOSAL_SCALE: u32 = 6;

pub fn render_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Genesis-proposal shape: identity to integer amount string, smallest unit,
/// fractions truncated. Identities with nothing allocated are omitted.
pub fn allocation_to_proposal(report: &AllocationReport) -> Result<String> {
    let scale = Decimal::from(10u64.pow(PROPOSAL_SCALE));
    let entries: Vec<_> = report
        .entries
        .iter()
        .filter(|entry| entry.eligible_eth > Decimal::ZERO)
        .map(|entry| {
            let amount = (entry.eligible_eth * scale).trunc().normalize();
            json!({
                "address": entry.claimed_identity.to_lowercase(),
                "amount": amount.to_string(),
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::allocation_to_proposal;
    use crate::allocator::{AllocationEntry, AllocationReport};

    #[test]
    fn proposal_amounts_are_truncated_integer_strings() {
        let report = AllocationReport {
            entries: vec![
                AllocationEntry {
                    claimed_identity: "tnamaaa".to_string(),
                    total_contributed_eth: dec!(0.0500009),
                    eligible_eth: dec!(0.0500009),
                },
                AllocationEntry {
                    claimed_identity: "tnambbb".to_string(),
                    total_contributed_eth: dec!(0.01),
                    eligible_eth: dec!(0),
                },
            ],
            cutoff: None,
            total_committed_eth: dec!(0.0500009),
        };
        let proposal = allocation_to_proposal(&report).expect("proposal");
        let parsed: serde_json::Value = serde_json::from_str(&proposal).expect("json");
        let entries = parsed.as_array().expect("array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["address"], "tnamaaa");
        assert_eq!(entries[0]["amount"], "50000");
    }
}
