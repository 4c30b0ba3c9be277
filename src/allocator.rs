use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::Donation;

/// Campaign reward parameters. All amounts are ETH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationParams {
    pub min_donation: Decimal,
    pub per_donor_cap: Decimal,
    pub total_budget: Decimal,
}

impl Default for AllocationParams {
    fn default() -> Self {
        Self {
            min_donation: Decimal::new(3, 2),  // 0.03
            per_donor_cap: Decimal::new(3, 1), // 0.3
            total_budget: Decimal::new(27, 0),
        }
    }
}

/// One row per claimed identity, in order of first appearance on chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub claimed_identity: String,
    pub total_contributed_eth: Decimal,
    pub eligible_eth: Decimal,
}

/// The transaction at which the budget became fully committed. Donations
/// ordered after it receive nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoffMarker {
    pub tx_hash: String,
    pub block_number: u64,
    pub tx_index: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReport {
    pub entries: Vec<AllocationEntry>,
    pub cutoff: Option<CutoffMarker>,
    pub total_committed_eth: Decimal,
}

impl AllocationReport {
    pub fn entry(&self, claimed_identity: &str) -> Option<&AllocationEntry> {
        let needle = claimed_identity.to_lowercase();
        self.entries.iter().find(|e| e.claimed_identity == needle)
    }
}

/// Deterministic, side-effect-free allocation over the full ledger.
///
/// Donations are walked in global chain order (`block_number`, `tx_index`
/// ascending), maintaining a per-identity cumulative sum and a global
/// committed sum. An identity becomes eligible once its cumulative total
/// crosses the minimum; its eligible amount tracks `min(cumulative, cap)`.
/// The donation whose delta would push the committed sum past the budget is
/// granted exactly the remainder, and everything after it gets zero. No
/// proportional scaling, strictly first come first served.
pub fn allocate(donations: &[Donation], params: &AllocationParams) -> AllocationReport {
    let mut ordered: Vec<&Donation> = donations
        .iter()
        .filter(|d| !d.claimed_identity.is_empty())
        .collect();
    // Re-sorted here on purpose: insert order is never trusted.
    ordered.sort_by_key(|d| (d.block_number, d.tx_index));

    let mut entries: Vec<AllocationEntry> = Vec::new();
    let mut cumulative: Vec<Decimal> = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut committed = Decimal::ZERO;
    let mut exhausted = false;
    let mut cutoff: Option<CutoffMarker> = None;

    for donation in ordered {
        let key = donation.claimed_identity.to_lowercase();
        let idx = *index_of.entry(key.clone()).or_insert_with(|| {
            entries.push(AllocationEntry {
                claimed_identity: key,
                total_contributed_eth: Decimal::ZERO,
                eligible_eth: Decimal::ZERO,
            });
            cumulative.push(Decimal::ZERO);
            entries.len() - 1
        });

        // Lifetime total keeps accumulating even past the cutoff.
        entries[idx].total_contributed_eth += donation.value_eth;
        if exhausted {
            continue;
        }

        cumulative[idx] += donation.value_eth;
        if cumulative[idx] < params.min_donation {
            continue;
        }
        let target = cumulative[idx].min(params.per_donor_cap);
        let delta = target - entries[idx].eligible_eth;
        if delta <= Decimal::ZERO {
            continue;
        }

        let remaining = params.total_budget - committed;
        if delta >= remaining {
            entries[idx].eligible_eth += remaining;
            committed = params.total_budget;
            exhausted = true;
            cutoff = Some(CutoffMarker {
                tx_hash: donation.tx_hash.clone(),
                block_number: donation.block_number,
                tx_index: donation.tx_index,
                timestamp: donation.timestamp,
            });
        } else {
            entries[idx].eligible_eth = target;
            committed += delta;
        }
    }

    AllocationReport {
        entries,
        cutoff,
        total_committed_eth: committed,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::{allocate, AllocationParams};
    use crate::ledger::{Donation, ReceiptStatus};

    fn donation(identity: &str, value: Decimal, block: u64, index: u32) -> Donation {
        Donation {
            tx_hash: format!("0x{block}-{index}"),
            from_address: "0xdonor".to_string(),
            value_eth: value,
            claimed_identity: identity.to_string(),
            raw_memo: identity.to_string(),
            message: String::new(),
            block_number: block,
            tx_index: index,
            timestamp: Utc.with_ymd_and_hms(2024, 12, 28, 0, 0, 0).unwrap(),
            receipt_status: ReceiptStatus::Success,
        }
    }

    fn params(min: Decimal, cap: Decimal, budget: Decimal) -> AllocationParams {
        AllocationParams {
            min_donation: min,
            per_donor_cap: cap,
            total_budget: budget,
        }
    }

    #[test]
    fn budget_boundary_is_first_come_first_served() {
        let donations = vec![
            donation("tnamaaa", dec!(0.05), 1, 0),
            donation("tnambbb", dec!(0.05), 2, 0),
            donation("tnamccc", dec!(0.05), 3, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(0.08)));

        assert_eq!(report.entry("tnamaaa").unwrap().eligible_eth, dec!(0.05));
        assert_eq!(report.entry("tnambbb").unwrap().eligible_eth, dec!(0.03));
        assert_eq!(report.entry("tnamccc").unwrap().eligible_eth, dec!(0));
        assert_eq!(report.total_committed_eth, dec!(0.08));

        let cutoff = report.cutoff.as_ref().expect("budget exhausted");
        assert_eq!(cutoff.block_number, 2);
        assert_eq!(cutoff.tx_index, 0);

        // Lifetime totals are unaffected by the cutoff.
        assert_eq!(
            report.entry("tnamccc").unwrap().total_contributed_eth,
            dec!(0.05)
        );
    }

    #[test]
    fn below_minimum_donors_get_nothing_until_they_cross_it() {
        let donations = vec![
            donation("tnamaaa", dec!(0.01), 1, 0),
            donation("tnamaaa", dec!(0.01), 2, 0),
            donation("tnamaaa", dec!(0.02), 3, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(27)));
        let entry = report.entry("tnamaaa").unwrap();
        assert_eq!(entry.total_contributed_eth, dec!(0.04));
        assert_eq!(entry.eligible_eth, dec!(0.04));
        assert!(report.cutoff.is_none());
    }

    #[test]
    fn per_donor_cap_limits_eligibility_not_totals() {
        let donations = vec![
            donation("tnamaaa", dec!(0.25), 1, 0),
            donation("tnamaaa", dec!(0.25), 2, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(27)));
        let entry = report.entry("tnamaaa").unwrap();
        assert_eq!(entry.total_contributed_eth, dec!(0.5));
        assert_eq!(entry.eligible_eth, dec!(0.3));
        assert_eq!(report.total_committed_eth, dec!(0.3));
    }

    #[test]
    fn exact_budget_fit_marks_the_cutoff_without_truncation() {
        let donations = vec![
            donation("tnamaaa", dec!(0.05), 1, 0),
            donation("tnambbb", dec!(0.03), 2, 0),
            donation("tnamccc", dec!(0.05), 3, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(0.08)));
        assert_eq!(report.entry("tnamaaa").unwrap().eligible_eth, dec!(0.05));
        assert_eq!(report.entry("tnambbb").unwrap().eligible_eth, dec!(0.03));
        assert_eq!(report.entry("tnamccc").unwrap().eligible_eth, dec!(0));
        assert_eq!(report.cutoff.expect("exhausted").block_number, 2);
    }

    #[test]
    fn identities_group_case_insensitively() {
        let donations = vec![
            donation("tnamAAA", dec!(0.02), 1, 0),
            donation("tnamaaa", dec!(0.02), 2, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(27)));
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].claimed_identity, "tnamaaa");
        assert_eq!(report.entries[0].eligible_eth, dec!(0.04));
    }

    #[test]
    fn ordering_comes_from_chain_position_not_insert_order() {
        let donations = vec![
            donation("tnambbb", dec!(0.05), 10, 1),
            donation("tnamaaa", dec!(0.05), 10, 0),
        ];
        let report = allocate(&donations, &params(dec!(0.03), dec!(0.3), dec!(0.05)));
        // Same block; tx_index breaks the tie.
        assert_eq!(report.entry("tnamaaa").unwrap().eligible_eth, dec!(0.05));
        assert_eq!(report.entry("tnambbb").unwrap().eligible_eth, dec!(0));
    }

    #[test]
    fn replay_produces_identical_output() {
        let donations = vec![
            donation("tnamaaa", dec!(0.04), 1, 0),
            donation("tnambbb", dec!(0.1), 2, 0),
            donation("tnamccc", dec!(0.02), 3, 0),
            donation("tnamccc", dec!(0.02), 4, 0),
        ];
        let p = params(dec!(0.03), dec!(0.3), dec!(0.15));
        let first = allocate(&donations, &p);
        let second = allocate(&donations, &p);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn donations_without_identity_are_ignored() {
        let donations = vec![donation("", dec!(1), 1, 0)];
        let report = allocate(&donations, &AllocationParams::default());
        assert!(report.entries.is_empty());
        assert_eq!(report.total_committed_eth, dec!(0));
    }
}
