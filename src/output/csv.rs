use anyhow::Result;
use rust_decimal::Decimal;

use crate::allocator::AllocationReport;
use crate::ledger::Donation;

pub fn allocation_to_csv(report: &AllocationReport) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record([
        "identity",
        "total_contributed_eth",
        "eligible_eth",
        "eligible",
    ])?;
    for entry in &report.entries {
        writer.write_record([
            entry.claimed_identity.clone(),
            entry.total_contributed_eth.to_string(),
            entry.eligible_eth.to_string(),
            (entry.eligible_eth > Decimal::ZERO).to_string(),
        ])?;
    }
    let data = writer.into_inner()?;
    Ok(String::from_utf8_lossy(&data).to_string())
}

pub fn donations_to_csv(donations: &[Donation]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record([
        "tx_hash",
        "block_number",
        "tx_index",
        "from_address",
        "value_eth",
        "claimed_identity",
        "timestamp",
    ])?;
    for donation in donations {
        writer.write_record([
            donation.tx_hash.clone(),
            donation.block_number.to_string(),
            donation.tx_index.to_string(),
            donation.from_address.clone(),
            donation.value_eth.to_string(),
            donation.claimed_identity.clone(),
            donation.timestamp.to_rfc3339(),
        ])?;
    }
    let data = writer.into_inner()?;
    Ok(String::from_utf8_lossy(&data).to_string())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use super::allocation_to_csv;
    use crate::allocator::{allocate, AllocationParams};
    use crate::ledger::{Donation, ReceiptStatus};

    #[test]
    fn allocation_csv_has_one_row_per_identity() {
        let donations = vec![Donation {
            tx_hash: "0xa".to_string(),
            from_address: "0xdonor".to_string(),
            value_eth: dec!(0.05),
            claimed_identity: "tnamaaa".to_string(),
            raw_memo: "tnamaaa".to_string(),
            message: String::new(),
            block_number: 1,
            tx_index: 0,
            timestamp: Utc.with_ymd_and_hms(2024, 12, 28, 0, 0, 0).unwrap(),
            receipt_status: ReceiptStatus::Success,
        }];
        let report = allocate(&donations, &AllocationParams::default());
        let csv = allocation_to_csv(&report).expect("csv");
        let lines: Vec<&str> = csv.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "tnamaaa,0.05,0.05,true");
    }
}
