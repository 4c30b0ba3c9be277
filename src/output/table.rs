use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use rust_decimal::Decimal;

use crate::allocator::AllocationReport;
use crate::ledger::{Donation, ScrapeProgress};

pub fn render_allocation_table(report: &AllocationReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Identity",
        "Contributed (ETH)",
        "Eligible (ETH)",
        "Eligible",
    ]);

    for entry in &report.entries {
        let eligible = entry.eligible_eth > Decimal::ZERO;
        let elig_cell = if eligible {
            Cell::new("YES").fg(Color::Green)
        } else {
            Cell::new("NO").fg(Color::Red)
        };
        table.add_row(Row::from(vec![
            Cell::new(&entry.claimed_identity),
            Cell::new(entry.total_contributed_eth.to_string()),
            Cell::new(entry.eligible_eth.to_string()),
            elig_cell,
        ]));
    }

    let mut out = table.to_string();
    out.push_str(&format!(
        "\nTotal committed: {} ETH",
        report.total_committed_eth
    ));
    if let Some(cutoff) = &report.cutoff {
        out.push_str(&format!(
            "\nBudget exhausted at block {} (tx {})",
            cutoff.block_number, cutoff.tx_hash
        ));
    }
    out
}

pub fn render_donations_table(donations: &[Donation]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Block",
        "Tx",
        "From",
        "Amount (ETH)",
        "Identity",
        "Timestamp",
    ]);
    for donation in donations {
        table.add_row(vec![
            donation.block_number.to_string(),
            donation.tx_hash.clone(),
            donation.from_address.clone(),
            donation.value_eth.to_string(),
            donation.claimed_identity.clone(),
            donation.timestamp.to_rfc3339(),
        ]);
    }
    table.to_string()
}

pub fn render_progress_table(rows: &[ScrapeProgress]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Mode", "Last Block", "Tx Found", "Updated At"]);
    for row in rows {
        table.add_row(vec![
            row.mode.to_string(),
            row.last_block_number.to_string(),
            row.transactions_found.to_string(),
            row.updated_at.to_rfc3339(),
        ]);
    }
    table.to_string()
}
