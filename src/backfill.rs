use anyhow::Result;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::Config;
use crate::decoder::{decode_transactions, DecodedTx};
use crate::gateway::history::HistoryClient;
use crate::gateway::rpc::RpcClient;
use crate::gateway::RawTx;
use crate::ledger::{fallback_message, Donation, LedgerStore, ScrapeMode};
use crate::scheduler::apply_receipts;

/// One-shot catch-up before live scraping starts: the history API covers the
/// bulk range cheaply, then the finalized view replays anything it lagged on.
pub async fn run_backfill(
    config: &Config,
    history: &HistoryClient,
    rpc: &RpcClient,
    store: &LedgerStore,
) -> Result<()> {
    run_head_backfill(config, history, store).await?;
    run_finalized_backfill(config, rpc, store).await?;
    Ok(())
}

/// Bulk-load the campaign address history and park the head cursor a safety
/// lag behind the chain tip, so the live head scraper re-reads the blocks the
/// history API may not have indexed yet. Re-reads are idempotent.
pub async fn run_head_backfill(
    config: &Config,
    history: &HistoryClient,
    store: &LedgerStore,
) -> Result<()> {
    let head = history.head_block_number().await?;
    let start = match store.progress(ScrapeMode::Head)? {
        Some(last) => last + 1,
        None => config.campaign.start_block,
    };
    if head < start {
        info!("head backfill: nothing to do (head {head}, cursor {start})");
        return Ok(());
    }

    info!("head backfill: scanning blocks {start}..={head}");
    let txs = history
        .list_transactions(&config.campaign.address, start, head)
        .await?;
    let decoded: Vec<DecodedTx> = decode_transactions(&txs, &config.window())
        .into_iter()
        .filter(|tx| tx.has_identity())
        .collect();
    let last_seen = decoded.iter().map(|tx| tx.block_number).max();

    let donations = attach_messages(store, decoded)?;
    let inserted = store.save_batch(&donations).await?;
    let cursor = parked_head_cursor(head, config.scraper.safety_lag_blocks, last_seen);
    store.mark_progress(ScrapeMode::Head, cursor, donations.len())?;
    info!(
        "head backfill: {inserted} new donations, head cursor parked at {cursor}"
    );
    Ok(())
}

/// Walk the finalized view from its cursor up to the current finalized head
/// in bounded concurrent batches, persisting each batch before the next.
pub async fn run_finalized_backfill(
    config: &Config,
    rpc: &RpcClient,
    store: &LedgerStore,
) -> Result<()> {
    let finalized = rpc.finalized_block_number().await?;
    let mut cursor = match store.progress(ScrapeMode::Finalized)? {
        Some(last) => last + 1,
        None => config.campaign.start_block,
    };
    if finalized < cursor {
        info!("finalized backfill: nothing to do (finalized {finalized}, cursor {cursor})");
        return Ok(());
    }

    info!("finalized backfill: scanning blocks {cursor}..={finalized}");
    let batch_size = config.scraper.backfill_batch_blocks.max(1);
    let delay = std::time::Duration::from_secs(config.scraper.backfill_batch_delay_secs);

    while cursor <= finalized {
        let batch_end = batch_span(cursor, finalized, batch_size);
        let blocks: Vec<u64> = (cursor..=batch_end).collect();
        let results = join_all(
            blocks
                .iter()
                .map(|&block| rpc.block_transactions(block, true)),
        )
        .await;

        let (txs, last_ok) = contiguous_prefix(cursor, results)?;
        let Some(last_ok) = last_ok else {
            // First block of the batch is not finalized yet; the live
            // finalized scraper takes it from here.
            warn!("finalized backfill: block {cursor} not finalized yet, stopping");
            break;
        };

        let decoded: Vec<DecodedTx> = decode_transactions(&txs, &config.window())
            .into_iter()
            .filter(|tx| tx.has_identity())
            .collect();
        let confirmed = if decoded.is_empty() {
            Vec::new()
        } else {
            let hashes: Vec<String> = decoded.iter().map(|tx| tx.tx_hash.clone()).collect();
            let statuses = rpc.receipt_statuses(&hashes).await?;
            apply_receipts(decoded, &statuses)
        };
        let donations = attach_messages(store, confirmed)?;
        let inserted = store.save_batch(&donations).await?;
        store.mark_progress(ScrapeMode::Finalized, last_ok, donations.len())?;
        if inserted > 0 {
            info!(
                "finalized backfill: blocks {cursor}..={last_ok}, {inserted} new donations"
            );
        }

        if last_ok < batch_end {
            break;
        }
        cursor = last_ok + 1;
        if cursor <= finalized {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}

fn attach_messages(store: &LedgerStore, decoded: Vec<DecodedTx>) -> Result<Vec<Donation>> {
    decoded
        .into_iter()
        .map(|tx| {
            let message = match store.pending_note(&tx.from_address)? {
                Some(note) => note,
                None => fallback_message(),
            };
            Ok(tx.into_donation(message))
        })
        .collect()
}

/// Where the live head scraper resumes after a history-API backfill. The
/// cursor sits a safety lag behind the tip, so blocks the history index has
/// not caught up to get re-read. A donation already seen past that point
/// pulls the cursor forward; re-reads below it are idempotent either way.
fn parked_head_cursor(head: u64, safety_lag: u64, last_seen: Option<u64>) -> u64 {
    head.saturating_sub(safety_lag).max(last_seen.unwrap_or(0))
}

fn batch_span(cursor: u64, finalized: u64, batch_size: u64) -> u64 {
    cursor.saturating_add(batch_size - 1).min(finalized)
}

/// Keep results up to the first gap. A `None` means that block (and, since
/// finality is monotone, every later one) is not finalized yet; results past
/// the gap are discarded so the cursor never jumps over an unread block.
fn contiguous_prefix(
    first_block: u64,
    results: Vec<std::result::Result<Option<Vec<RawTx>>, crate::gateway::GatewayError>>,
) -> Result<(Vec<RawTx>, Option<u64>)> {
    let mut txs = Vec::new();
    let mut last_ok = None;
    for (offset, result) in results.into_iter().enumerate() {
        match result? {
            Some(block_txs) => {
                txs.extend(block_txs);
                last_ok = Some(first_block + offset as u64);
            }
            None => break,
        }
    }
    Ok((txs, last_ok))
}

#[cfg(test)]
mod tests {
    use super::{batch_span, contiguous_prefix, parked_head_cursor};
    use crate::gateway::RawTx;
    use crate::ledger::ReceiptStatus;

    fn tx(hash: &str, block: u64) -> RawTx {
        RawTx {
            hash: hash.to_string(),
            from: "0xsender".to_string(),
            to: Some("0xtarget".to_string()),
            value_wei: "1000".to_string(),
            input: "0x".to_string(),
            timestamp: 1_735_300_000,
            block_number: block,
            tx_index: 0,
            receipt_status: ReceiptStatus::Unknown,
        }
    }

    #[test]
    fn head_cursor_parks_a_safety_lag_behind_the_tip() {
        // No donations at all: the lag alone decides.
        assert_eq!(parked_head_cursor(1000, 50, None), 950);
        // Last donation well inside the lag window changes nothing.
        assert_eq!(parked_head_cursor(1000, 50, Some(900)), 950);
        // Last donation past the lag window pulls the cursor forward, so the
        // scraper resumes right after it instead of re-reading ingested blocks.
        assert_eq!(parked_head_cursor(1000, 50, Some(980)), 980);
        // Chain shorter than the lag.
        assert_eq!(parked_head_cursor(30, 50, None), 0);
    }

    #[test]
    fn batch_span_is_clamped_to_the_finalized_head() {
        assert_eq!(batch_span(100, 1000, 30), 129);
        assert_eq!(batch_span(990, 1000, 30), 1000);
        assert_eq!(batch_span(1000, 1000, 30), 1000);
    }

    #[test]
    fn prefix_stops_at_the_first_unfinalized_block() {
        let results = vec![
            Ok(Some(vec![tx("0xa", 100)])),
            Ok(Some(vec![])),
            Ok(None),
            Ok(Some(vec![tx("0xb", 103)])),
        ];
        let (txs, last_ok) = contiguous_prefix(100, results).expect("prefix");
        assert_eq!(last_ok, Some(101));
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].hash, "0xa");
    }

    #[test]
    fn empty_leading_result_leaves_the_cursor_alone() {
        let results = vec![Ok(None)];
        let (txs, last_ok) = contiguous_prefix(100, results).expect("prefix");
        assert!(txs.is_empty());
        assert_eq!(last_ok, None);
    }
}
