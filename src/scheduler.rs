use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::decoder::{decode_transactions, CampaignWindow, DecodedTx};
use crate::gateway::rpc::RpcClient;
use crate::ledger::{fallback_message, Donation, LedgerStore, ReceiptStatus, ScrapeMode};

#[derive(Debug, Clone)]
pub struct ScrapeTaskConfig {
    pub mode: ScrapeMode,
    pub interval: Duration,
    /// Block to start from when the ledger has no cursor for this mode.
    pub default_cursor: u64,
}

/// Periodic single-block scrape for one view of the chain. Two of these run
/// side by side: a fast head task and a slower finalized task writing into
/// the same ledger, deduplicated by transaction hash.
pub struct ScrapeTask {
    cfg: ScrapeTaskConfig,
    window: CampaignWindow,
    rpc: RpcClient,
    store: LedgerStore,
    busy: AtomicBool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The next block is not visible in this view yet.
    NotReady,
    Ingested { block_number: u64, inserted: usize },
    Skipped,
}

impl ScrapeTask {
    pub fn new(
        cfg: ScrapeTaskConfig,
        window: CampaignWindow,
        rpc: RpcClient,
        store: LedgerStore,
    ) -> Self {
        Self {
            cfg,
            window,
            rpc,
            store,
            busy: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "{} scraper started (every {:?})",
            self.cfg.mode, self.cfg.interval
        );
        loop {
            ticker.tick().await;
            match self.tick_guarded().await {
                Ok(TickOutcome::Ingested {
                    block_number,
                    inserted,
                }) if inserted > 0 => {
                    info!(
                        "{}: block {block_number} ingested, {inserted} new donations",
                        self.cfg.mode
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("{} scrape failed: {err:#}", self.cfg.mode),
            }
        }
    }

    /// Single-flight guard: if the previous tick is still running (slow
    /// provider, receipt batches) this tick is dropped, never queued.
    pub async fn tick_guarded(&self) -> Result<TickOutcome> {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!("{}: previous tick still running, skipping", self.cfg.mode);
            return Ok(TickOutcome::Skipped);
        }
        let _guard = BusyGuard(&self.busy);
        self.tick().await
    }

    async fn tick(&self) -> Result<TickOutcome> {
        let next_block = match self.store.progress(self.cfg.mode)? {
            Some(last) => last + 1,
            None => self.cfg.default_cursor,
        };
        let finalized_view = self.cfg.mode == ScrapeMode::Finalized;
        let Some(txs) = self.rpc.block_transactions(next_block, finalized_view).await? else {
            return Ok(TickOutcome::NotReady);
        };

        let decoded = decode_transactions(&txs, &self.window);
        let with_identity: Vec<DecodedTx> =
            decoded.into_iter().filter(|tx| tx.has_identity()).collect();

        let confirmed = if with_identity.is_empty() {
            Vec::new()
        } else {
            let hashes: Vec<String> =
                with_identity.iter().map(|tx| tx.tx_hash.clone()).collect();
            let statuses = self.rpc.receipt_statuses(&hashes).await?;
            apply_receipts(with_identity, &statuses)
        };

        let donations: Vec<Donation> = confirmed
            .into_iter()
            .map(|tx| {
                let message = self.resolve_message(&tx.from_address)?;
                Ok(tx.into_donation(message))
            })
            .collect::<Result<_>>()?;

        let inserted = self.store.save_batch(&donations).await?;
        // The cursor only moves after the block's donations are durable.
        self.store
            .mark_progress(self.cfg.mode, next_block, donations.len())
            .context("failed advancing scrape cursor")?;
        Ok(TickOutcome::Ingested {
            block_number: next_block,
            inserted,
        })
    }

    fn resolve_message(&self, from_address: &str) -> Result<String> {
        match self.store.pending_note(from_address)? {
            Some(note) => Ok(note),
            None => Ok(fallback_message()),
        }
    }
}

/// Clears the busy flag however the tick ends, including a panic or an
/// early return, so one bad tick can never wedge the scraper.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Zip decoded transactions with their receipt lookups, keeping only
/// confirmed successes. Unknown receipts are dropped, not persisted; the
/// other scrape mode picks the transaction up once it confirms.
pub fn apply_receipts(decoded: Vec<DecodedTx>, statuses: &[ReceiptStatus]) -> Vec<DecodedTx> {
    decoded
        .into_iter()
        .zip(statuses.iter())
        .filter(|(_, status)| **status == ReceiptStatus::Success)
        .map(|(mut tx, status)| {
            tx.receipt_status = *status;
            tx
        })
        .collect()
}
