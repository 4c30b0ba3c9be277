use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use tracing::warn;

use crate::ledger::migrations::BASE_MIGRATION;
use crate::ledger::{Donation, ReceiptStatus, ScrapeMode, ScrapeProgress};

const INSERT_CHUNK: usize = 1_000;
const BATCH_RETRIES: u32 = 3;
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);
const NOTE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    Rejected,
}

pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(BASE_MIGRATION)?;
        Ok(())
    }

    /// Idempotent by transaction hash: a duplicate is a no-op, not an error.
    /// Failed receipts and records without a validated identity are never
    /// persisted.
    pub fn save_donation(&self, donation: &Donation) -> Result<InsertOutcome> {
        if donation.receipt_status == ReceiptStatus::Failed
            || donation.claimed_identity.is_empty()
        {
            warn!(
                "refusing to persist {}: failed receipt or missing identity",
                donation.tx_hash
            );
            return Ok(InsertOutcome::Rejected);
        }
        let changed = self.conn.execute(
            r#"
INSERT INTO donations (
    tx_hash, from_address, amount_eth, claimed_identity, raw_memo,
    message, block_number, tx_index, timestamp, receipt_status
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT (tx_hash) DO NOTHING
"#,
            params![
                donation.tx_hash,
                donation.from_address.to_lowercase(),
                donation.value_eth.to_string(),
                donation.claimed_identity,
                donation.raw_memo,
                donation.message,
                donation.block_number as i64,
                donation.tx_index as i64,
                donation.timestamp.to_rfc3339(),
                donation.receipt_status.as_str(),
            ],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    /// Bulk insert in fixed-size chunks. A failing chunk is retried as a unit
    /// a few times, then the error propagates so the caller leaves its cursor
    /// untouched.
    pub async fn save_batch(&self, donations: &[Donation]) -> Result<usize> {
        let mut inserted = 0;
        for chunk in donations.chunks(INSERT_CHUNK) {
            let mut attempt = 1;
            loop {
                match self.save_chunk(chunk) {
                    Ok(count) => {
                        inserted += count;
                        break;
                    }
                    Err(err) if attempt < BATCH_RETRIES => {
                        warn!(
                            "donation chunk insert failed (attempt {attempt}/{BATCH_RETRIES}): {err:#}"
                        );
                        attempt += 1;
                        tokio::time::sleep(BATCH_RETRY_DELAY).await;
                    }
                    Err(err) => {
                        return Err(err).context("donation chunk insert exhausted retries")
                    }
                }
            }
        }
        Ok(inserted)
    }

    fn save_chunk(&self, chunk: &[Donation]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        for donation in chunk {
            if self.save_donation(donation)? == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Upsert: the cursor row for a mode always reflects the latest fully
    /// ingested block.
    pub fn mark_progress(
        &self,
        mode: ScrapeMode,
        block_number: u64,
        transactions_found: usize,
    ) -> Result<()> {
        self.conn.execute(
            r#"
INSERT INTO scrape_progress (mode, last_block_number, transactions_found, updated_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (mode) DO UPDATE SET
    last_block_number = ?2,
    transactions_found = ?3,
    updated_at = ?4
"#,
            params![
                mode.as_slug(),
                block_number as i64,
                transactions_found as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// `None` means this mode has never completed a scrape; the caller
    /// substitutes the configured start block.
    pub fn progress(&self, mode: ScrapeMode) -> Result<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT last_block_number FROM scrape_progress WHERE mode = ?1")?;
        let result = stmt.query_row(params![mode.as_slug()], |row| row.get::<_, i64>(0));
        match result {
            Ok(block) => Ok(Some(block as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn progress_rows(&self) -> Result<Vec<ScrapeProgress>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT mode, last_block_number, transactions_found, updated_at
FROM scrape_progress
ORDER BY mode
"#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let mode_raw: String = row.get(0)?;
                let updated_raw: String = row.get(3)?;
                Ok(ScrapeProgress {
                    mode: ScrapeMode::from_str(&mode_raw).unwrap_or(ScrapeMode::Head),
                    last_block_number: row.get::<_, i64>(1)? as u64,
                    transactions_found: row.get::<_, i64>(2)? as u64,
                    updated_at: parse_timestamp(&updated_raw),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The allocator's input: every donation in strict chain order. Ordering
    /// is enforced here at read time, never assumed from insert order.
    pub fn donations_ordered(&self) -> Result<Vec<Donation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DONATION_COLUMNS} ORDER BY block_number ASC, tx_index ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_donation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn donations_after(&self, after: DateTime<Utc>) -> Result<Vec<Donation>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DONATION_COLUMNS} WHERE timestamp > ?1 ORDER BY timestamp ASC"
        ))?;
        let rows = stmt
            .query_map(params![after.to_rfc3339()], row_to_donation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Exact decimal sum of donations newer than `since`. Summation happens
    /// on parsed amounts, not in SQL, to keep the arithmetic precision-safe.
    pub fn total_donated_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let mut stmt = self
            .conn
            .prepare("SELECT amount_eth FROM donations WHERE timestamp > ?1")?;
        let amounts = stmt
            .query_map(params![since.to_rfc3339()], |row| {
                let raw: String = row.get(0)?;
                parse_amount(0, &raw)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(amounts.into_iter().sum())
    }

    /// Latest claimed identity recorded for a sender, if any.
    pub fn latest_identity_for(&self, from_address: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT claimed_identity
FROM donations
WHERE from_address = ?1
ORDER BY block_number DESC, tx_index DESC
LIMIT 1
"#,
        )?;
        let result = stmt.query_row(params![from_address.to_lowercase()], |row| {
            row.get::<_, String>(0)
        });
        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_note(&self, from_address: &str, message: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_notes (from_address, message, created_at) VALUES (?1, ?2, ?3)",
            params![
                from_address.to_lowercase(),
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Short-lived user-submitted note for donors using the plain
    /// wallet-transfer path. Expired notes are ignored.
    pub fn pending_note(&self, from_address: &str) -> Result<Option<String>> {
        let cutoff = (Utc::now() - chrono::Duration::minutes(NOTE_TTL_MINUTES)).to_rfc3339();
        let mut stmt = self.conn.prepare(
            r#"
SELECT message
FROM pending_notes
WHERE from_address = ?1 AND created_at > ?2
ORDER BY created_at DESC
LIMIT 1
"#,
        )?;
        let result = stmt.query_row(params![from_address.to_lowercase(), cutoff], |row| {
            row.get::<_, String>(0)
        });
        match result {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

const DONATION_COLUMNS: &str = r#"
SELECT tx_hash, from_address, amount_eth, claimed_identity, raw_memo,
       message, block_number, tx_index, timestamp, receipt_status
FROM donations
"#;

fn row_to_donation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Donation> {
    let amount_raw: String = row.get(2)?;
    let timestamp_raw: String = row.get(8)?;
    let status_raw: String = row.get(9)?;
    Ok(Donation {
        tx_hash: row.get(0)?,
        from_address: row.get(1)?,
        value_eth: parse_amount(2, &amount_raw)?,
        claimed_identity: row.get(3)?,
        raw_memo: row.get(4)?,
        message: row.get(5)?,
        block_number: row.get::<_, i64>(6)? as u64,
        tx_index: row.get::<_, i64>(7)? as u32,
        timestamp: parse_timestamp(&timestamp_raw),
        receipt_status: ReceiptStatus::parse(&status_raw),
    })
}

fn parse_amount(idx: usize, raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const FALLBACK_MESSAGES: &[&str] = &[
    "Spreading some love!",
    "Here's to making a difference!",
    "Good vibes only",
    "Because kindness is priceless",
    "Changing the world, one donation at a time",
    "Crypto for a cause!",
    "Every bit counts",
    "Let's make magic happen",
    "Because we're all in this together!",
    "Doing my part for the future",
    "Planting seeds for a better tomorrow",
    "A little goes a long way",
    "Supporting the dreamers, the doers, the change-makers!",
    "Every donation tells a story",
    "Good karma coming your way",
    "This one's for the greater good!",
    "A donation today, a better world tomorrow!",
];

pub fn fallback_message() -> String {
    FALLBACK_MESSAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Thanks for donating!")
        .to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use super::{fallback_message, InsertOutcome, LedgerStore};
    use crate::ledger::{Donation, ReceiptStatus, ScrapeMode};

    fn donation(hash: &str, block: u64, index: u32) -> Donation {
        Donation {
            tx_hash: hash.to_string(),
            from_address: "0xAbCd000000000000000000000000000000000001".to_string(),
            value_eth: dec!(0.05),
            claimed_identity: "tnam1qz9xyz".to_string(),
            raw_memo: "my address is tnam1qz9xyz".to_string(),
            message: "hi".to_string(),
            block_number: block,
            tx_index: index,
            timestamp: Utc.with_ymd_and_hms(2024, 12, 28, 12, 0, 0).unwrap(),
            receipt_status: ReceiptStatus::Success,
        }
    }

    #[test]
    fn duplicate_hash_is_a_noop() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        let d = donation("0xaaa", 10, 0);
        assert_eq!(
            store.save_donation(&d).expect("first insert"),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.save_donation(&d).expect("second insert"),
            InsertOutcome::Duplicate
        );
        let rows = store.donations_ordered().expect("load donations");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_eth, dec!(0.05));
    }

    #[test]
    fn failed_receipt_and_missing_identity_are_rejected() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        let mut failed = donation("0xbbb", 10, 0);
        failed.receipt_status = ReceiptStatus::Failed;
        assert_eq!(
            store.save_donation(&failed).expect("insert"),
            InsertOutcome::Rejected
        );

        let mut anonymous = donation("0xccc", 10, 1);
        anonymous.claimed_identity = String::new();
        assert_eq!(
            store.save_donation(&anonymous).expect("insert"),
            InsertOutcome::Rejected
        );
        assert!(store.donations_ordered().expect("load").is_empty());
    }

    #[test]
    fn donations_come_back_in_chain_order() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        store.save_donation(&donation("0x3", 20, 1)).unwrap();
        store.save_donation(&donation("0x1", 10, 4)).unwrap();
        store.save_donation(&donation("0x2", 20, 0)).unwrap();
        let hashes: Vec<String> = store
            .donations_ordered()
            .expect("load")
            .into_iter()
            .map(|d| d.tx_hash)
            .collect();
        assert_eq!(hashes, vec!["0x1", "0x2", "0x3"]);
    }

    #[test]
    fn progress_upsert_overwrites() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        assert_eq!(store.progress(ScrapeMode::Head).expect("progress"), None);
        store.mark_progress(ScrapeMode::Head, 100, 2).unwrap();
        store.mark_progress(ScrapeMode::Head, 101, 0).unwrap();
        store.mark_progress(ScrapeMode::Finalized, 90, 1).unwrap();
        assert_eq!(
            store.progress(ScrapeMode::Head).expect("progress"),
            Some(101)
        );
        assert_eq!(
            store.progress(ScrapeMode::Finalized).expect("progress"),
            Some(90)
        );
        assert_eq!(store.progress_rows().expect("rows").len(), 2);
    }

    #[tokio::test]
    async fn batch_insert_skips_duplicates_and_counts_new_rows() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        store.save_donation(&donation("0x1", 10, 0)).unwrap();
        let batch = vec![donation("0x1", 10, 0), donation("0x2", 11, 0)];
        let inserted = store.save_batch(&batch).await.expect("batch insert");
        assert_eq!(inserted, 1);
        assert_eq!(store.donations_ordered().expect("load").len(), 2);
    }

    #[test]
    fn pending_notes_expire() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        store.put_note("0xAAA", "fresh note").unwrap();
        assert_eq!(
            store.pending_note("0xaaa").expect("lookup"),
            Some("fresh note".to_string())
        );

        // Stale row inserted directly to bypass the timestamping in put_note.
        store
            .conn
            .execute(
                "INSERT INTO pending_notes (from_address, message, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    "0xbbb",
                    "stale note",
                    (Utc::now() - chrono::Duration::minutes(11)).to_rfc3339()
                ],
            )
            .unwrap();
        assert_eq!(store.pending_note("0xbbb").expect("lookup"), None);
    }

    #[test]
    fn decimal_sum_does_not_drift() {
        let store = LedgerStore::in_memory().expect("in-memory store");
        for i in 0..10 {
            let mut d = donation(&format!("0x{i}"), 10 + i, 0);
            d.value_eth = dec!(0.1);
            store.save_donation(&d).unwrap();
        }
        let total = store
            .total_donated_since(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .expect("sum");
        assert_eq!(total, dec!(1.0));
    }

    #[test]
    fn fallback_message_is_nonempty() {
        assert!(!fallback_message().is_empty());
    }
}
