pub const BASE_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS donations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_hash TEXT NOT NULL UNIQUE,
    from_address TEXT NOT NULL,
    amount_eth TEXT NOT NULL,
    claimed_identity TEXT NOT NULL,
    raw_memo TEXT NOT NULL,
    message TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    tx_index INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    receipt_status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_donations_chain_order
    ON donations(block_number, tx_index);
CREATE INDEX IF NOT EXISTS idx_donations_sender
    ON donations(from_address);
CREATE INDEX IF NOT EXISTS idx_donations_identity
    ON donations(claimed_identity);
CREATE INDEX IF NOT EXISTS idx_donations_timestamp
    ON donations(timestamp);

CREATE TABLE IF NOT EXISTS scrape_progress (
    mode TEXT PRIMARY KEY,
    last_block_number INTEGER NOT NULL,
    transactions_found INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_address TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_notes_sender
    ON pending_notes(from_address, created_at DESC);
"#;
