use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::gateway::retry::{with_retry, RetryPolicy};
use crate::gateway::{parse_hex_u64, GatewayError, RawTx};
use crate::ledger::ReceiptStatus;

/// Providers cap a single txlist page at this many rows; a full page means
/// there may be more.
pub const PAGE_CAP: usize = 10_000;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;

/// Transaction-history API client (txlist-style, lags behind chain head).
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct TxListEnvelope {
    status: String,
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ProxyEnvelope {
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryTx {
    hash: String,
    from: String,
    to: Option<String>,
    value: String,
    input: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "transactionIndex")]
    transaction_index: String,
    #[serde(rename = "isError", default)]
    is_error: String,
    #[serde(rename = "txreceipt_status", default)]
    txreceipt_status: String,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, retry: RetryPolicy) -> Self {
        let http = Client::builder()
            .user_agent("donor-drop/0.1")
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to build history HTTP client");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry,
        }
    }

    pub async fn head_block_number(&self) -> Result<u64, GatewayError> {
        with_retry(&self.retry, "head block number", || async {
            let envelope: ProxyEnvelope = self
                .http
                .get(&self.base_url)
                .query(&[
                    ("module", "proxy"),
                    ("action", "eth_blockNumber"),
                    ("apikey", self.api_key.as_str()),
                ])
                .send()
                .await
                .context("failed eth_blockNumber request")?
                .error_for_status()?
                .json()
                .await
                .context("invalid eth_blockNumber response")?;
            let raw = envelope
                .result
                .context("eth_blockNumber returned no result")?;
            parse_hex_u64(&raw)
        })
        .await
    }

    /// All transactions for an address across a block range, transparently
    /// following the provider's page cap.
    pub async fn list_transactions(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawTx>, GatewayError> {
        paginate(from_block, PAGE_CAP, |start| {
            self.page_with_retry(address, start, to_block)
        })
        .await
    }

    async fn page_with_retry(
        &self,
        address: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<RawTx>, GatewayError> {
        let identifier = format!("txlist {address} [{start_block}, {end_block}]");
        with_retry(&self.retry, &identifier, || {
            self.fetch_page(address, start_block, end_block)
        })
        .await
    }

    async fn fetch_page(
        &self,
        address: &str,
        start_block: u64,
        end_block: u64,
    ) -> anyhow::Result<Vec<RawTx>> {
        let params = [
            ("module", "account".to_string()),
            ("action", "txlist".to_string()),
            ("address", address.to_string()),
            ("startblock", start_block.to_string()),
            ("endblock", end_block.to_string()),
            ("sort", "asc".to_string()),
            ("apikey", self.api_key.clone()),
        ];
        let envelope: TxListEnvelope = self
            .http
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .context("failed txlist request")?
            .error_for_status()?
            .json()
            .await
            .context("invalid txlist response")?;

        if envelope.status != "1" {
            // The provider reports an empty result set as an error status.
            if envelope.message.starts_with("No transactions found") {
                return Ok(Vec::new());
            }
            bail!("history API error: {}", envelope.message);
        }

        let txs: Vec<HistoryTx> = serde_json::from_value(envelope.result)
            .context("unexpected txlist result shape")?;
        Ok(txs.iter().filter_map(normalize_history_tx).collect())
    }
}

/// Pagination loop shared with tests: fetch pages until one comes back under
/// the cap, restarting each continuation at the last seen block + 1 and
/// dropping duplicate hashes on the overlap.
pub async fn paginate<F, Fut>(
    from_block: u64,
    page_cap: usize,
    mut fetch_page: F,
) -> Result<Vec<RawTx>, GatewayError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<Vec<RawTx>, GatewayError>>,
{
    let mut all: Vec<RawTx> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor = from_block;
    loop {
        let page = fetch_page(cursor).await?;
        let page_len = page.len();
        let last_block = page.last().map(|tx| tx.block_number);
        for tx in page {
            if seen.insert(tx.hash.clone()) {
                all.push(tx);
            }
        }
        if page_len < page_cap {
            break;
        }
        let Some(last_block) = last_block else { break };
        let next = last_block + 1;
        if next <= cursor {
            // A full page inside a single block; the provider cannot page
            // further by block number.
            warn!("txlist page cap hit within block {cursor}, stopping pagination");
            break;
        }
        cursor = next;
    }
    Ok(all)
}

fn normalize_history_tx(tx: &HistoryTx) -> Option<RawTx> {
    let block_number = tx.block_number.parse::<u64>().ok()?;
    let tx_index = tx.transaction_index.parse::<u32>().ok()?;
    let timestamp = match tx.time_stamp.parse::<u64>() {
        Ok(ts) => ts,
        Err(_) => {
            warn!("skipping {}: unparsable timestamp", tx.hash);
            return None;
        }
    };
    // txlist rows carry their receipt outcome inline.
    let receipt_status = if tx.is_error == "1" || tx.txreceipt_status == "0" {
        ReceiptStatus::Failed
    } else {
        ReceiptStatus::Success
    };
    Some(RawTx {
        hash: tx.hash.clone(),
        from: tx.from.clone(),
        to: tx.to.clone(),
        value_wei: tx.value.clone(),
        input: tx.input.clone(),
        timestamp,
        block_number,
        tx_index,
        receipt_status,
    })
}
