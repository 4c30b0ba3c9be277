use std::time::Duration;

use anyhow::{bail, Context};
use futures::future::join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::gateway::retry::{with_retry, RetryPolicy};
use crate::gateway::{parse_hex_u64, GatewayError, RawTx};
use crate::ledger::ReceiptStatus;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 6;
const RECEIPT_BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Block/receipt API client (JSON-RPC, serves both head and finalized views).
/// Only transactions directed at the campaign address are surfaced.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: Client,
    endpoint: String,
    target_address: String,
    retry: RetryPolicy,
    receipt_batch_size: usize,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    number: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: String,
    timestamp: String,
    transactions: Vec<RpcTx>,
}

#[derive(Debug, Deserialize)]
struct RpcTx {
    hash: String,
    from: String,
    to: Option<String>,
    value: String,
    input: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "transactionIndex")]
    transaction_index: String,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    status: Option<String>,
}

impl RpcClient {
    pub fn new(
        endpoint: impl Into<String>,
        target_address: &str,
        retry: RetryPolicy,
        receipt_batch_size: usize,
    ) -> Self {
        let http = Client::builder()
            .user_agent("donor-drop/0.1")
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to build RPC HTTP client");
        Self {
            http,
            endpoint: endpoint.into(),
            target_address: target_address.to_lowercase(),
            retry,
            receipt_batch_size: receipt_batch_size.max(1),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> anyhow::Result<Option<T>> {
        let envelope: RpcEnvelope<T> = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1,
            }))
            .send()
            .await
            .with_context(|| format!("failed {method} request"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid {method} response"))?;
        if let Some(error) = envelope.error {
            bail!("{method} RPC error {}: {}", error.code, error.message);
        }
        Ok(envelope.result)
    }

    pub async fn finalized_block_number(&self) -> Result<u64, GatewayError> {
        with_retry(&self.retry, "finalized block number", || async {
            let header: Option<RpcBlockHeader> = self
                .call("eth_getBlockByNumber", json!(["finalized", false]))
                .await?;
            let header = header.context("no finalized block returned")?;
            parse_hex_u64(&header.number)
        })
        .await
    }

    /// `Ok(None)` means the block is not available yet (or not finalized yet
    /// in finalized view) and the caller should retry later. Providers can
    /// disagree about the finalized pointer: when it is already past the
    /// requested block, the same block is re-read through the head view.
    pub async fn block_transactions(
        &self,
        block_number: u64,
        finalized_view: bool,
    ) -> Result<Option<Vec<RawTx>>, GatewayError> {
        let identifier = format!("block {block_number}");
        with_retry(&self.retry, &identifier, || {
            self.fetch_block(block_number, finalized_view)
        })
        .await
    }

    async fn fetch_block(
        &self,
        block_number: u64,
        finalized_view: bool,
    ) -> anyhow::Result<Option<Vec<RawTx>>> {
        let mut finalized_view = finalized_view;
        loop {
            let tag = if finalized_view {
                json!("finalized")
            } else {
                json!(format!("0x{block_number:x}"))
            };
            let block: Option<RpcBlock> =
                self.call("eth_getBlockByNumber", json!([tag, true])).await?;
            let Some(block) = block else {
                debug!("block {block_number}: doesn't exist yet");
                return Ok(None);
            };

            if finalized_view {
                let finalized_head = parse_hex_u64(&block.number)?;
                if finalized_head > block_number {
                    // Already irreversible; re-read the requested block itself.
                    finalized_view = false;
                    continue;
                }
                if block_number > finalized_head {
                    debug!("block {block_number}: not finalized yet");
                    return Ok(None);
                }
            }

            let timestamp = parse_hex_u64(&block.timestamp)?;
            let txs = block
                .transactions
                .iter()
                .filter(|tx| {
                    tx.to
                        .as_deref()
                        .is_some_and(|to| to.eq_ignore_ascii_case(&self.target_address))
                })
                .map(|tx| normalize_rpc_tx(tx, timestamp))
                .collect::<anyhow::Result<Vec<_>>>()?;
            return Ok(Some(txs));
        }
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<ReceiptStatus, GatewayError> {
        let identifier = format!("tx {hash}");
        with_retry(&self.retry, &identifier, || async {
            let receipt: Option<RpcReceipt> = self
                .call("eth_getTransactionReceipt", json!([hash]))
                .await?;
            Ok(match receipt.and_then(|r| r.status) {
                Some(status) if status == "0x1" => ReceiptStatus::Success,
                Some(_) => ReceiptStatus::Failed,
                None => ReceiptStatus::Unknown,
            })
        })
        .await
    }

    /// Receipt statuses for a set of hashes, fetched in bounded concurrent
    /// batches with a pause between batches to respect provider rate limits.
    /// Each batch waits for all of its lookups before the next one starts.
    pub async fn receipt_statuses(
        &self,
        hashes: &[String],
    ) -> Result<Vec<ReceiptStatus>, GatewayError> {
        let mut statuses = Vec::with_capacity(hashes.len());
        for (i, batch) in hashes.chunks(self.receipt_batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(RECEIPT_BATCH_PAUSE).await;
            }
            let results =
                join_all(batch.iter().map(|hash| self.transaction_receipt(hash))).await;
            for result in results {
                statuses.push(result?);
            }
        }
        Ok(statuses)
    }
}

fn normalize_rpc_tx(tx: &RpcTx, timestamp: u64) -> anyhow::Result<RawTx> {
    Ok(RawTx {
        hash: tx.hash.clone(),
        from: tx.from.clone(),
        to: tx.to.clone(),
        value_wei: parse_hex_value(&tx.value)?,
        input: tx.input.clone(),
        timestamp,
        block_number: parse_hex_u64(&tx.block_number)?,
        tx_index: parse_hex_u64(&tx.transaction_index)? as u32,
        receipt_status: ReceiptStatus::Unknown,
    })
}

/// Hex wei quantity to a decimal string. Values can exceed u64, so the
/// conversion goes through u128.
fn parse_hex_value(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim_start_matches("0x");
    let value = u128::from_str_radix(trimmed, 16)
        .map_err(|e| anyhow::anyhow!("invalid hex value {raw}: {e}"))?;
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::parse_hex_value;

    #[test]
    fn converts_hex_wei_to_decimal_string() {
        // 0.05 ETH in wei.
        assert_eq!(
            parse_hex_value("0xb1a2bc2ec50000").unwrap(),
            "50000000000000000"
        );
        assert_eq!(parse_hex_value("0x0").unwrap(), "0");
        assert!(parse_hex_value("0xnope").is_err());
    }
}
