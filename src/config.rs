use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::allocator::AllocationParams;
use crate::decoder::CampaignWindow;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub history_api: HistoryApiConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_start_date")]
    pub start_date: DateTime<Utc>,
    #[serde(default = "default_end_date")]
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryApiConfig {
    #[serde(default = "default_history_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    #[serde(default = "default_head_interval")]
    pub head_interval_secs: u64,
    #[serde(default = "default_finalized_interval")]
    pub finalized_interval_secs: u64,
    #[serde(default = "default_safety_lag")]
    pub safety_lag_blocks: u64,
    #[serde(default = "default_receipt_batch_size")]
    pub receipt_batch_size: usize,
    #[serde(default = "default_backfill_batch_blocks")]
    pub backfill_batch_blocks: u64,
    #[serde(default = "default_backfill_batch_delay")]
    pub backfill_batch_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_min_donation")]
    pub min_donation_eth: Decimal,
    #[serde(default = "default_per_donor_cap")]
    pub per_donor_cap_eth: Decimal,
    #[serde(default = "default_total_budget")]
    pub total_budget_eth: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub verbose: bool,
}

/// CLI flags that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub address: Option<String>,
    pub db_path: Option<String>,
    pub verbose: bool,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/donor-drop/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed reading config: {}", path.display()))?;
            toml::from_str(&data)
                .with_context(|| format!("failed parsing TOML config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// API keys left blank in the file fall back to the environment.
    fn apply_env(&mut self) {
        if self.history_api.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var("ETHERSCAN_API_KEY") {
                self.history_api.api_key = key;
            }
        }
        if self.rpc.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var("RPC_API_KEY") {
                self.rpc.api_key = key;
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(address) = overrides.address {
            self.campaign.address = address;
        }
        if let Some(db_path) = overrides.db_path {
            self.storage.db_path = db_path;
        }
        if overrides.verbose {
            self.logging.verbose = true;
        }
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating config directory: {}", parent.display())
            })?;
        }
        fs::write(path, Self::default_template())
            .with_context(|| format!("failed writing config template: {}", path.display()))
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// JSON-RPC endpoint with the project key as the final path segment.
    pub fn rpc_endpoint(&self) -> String {
        let base = self.rpc.base_url.trim_end_matches('/');
        if self.rpc.api_key.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{}", self.rpc.api_key)
        }
    }

    pub fn window(&self) -> CampaignWindow {
        CampaignWindow {
            start: self.campaign.start_date,
            end: self.campaign.end_date,
        }
    }

    pub fn allocation_params(&self) -> AllocationParams {
        AllocationParams {
            min_donation: self.allocation.min_donation_eth,
            per_donor_cap: self.allocation.per_donor_cap_eth,
            total_budget: self.allocation.total_budget_eth,
        }
    }

    pub fn head_interval(&self) -> Duration {
        Duration::from_secs(self.scraper.head_interval_secs.max(1))
    }

    pub fn finalized_interval(&self) -> Duration {
        Duration::from_secs(self.scraper.finalized_interval_secs.max(1))
    }

    /// Copy safe to expose over the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.history_api.api_key = String::new();
        copy.rpc.api_key = String::new();
        copy
    }

    pub fn default_template() -> String {
        r#"[campaign]
address = "0x0000000000000000000000000000000000000000"
start_block = 0
start_date = "2024-12-27T15:00:00Z"
end_date = "2025-01-09T15:00:00Z"

[history_api]
base_url = "https://api-sepolia.etherscan.io/api"
api_key = ""

[rpc]
base_url = "https://sepolia.infura.io/v3"
api_key = ""

[storage]
db_path = "~/.local/share/donor-drop/ledger.db"

[scraper]
head_interval_secs = 1
finalized_interval_secs = 12
safety_lag_blocks = 50
receipt_batch_size = 50
backfill_batch_blocks = 30
backfill_batch_delay_secs = 1

[allocation]
min_donation_eth = "0.03"
per_donor_cap_eth = "0.3"
total_budget_eth = "27"

[logging]
verbose = false
"#
        .to_string()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            start_block: 0,
            start_date: default_start_date(),
            end_date: default_end_date(),
        }
    }
}

impl Default for HistoryApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_history_base_url(),
            api_key: String::new(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            base_url: default_rpc_base_url(),
            api_key: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            head_interval_secs: default_head_interval(),
            finalized_interval_secs: default_finalized_interval(),
            safety_lag_blocks: default_safety_lag(),
            receipt_batch_size: default_receipt_batch_size(),
            backfill_batch_blocks: default_backfill_batch_blocks(),
            backfill_batch_delay_secs: default_backfill_batch_delay(),
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            min_donation_eth: default_min_donation(),
            per_donor_cap_eth: default_per_donor_cap(),
            total_budget_eth: default_total_budget(),
        }
    }
}

fn default_start_date() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-12-27T15:00:00Z")
        .expect("invalid default campaign start date")
        .with_timezone(&Utc)
}

fn default_end_date() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-09T15:00:00Z")
        .expect("invalid default campaign end date")
        .with_timezone(&Utc)
}

fn default_history_base_url() -> String {
    "https://api-sepolia.etherscan.io/api".to_string()
}

fn default_rpc_base_url() -> String {
    "https://sepolia.infura.io/v3".to_string()
}

fn default_db_path() -> String {
    "~/.local/share/donor-drop/ledger.db".to_string()
}

fn default_head_interval() -> u64 {
    1
}

fn default_finalized_interval() -> u64 {
    12
}

fn default_safety_lag() -> u64 {
    50
}

fn default_receipt_batch_size() -> usize {
    50
}

fn default_backfill_batch_blocks() -> u64 {
    30
}

fn default_backfill_batch_delay() -> u64 {
    1
}

fn default_min_donation() -> Decimal {
    Decimal::new(3, 2)
}

fn default_per_donor_cap() -> Decimal {
    Decimal::new(3, 1)
}

fn default_total_budget() -> Decimal {
    Decimal::new(27, 0)
}
