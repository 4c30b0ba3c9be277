use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use donor_drop::allocator::{allocate, AllocationParams};
use donor_drop::backfill::run_backfill;
use donor_drop::config::{Config, ConfigOverrides};
use donor_drop::gateway::history::HistoryClient;
use donor_drop::gateway::retry::RetryPolicy;
use donor_drop::gateway::rpc::RpcClient;
use donor_drop::ledger::{LedgerStore, ScrapeMode};
use donor_drop::output::csv::{allocation_to_csv, donations_to_csv};
use donor_drop::output::json::{allocation_to_proposal, render_json};
use donor_drop::output::table::{
    render_allocation_table, render_donations_table, render_progress_table,
};
use donor_drop::scheduler::{ScrapeTask, ScrapeTaskConfig};
use donor_drop::server::run_server;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Debug, Parser)]
#[command(
    name = "donor-drop",
    about = "Donation campaign scraper and allocation engine"
)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Campaign address to watch, overriding the config file.
    #[arg(short, long)]
    address: Option<String>,
    #[arg(long)]
    db_path: Option<String>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill, then scrape head and finalized views continuously.
    Run {
        #[arg(long)]
        skip_backfill: bool,
    },
    /// One-shot catch-up from the configured start block.
    Backfill,
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 3001)]
        port: u16,
    },
    /// Compute the allocation over everything in the ledger.
    Allocate {
        #[arg(long)]
        min_donation: Option<Decimal>,
        #[arg(long)]
        per_donor_cap: Option<Decimal>,
        #[arg(long)]
        total_budget: Option<Decimal>,
        /// Directory to write allocation.csv, allocation.json and
        /// proposal.json into.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Eligibility lookup for one identity or donor address.
    Check {
        #[arg(long)]
        eth_address: Option<String>,
        #[arg(long)]
        identity: Option<String>,
    },
    Donations {
        /// Only donations after this RFC 3339 timestamp.
        #[arg(long)]
        after: Option<String>,
    },
    Progress,
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(&config_path))?;
    config.apply_overrides(ConfigOverrides {
        address: cli.address.clone(),
        db_path: cli.db_path.clone(),
        verbose: cli.verbose,
    });

    if matches!(cli.command, Commands::Config { .. }) {
        return handle_config_command(&cli.command, &config, &config_path);
    }
    if let Commands::Serve { host, port } = &cli.command {
        let bind = format!("{host}:{port}");
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow!("invalid bind address {bind}: {e}"))?;
        return run_server(config, addr).await;
    }

    if config.campaign.address.trim().is_empty() {
        bail!("no campaign address configured; pass --address or set [campaign] address");
    }

    let db_path = config.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = LedgerStore::open(&db_path)?;

    match &cli.command {
        Commands::Run { skip_backfill } => {
            let (history, rpc) = build_clients(&config);
            if *skip_backfill {
                info!("skipping backfill");
            } else {
                run_backfill(&config, &history, &rpc, &store).await?;
            }
            run_scrapers(&config, rpc, db_path).await?;
        }
        Commands::Backfill => {
            let (history, rpc) = build_clients(&config);
            run_backfill(&config, &history, &rpc, &store).await?;
        }
        Commands::Allocate {
            min_donation,
            per_donor_cap,
            total_budget,
            export,
        } => {
            let mut params = config.allocation_params();
            apply_param_overrides(&mut params, *min_donation, *per_donor_cap, *total_budget);
            let donations = store.donations_ordered()?;
            let report = allocate(&donations, &params);
            match cli.output {
                OutputFormat::Table => println!("{}", render_allocation_table(&report)),
                OutputFormat::Json => println!("{}", render_json(&report)?),
                OutputFormat::Csv => println!("{}", allocation_to_csv(&report)?),
            }
            if let Some(dir) = export {
                std::fs::create_dir_all(dir)?;
                std::fs::write(dir.join("allocation.csv"), allocation_to_csv(&report)?)?;
                std::fs::write(dir.join("allocation.json"), render_json(&report)?)?;
                std::fs::write(dir.join("proposal.json"), allocation_to_proposal(&report)?)?;
                info!("allocation exports written to {}", dir.display());
            }
        }
        Commands::Check {
            eth_address,
            identity,
        } => {
            let identity = match (identity, eth_address) {
                (Some(identity), _) => Some(identity.clone()),
                (None, Some(address)) => store.latest_identity_for(address)?,
                (None, None) => bail!("provide --identity or --eth-address"),
            };
            let donations = store.donations_ordered()?;
            let report = allocate(&donations, &config.allocation_params());
            match identity.as_deref().and_then(|id| report.entry(id)) {
                Some(entry) => println!("{}", render_json(entry)?),
                None => println!(
                    "{}",
                    render_json(&serde_json::json!({
                        "identity": identity,
                        "total_contributed_eth": "0",
                        "eligible_eth": "0",
                    }))?
                ),
            }
        }
        Commands::Donations { after } => {
            let donations = match after.as_deref() {
                Some(raw) => {
                    let after = DateTime::parse_from_rfc3339(raw)
                        .map_err(|e| anyhow!("invalid --after timestamp: {e}"))?
                        .with_timezone(&Utc);
                    store.donations_after(after)?
                }
                None => store.donations_ordered()?,
            };
            match cli.output {
                OutputFormat::Table => println!("{}", render_donations_table(&donations)),
                OutputFormat::Json => println!("{}", render_json(&donations)?),
                OutputFormat::Csv => println!("{}", donations_to_csv(&donations)?),
            }
        }
        Commands::Progress => {
            let rows = store.progress_rows()?;
            match cli.output {
                OutputFormat::Table => println!("{}", render_progress_table(&rows)),
                _ => println!("{}", render_json(&rows)?),
            }
        }
        Commands::Config { .. } => {}
        Commands::Serve { .. } => unreachable!("serve command handled before dispatch"),
    }

    Ok(())
}

fn build_clients(config: &Config) -> (HistoryClient, RpcClient) {
    let history = HistoryClient::new(
        config.history_api.base_url.clone(),
        config.history_api.api_key.clone(),
        RetryPolicy::default(),
    );
    let rpc = RpcClient::new(
        config.rpc_endpoint(),
        &config.campaign.address,
        RetryPolicy::default(),
        config.scraper.receipt_batch_size,
    );
    (history, rpc)
}

/// Both scrapers run on the main task; the SQLite handles are not shareable
/// across threads, so each loop gets its own connection and they interleave
/// cooperatively.
async fn run_scrapers(config: &Config, rpc: RpcClient, db_path: PathBuf) -> Result<()> {
    let head_task = ScrapeTask::new(
        ScrapeTaskConfig {
            mode: ScrapeMode::Head,
            interval: config.head_interval(),
            default_cursor: config.campaign.start_block,
        },
        config.window(),
        rpc.clone(),
        LedgerStore::open(&db_path)?,
    );
    let finalized_task = ScrapeTask::new(
        ScrapeTaskConfig {
            mode: ScrapeMode::Finalized,
            interval: config.finalized_interval(),
            default_cursor: config.campaign.start_block,
        },
        config.window(),
        rpc,
        LedgerStore::open(&db_path)?,
    );
    tokio::join!(head_task.run(), finalized_task.run());
    Ok(())
}

fn apply_param_overrides(
    params: &mut AllocationParams,
    min_donation: Option<Decimal>,
    per_donor_cap: Option<Decimal>,
    total_budget: Option<Decimal>,
) {
    if let Some(value) = min_donation {
        params.min_donation = value;
    }
    if let Some(value) = per_donor_cap {
        params.per_donor_cap = value;
    }
    if let Some(value) = total_budget {
        params.total_budget = value;
    }
}

fn handle_config_command(command: &Commands, config: &Config, config_path: &PathBuf) -> Result<()> {
    let Commands::Config { init, show } = command else {
        return Ok(());
    };
    if *init {
        Config::write_template(config_path)?;
        println!("Wrote config template to {}", config_path.display());
    }
    if *show || !*init {
        println!("{}", render_json(&config.redacted())?);
    }
    Ok(())
}
