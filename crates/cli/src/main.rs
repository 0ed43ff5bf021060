//! Command Line Interface for the liquidity position keeper.
mod walk;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use lp_keeper_domain::{BinRange, InstanceId, StrategyConfig};
use lp_keeper_execution::prelude::*;
use lp_keeper_protocols::{PAPER_TOKEN_B, PaperVenue, RangeProvider};
use rust_decimal::Decimal;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use walk::MarketWalk;

const CONFIG_ENV: &str = "LP_KEEPER_CONFIG";

#[derive(Parser)]
#[command(name = "lp-keeper")]
#[command(about = "Liquidity position lifecycle keeper", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one strategy instance against the paper venue
    Run {
        /// Strategy config file (JSON); falls back to LP_KEEPER_CONFIG
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Monitoring cycles to run
        #[arg(short, long, default_value_t = 50)]
        ticks: u32,

        /// Starting active bin
        #[arg(long, default_value_t = 0)]
        start_index: i32,

        /// Starting price of token A in token B
        #[arg(long, default_value = "1")]
        price: Decimal,

        /// Standard deviation of the per-cycle move, in bins
        #[arg(long, default_value_t = 3.0)]
        volatility: f64,

        /// Seed for a reproducible walk
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Validate a strategy config file
    Validate {
        /// Strategy config file (JSON); falls back to LP_KEEPER_CONFIG
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let path = config_path(config)?;
            let config = load_config(&path)?;
            print_config(&config);
            println!("✅ {} is valid", path.display());
        }
        Commands::Run {
            config,
            ticks,
            start_index,
            price,
            volatility,
            seed,
        } => {
            let path = config_path(config)?;
            let config = load_config(&path)?;
            run_paper(config, ticks, start_index, price, volatility, seed).await?;
        }
    }

    Ok(())
}

fn config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .with_context(|| format!("no --config given and {CONFIG_ENV} is not set")),
    }
}

fn load_config(path: &Path) -> Result<StrategyConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: StrategyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

fn print_config(config: &StrategyConfig) {
    let preview = BinRange::centered(0, config.range_width_bins);
    let positions = preview.split(config.max_bins_per_position);

    println!("\n📋 Strategy");
    println!("════════════════════════════════════");
    println!("Pool:              {}", config.pool);
    println!("Position amount:   {}", config.position_amount);
    println!(
        "Range:             {} bins in {} position(s)",
        preview.bin_count(),
        positions.len()
    );
    println!("Monitoring every:  {}s", config.monitoring_interval_secs);
    println!("Out-of-range exit: {}s", config.out_of_range_timeout_secs);
    println!(
        "Smart stop-loss:   {}",
        if config.smart_stop_loss { "on" } else { "off" }
    );
    if config.price_guard.band.is_configured() {
        println!(
            "Price guard:       {:?} floor={:?} ceiling={:?}",
            config.price_guard.mode, config.price_guard.band.floor, config.price_guard.band.ceiling
        );
    }
    println!("════════════════════════════════════");
}

async fn run_paper(
    config: StrategyConfig,
    ticks: u32,
    start_index: i32,
    price: Decimal,
    volatility: f64,
    seed: Option<u64>,
) -> Result<()> {
    print_config(&config);

    let venue = Arc::new(PaperVenue::new(config.pool.clone(), start_index, price));
    venue.set_balance(PAPER_TOKEN_B, config.position_amount).await;
    let bin_step = venue.pool_info(&config.pool).await?.bin_step_bps;
    let mut walk = MarketWalk::new(start_index, price, bin_step, volatility, seed)?;

    let orchestrator = PositionLifecycleOrchestrator::new(
        OrchestratorDeps::from_venue(venue.clone()),
        OrchestratorConfig::default(),
    );
    let cancel = CancellationToken::new();
    let watchdog = Arc::new(HealthWatchdog::new(
        orchestrator.clone(),
        HealthWatchdogConfig::default(),
    ))
    .spawn(cancel.clone());
    let printer = tokio::spawn(print_events(orchestrator.subscribe(), cancel.clone()));

    let id = InstanceId::generate();
    println!("\n🚀 Starting instance {id} on the paper venue...");
    let status = orchestrator
        .execute(&id, config)
        .await
        .context("creating positions")?;
    println!(
        "Opened {} position(s) on {:?}",
        status.position_addresses.len(),
        status.position_range
    );

    for cycle in 1..=ticks {
        let step = walk.step();
        venue.set_active_index(step.active_index).await;
        venue.set_price(step.price).await;
        venue.set_price_change_pct(Some(step.price_change_pct)).await;
        venue.set_net_pnl_pct(step.net_pnl_pct).await;

        match orchestrator.run_cycle(&id).await {
            Ok(branch) => debug!(cycle, ?branch, "Cycle done"),
            Err(e) => warn!(cycle, error = %e, "Cycle failed"),
        }

        let status = orchestrator.get_status(&id).await?;
        println!(
            "{:>4} | bin {:>5} | price {:>10} | pnl {:>7}% | {:<10} | range {:?}",
            cycle,
            step.active_index,
            step.price,
            step.net_pnl_pct,
            status.phase.to_string(),
            status.position_range.map(|r| (r.lower, r.upper))
        );
        if status.phase.is_terminal() {
            break;
        }
    }

    let status = orchestrator.get_status(&id).await?;
    let report = {
        let watchdog = HealthWatchdog::new(orchestrator.clone(), HealthWatchdogConfig::default());
        watchdog.sweep().await
    };

    println!("\n📊 Run Summary");
    println!("════════════════════════════════════");
    println!("Final phase:      {}", status.phase);
    if let Some(reason) = status.stopping_reason {
        println!("Stopping reason:  {reason}");
    }
    if let Some(error) = &status.last_error {
        println!("Last error:       {error}");
    }
    println!("Cycles run:       {}", status.tick_count);
    println!("Open positions:   {}", venue.positions().await.len());
    println!("Opens / closes:   {} / {}", venue.open_calls().await, venue.close_calls().await);
    println!("Residual swaps:   {}", venue.swaps().await.len());
    println!("Health issues:    {}", report.issues.len());
    println!("════════════════════════════════════");

    orchestrator.delete(&id).await?;
    cancel.cancel();
    watchdog.await?;
    printer.await?;

    if report.issues.iter().any(|issue| matches!(issue, HealthIssue::ErrorPhase { .. })) {
        bail!("instance ended in ERROR");
    }
    Ok(())
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<LifecycleEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match &event.data {
                EventData::PhaseChanged { from, to, reason } => {
                    println!("  ↳ {from} → {to}{}", reason.map(|r| format!(" ({r})")).unwrap_or_default());
                }
                EventData::RecreationDecided { kind, reasoning, .. } => {
                    println!("  ♻️  {kind}: {reasoning}");
                }
                EventData::StopLossDecided {
                    action, risk_score, ..
                } => {
                    println!("  🛑 {action} (risk {risk_score})");
                }
                EventData::Error { message } => println!("  ❌ {message}"),
                _ => {}
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
