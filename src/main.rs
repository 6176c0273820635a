// ABOUTME: Operator CLI for staged pglogical migrations and guarded cutover
// ABOUTME: Loads the TOML config, wires the orchestrator and dispatches subcommands

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pglogical_cutover::config::Config;
use pglogical_cutover::gateway::{Gateway, GatewayConfig};
use pglogical_cutover::remote::{HttpTrafficRouter, ManualRouter, TrafficRouter};
use pglogical_cutover::replication::PgEndpointFactory;
use pglogical_cutover::schema::PgDumpCopier;
use pglogical_cutover::store::ContextStore;
use pglogical_cutover::{Advance, MigrationStatus, Orchestrator, Stage, SyncState};

#[derive(Parser)]
#[command(name = "pglogical-cutover")]
#[command(about = "Stage PostgreSQL migrations over pglogical and cut traffic over safely", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "pglogical-cutover.toml", global = true)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register migrations from the config (all pairs unless --pair is given)
    Create {
        #[arg(long)]
        pair: Option<String>,
    },
    /// Attempt one forward stage transition
    Advance {
        pair: String,
        /// Stage to move to; must be the next stage
        #[arg(long)]
        to: Option<Stage>,
    },
    /// Stop driving and monitoring a migration
    Pause { pair: String },
    /// Continue a paused migration
    Resume { pair: String },
    /// Freeze the source, drain, redirect traffic and tear down replication
    Cutover {
        pair: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Re-validate remote state and resume a failed migration
    Reset { pair: String },
    /// Remove replication objects of a failed migration that never redirected traffic
    Rollback {
        pair: String,
        #[arg(long)]
        yes: bool,
    },
    /// Show stage, last error and sync status
    Status {
        pair: String,
        #[arg(long)]
        json: bool,
    },
    /// Poll until the migration reaches steady-state
    WaitSync { pair: String },
    /// Keep polling replication status without advancing, until interrupted
    Monitor { pair: String },
    /// Drive every migration concurrently until interrupted
    Run,
    /// List registered migrations
    List {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let config = Config::load(&cli.config)?;
    let orchestrator = build(&config)?;

    match cli.command {
        Commands::Create { pair } => {
            let pairs: Vec<_> = match &pair {
                Some(id) => vec![config
                    .pair(id)
                    .with_context(|| format!("No pair {} in {}", id, cli.config.display()))?],
                None => config.pairs.iter().collect(),
            };
            if pairs.is_empty() {
                bail!("No pairs configured in {}", cli.config.display());
            }
            for pair in pairs {
                let ctx = orchestrator
                    .create(pair.to_new_migration())
                    .await
                    .with_context(|| format!("Failed to create migration {}", pair.pair_id()))?;
                println!(
                    "{}: {} ({} tables, {} sequences)",
                    ctx.pair_id,
                    ctx.stage,
                    ctx.tables.len(),
                    ctx.sequences.len()
                );
            }
        }
        Commands::Advance { pair, to } => {
            let cancel = interrupt_token();
            match orchestrator.advance(&pair, to, &cancel).await? {
                Advance::Transitioned { from, to } => println!("{}: {} -> {}", pair, from, to),
                Advance::AlreadyAt(stage) => println!("{}: already at {}", pair, stage),
                Advance::Waiting { stage, reason } => {
                    println!("{}: still {} ({})", pair, stage, reason)
                }
            }
        }
        Commands::Pause { pair } => {
            orchestrator.pause(&pair).await?;
            println!("{}: paused", pair);
        }
        Commands::Resume { pair } => {
            orchestrator.resume(&pair).await?;
            println!("{}: resumed", pair);
        }
        Commands::Cutover { pair, yes } => {
            let status = orchestrator.status(&pair).await?;
            if !yes
                && !confirm(format!(
                    "Cut {} over to {}? Source writes will be revoked for the tracked tables",
                    pair, status.target
                ))?
            {
                println!("Cutover cancelled");
                return Ok(());
            }
            let cancel = interrupt_token();
            let stage = orchestrator
                .cutover(&pair, &cancel)
                .await
                .with_context(|| format!("Cutover of {} did not complete", pair))?;
            println!("{}: {}", pair, stage);
        }
        Commands::Reset { pair } => {
            let stage = orchestrator.reset(&pair).await?;
            println!("{}: reset to {}", pair, stage);
        }
        Commands::Rollback { pair, yes } => {
            if !yes && !confirm(format!("Drop all replication objects of {}?", pair))? {
                println!("Rollback cancelled");
                return Ok(());
            }
            orchestrator.rollback(&pair).await?;
            println!("{}: replication objects removed", pair);
        }
        Commands::Status { pair, json } => {
            let status = orchestrator.status(&pair).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::WaitSync { pair } => {
            wait_sync(&orchestrator, &pair, config.orchestrator.poll_interval()).await?;
        }
        Commands::Monitor { pair } => {
            orchestrator.monitor(&pair, interrupt_token()).await?;
            print_status(&orchestrator.status(&pair).await?);
        }
        Commands::Run => {
            let cancel = interrupt_token();
            let outcomes = Arc::new(orchestrator).run(cancel).await?;
            let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
            for outcome in &failed {
                if let Err(err) = &outcome.result {
                    eprintln!("{}: {}", outcome.pair_id, err);
                }
            }
            if !failed.is_empty() {
                bail!("{} of {} migrations failed", failed.len(), outcomes.len());
            }
        }
        Commands::List { json } => {
            let statuses = orchestrator.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for status in &statuses {
                    let flag = if status.paused { " (paused)" } else { "" };
                    println!(
                        "{:<32} {:<20} {}/{} tables in set{}",
                        status.pair_id, status.stage, status.set_tables, status.tracked_tables, flag
                    );
                }
            }
        }
    }
    Ok(())
}

fn build(config: &Config) -> Result<Orchestrator> {
    let settings = &config.orchestrator;
    let gateway = Gateway::new(GatewayConfig::from(settings))
        .context("Failed to initialise connection gateway")?;
    let store = ContextStore::open(&settings.state_path).with_context(|| {
        format!("Failed to open state store {}", settings.state_path.display())
    })?;
    let router: Arc<dyn TrafficRouter> = match &config.router.url {
        Some(url) => Arc::new(
            HttpTrafficRouter::new(url.clone(), Duration::from_secs(config.router.timeout_secs))
                .context("Failed to create traffic router client")?,
        ),
        None => {
            info!("No router URL configured; pointer flips will be confirmed manually");
            Arc::new(ManualRouter)
        }
    };
    Ok(Orchestrator::new(
        settings,
        store,
        Arc::new(PgEndpointFactory::new(Arc::new(gateway))),
        Arc::new(PgDumpCopier),
        router,
    ))
}

/// Cancellation token fired by Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe point");
            child.cancel();
        }
    });
    token
}

fn confirm(prompt: String) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

async fn wait_sync(orchestrator: &Orchestrator, pair: &str, interval: Duration) -> Result<()> {
    let cancel = interrupt_token();
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(120));

    loop {
        let status = orchestrator.status(pair).await?;
        match status.stage {
            Stage::SteadyState => {
                spinner.finish_with_message(format!("{} is in steady-state", pair));
                return Ok(());
            }
            Stage::InitialSyncing => {
                let report = orchestrator.poll_once(pair).await?;
                let synced = report.tables_in(SyncState::Synchronized).len();
                let lag = report
                    .lag
                    .as_ref()
                    .map(|l| format!("{} bytes behind", l.wal_lag_bytes()))
                    .unwrap_or_else(|| "no lag reading".into());
                spinner.set_message(format!(
                    "{}: {}/{} tables synchronized, {}",
                    pair,
                    synced,
                    report.tables.len(),
                    lag
                ));
                orchestrator
                    .advance(pair, Some(Stage::SteadyState), &cancel)
                    .await?;
            }
            other => {
                spinner.abandon();
                bail!("{} is {}; wait-sync only applies while initial-syncing", pair, other);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                spinner.abandon_with_message("interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn print_status(status: &MigrationStatus) {
    println!("Pair:      {}", status.pair_id);
    println!("Source:    {}", status.source);
    println!("Target:    {}", status.target);
    println!(
        "Stage:     {}{}",
        status.stage,
        if status.paused { " (paused)" } else { "" }
    );
    println!("Revision:  {}", status.revision);
    println!(
        "Set:       {}/{} tables, {}/{} sequences",
        status.set_tables, status.tracked_tables, status.set_sequences, status.tracked_sequences
    );
    if let Some(cutover) = &status.cutover {
        println!("Cutover:   {} (started {})", cutover.phase, cutover.started_at);
    }
    if let Some(err) = &status.last_error {
        println!("Error:     at {} ({}): {}", err.stage, err.at, err.message);
    }
    if let Some(report) = &status.report {
        if let Some(lag) = &report.lag {
            println!(
                "Lag:       {} bytes, {} (at {})",
                lag.wal_lag_bytes(),
                lag.time_lag_secs()
                    .map(|s| format!("{:.1}s", s))
                    .unwrap_or_else(|| "time lag unknown".into()),
                lag.taken_at()
            );
        }
        for table in report.tables.values() {
            println!(
                "  {:<40} {:<14} clean polls {} pending {}",
                table.table, table.state, table.clean_polls, table.pending_changes
            );
        }
    }
}
