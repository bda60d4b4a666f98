use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reag_core::AddressFields;
use reag_storage::{MemoryStore, MetricsStore, PgStore, PropertyStore};
use reag_sync::{build_scheduler, deduplicate, SourceRegistry, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reag-cli")]
#[command(about = "Real-estate listing aggregation: sync, dedup and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Sync {
        /// Keep results in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
        /// Stay up and run on the configured cron schedule.
        #[arg(long)]
        schedule: bool,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Group addresses read from a file (one per line) or given as arguments.
    Dedup {
        #[arg(long, short)]
        threshold: Option<u8>,
        #[arg(long, short)]
        input: Option<PathBuf>,
        addresses: Vec<String>,
    },
    /// Evaluate the dedup-rate alert policy for a source.
    Alerts { source_id: String },
    /// Markdown digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reag=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        memory: false,
        schedule: false,
    }) {
        Commands::Sync { memory, schedule } => sync(memory, schedule).await?,
        Commands::Serve { memory } => {
            if memory {
                let config = SyncConfig::from_env()?;
                let registry = SourceRegistry::load(config.sources_path()).await?;
                let store = Arc::new(MemoryStore::new());
                let state = reag_web::AppState::new(store.clone(), store, registry.alert_policy())
                    .with_default_threshold(config.thresholds.fuzzy.value());
                reag_web::serve(state, config.web_port).await?;
            } else {
                reag_web::serve_from_env().await?;
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Dedup {
            threshold,
            input,
            addresses,
        } => dedup(threshold, input, addresses).await?,
        Commands::Alerts { source_id } => alerts(&source_id).await?,
        Commands::Report { runs } => {
            let config = SyncConfig::from_env()?;
            print!("{}", reag_sync::reports::report_daily_markdown(runs, &config.reports_root())?);
        }
    }

    Ok(())
}

async fn stores(memory: bool, config: &SyncConfig) -> Result<(Arc<dyn PropertyStore>, Arc<dyn MetricsStore>)> {
    if memory {
        let store = Arc::new(MemoryStore::new());
        let metrics: Arc<dyn MetricsStore> = store.clone();
        let store: Arc<dyn PropertyStore> = store;
        return Ok((store, metrics));
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    let store = Arc::new(store);
    let metrics: Arc<dyn MetricsStore> = store.clone();
    let store: Arc<dyn PropertyStore> = store;
    Ok((store, metrics))
}

async fn sync(memory: bool, schedule: bool) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(config.sources_path()).await?;
    let (store, metrics) = stores(memory, &config).await?;
    let pipeline = Arc::new(SyncPipeline::new(config, registry, store, metrics)?);

    if !schedule {
        print_summary(&pipeline.run_once().await?);
        return Ok(());
    }

    let Some(sched) = build_scheduler(Arc::clone(&pipeline)).await? else {
        anyhow::bail!("--schedule needs REAG_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        cron_1 = %pipeline.config().sync_cron_1,
        cron_2 = %pipeline.config().sync_cron_2,
        "scheduler running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} sources={} succeeded={} failed={} reports={}",
        summary.run_id, summary.enabled_sources, summary.succeeded, summary.failed, summary.reports_dir
    );
    for outcome in &summary.sources {
        match &outcome.error {
            None => println!(
                "  {}: {} listings -> {} properties ({} new, {} updated, {} matched stored){}",
                outcome.source_id,
                outcome.input_count,
                outcome.fuzzy_count,
                outcome.inserted,
                outcome.updated,
                outcome.matched_stored,
                outcome.alert.as_deref().map(|a| format!(" ALERT: {a}")).unwrap_or_default()
            ),
            Some(err) => println!("  {}: FAILED {err}", outcome.source_id),
        }
    }
}

async fn dedup(threshold: Option<u8>, input: Option<PathBuf>, mut lines: Vec<String>) -> Result<()> {
    let threshold = match threshold {
        Some(t) => t,
        None => SyncConfig::from_env()?.thresholds.fuzzy.value(),
    };
    if let Some(path) = input {
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        lines.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(ToString::to_string));
    }

    let addresses = lines
        .iter()
        .map(|l| AddressFields::parse_single_line(l))
        .collect::<Vec<_>>();
    let groups = deduplicate(&addresses, |a| Some(a), threshold)?;
    println!(
        "{} addresses -> {} groups at threshold {threshold}",
        addresses.len(),
        groups.len()
    );
    for (n, group) in groups.iter().enumerate() {
        println!("group {}:", n + 1);
        for &index in &group.indices {
            println!("  [{index}] {}", lines[index]);
        }
    }
    Ok(())
}

async fn alerts(source_id: &str) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let registry = SourceRegistry::load(config.sources_path()).await?;
    let policy = registry.alert_policy();
    let (_, metrics) = stores(false, &config).await?;
    let recent = metrics
        .get_recent_samples(source_id, policy.window)
        .await
        .context("loading dedup metrics")?;

    for sample in &recent {
        println!(
            "{}  input={} strict={} fuzzy={} ratio={:.3}",
            sample.timestamp.format("%Y-%m-%d %H:%M"),
            sample.input_count,
            sample.strict_count,
            sample.fuzzy_count,
            sample.ratio()
        );
    }
    match (policy.min_rate(source_id), policy.evaluate(source_id, &recent)) {
        (None, _) => println!("{source_id}: no min_dedup_rate configured"),
        (Some(_), Some(alert)) => println!("ALERT {}", alert.summary()),
        (Some(rate), None) => println!("{source_id}: ok (min rate {rate:.2})"),
    }
    Ok(())
}
