use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use sidb_core::{StoreId, VerificationJobId, VerifyDepth, VerifyScope};
use sidb_engine::{Engine, EngineConfig, Scheduler};
use sidb_storage::PruneOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sidbd", version, about = "Deduplication store engine")]
struct Cli {
    /// JSON engine config file
    #[arg(long, env = "SIDB_CONFIG")]
    config: Option<String>,
    /// Data directory for persisted state
    #[arg(long, env = "SIDB_DATA_DIR")]
    data_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Print the status of every store, or of one
    Status {
        #[arg(long)]
        store: Option<u64>,
    },
    /// Run one pruning cycle
    Sweep {
        #[arg(long)]
        store: Option<u64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_delete: Option<usize>,
    },
    /// Run a DV2 verification job
    Verify {
        #[arg(long)]
        store: Option<u64>,
        #[arg(long, value_enum, default_value_t = ScopeArg::Incremental)]
        scope: ScopeArg,
        #[arg(long, value_enum, default_value_t = DepthArg::Quick)]
        depth: DepthArg,
    },
    /// List chunks dropped by verification
    BadChunks {
        #[arg(long)]
        store: Option<u64>,
        #[arg(long)]
        job: Option<u64>,
    },
    /// Run data aging against the retention rules
    Age,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Full,
    Incremental,
}

impl From<ScopeArg> for VerifyScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Full => VerifyScope::Full,
            ScopeArg::Incremental => VerifyScope::Incremental,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DepthArg {
    Quick,
    Complete,
}

impl From<DepthArg> for VerifyDepth {
    fn from(arg: DepthArg) -> Self {
        match arg {
            DepthArg::Quick => VerifyDepth::Quick,
            DepthArg::Complete => VerifyDepth::Complete,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sidb_engine=debug,sidb_storage=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let engine = Arc::new(Engine::new(config).await.context("failed to start engine")?);

    match cli.command {
        Command::Run => {
            tracing::info!("sidbd v{} starting", env!("CARGO_PKG_VERSION"));
            let scheduler = Scheduler::start(engine.clone());
            tracing::info!("{} background loops running", scheduler.len());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
            scheduler.shutdown();
        }
        Command::Status { store } => {
            for store in select_stores(&engine, store) {
                let status = engine.store_status(store).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
        Command::Sweep {
            store,
            dry_run,
            max_delete,
        } => {
            let options = PruneOptions {
                dry_run,
                max_delete,
            };
            for store in select_stores(&engine, store) {
                let cycle = engine
                    .run_pruning(store, &options)
                    .await
                    .with_context(|| format!("pruning of store {} failed", store))?;
                println!(
                    "store {}: released {} refs, {} zero-ref, {} chunks deleted, {} bytes freed, {} blocked",
                    store,
                    cycle.logical.references_released,
                    cycle.logical.signatures_confirmed,
                    cycle.physical.chunks_deleted,
                    cycle.physical.bytes_freed,
                    cycle.logical.entries_blocked + cycle.physical.blocked_offline
                );
                for error in cycle.logical.errors.iter().chain(&cycle.physical.errors) {
                    println!("  error: {}", error);
                }
            }
        }
        Command::Verify {
            store,
            scope,
            depth,
        } => {
            for store in select_stores(&engine, store) {
                let job = engine
                    .run_verification(store, scope.into(), depth.into())
                    .await
                    .with_context(|| format!("verification of store {} failed", store))?;
                println!("{}", serde_json::to_string_pretty(&job)?);
            }
        }
        Command::BadChunks { store, job } => {
            let drops = engine
                .bad_chunks(store.map(StoreId), job.map(VerificationJobId))
                .await;
            println!("{}", serde_json::to_string_pretty(&drops)?);
        }
        Command::Age => {
            let result = engine.run_data_aging(Utc::now()).await?;
            println!(
                "examined {} jobs, aged {}, staged {} entries",
                result.jobs_examined, result.jobs_aged, result.entries_staged
            );
            for error in &result.errors {
                println!("  error: {}", error);
            }
        }
    }

    engine.save().await.context("failed to save state")?;
    Ok(())
}

fn select_stores(engine: &Engine, store: Option<u64>) -> Vec<StoreId> {
    match store {
        Some(id) => vec![StoreId(id)],
        None => engine.stores(),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path))?,
        None => EngineConfig::default(),
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Ok(secs) = std::env::var("SIDB_SWEEP_INTERVAL_SECS") {
        config.settings.sweep_interval_secs = secs
            .parse()
            .context("SIDB_SWEEP_INTERVAL_SECS must be a number of seconds")?;
    }
    if let Ok(flag) = std::env::var("SIDB_FORCE_REVERIFY") {
        config.settings.force_reverify = matches!(flag.as_str(), "1" | "true" | "yes");
    }
    config.validate()?;

    Ok(config)
}
