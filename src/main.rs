use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stream2store::init;
use stream2store::source::kinesis;
use stream2store::{run_slot, JsonLinesSource, KinesisSource, RecordSource, SlotStats};
use stream2store_config::{InitialPosition, LoadOptions, RuntimeConfig, StoreBackend};
use stream2store_writer::{SinkWriter, WriteBackend};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Stream records into a key-oriented store with batched, at-least-once writes
#[derive(Parser)]
#[command(name = "stream2store")]
#[command(version)]
#[command(about = "Stream records into a key-oriented store with batched, at-least-once writes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Path to application property groups JSON
    #[arg(short, long, value_name = "FILE", global = true)]
    properties: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline (default)
    Run(RunArgs),
    /// Load and validate configuration, then print it as JSON
    Validate,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Read newline-delimited JSON records from FILE ("-" for stdin) instead of the stream
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Write to an in-memory store instead of the configured backend
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let Cli {
        config: config_path,
        properties,
        log_level,
        command,
    } = cli;

    // Step 1: Load every configuration layer below the CLI
    let options = LoadOptions {
        config_path,
        properties_path: properties,
    };
    let mut config =
        RuntimeConfig::load_unvalidated(&options).context("Failed to load configuration")?;

    // Step 2: Apply CLI overrides (highest priority)
    let command = command.unwrap_or(Command::Run(RunArgs::default()));
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    if let Command::Run(args) = &command {
        apply_run_overrides(&mut config, args);
    }

    // Step 3: Logging, then validation so its warnings are visible
    init::init_tracing(&config.logging);
    config.validate().context("Invalid configuration")?;

    match command {
        Command::Validate => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?
            );
            Ok(())
        }
        Command::Run(args) => run(config, args.input).await,
    }
}

fn apply_run_overrides(config: &mut RuntimeConfig, args: &RunArgs) {
    if args.dry_run {
        config.store.backend = StoreBackend::Memory;
    }

    // Local input replaces the stream, so stream-only settings get defaults.
    if let Some(input) = &args.input {
        if config.source.name.is_empty() {
            config.source.name = input.display().to_string();
        }
        if config.source.region.is_empty() {
            config.source.region = "local".to_string();
        }
        config
            .source
            .initial_position
            .get_or_insert(InitialPosition::TrimHorizon);
        config.sink.parallelism = 1;
    }
}

async fn run(config: RuntimeConfig, input: Option<PathBuf>) -> Result<()> {
    info!(
        source = %config.source.name,
        region = %config.source.region,
        backend = %config.store.backend,
        target = %config.sink.target_store_name,
        parallelism = config.sink.parallelism,
        "Starting stream2store"
    );

    let config = Arc::new(config);
    let backend = init::build_backend(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut slots = JoinSet::new();

    match input {
        Some(path) => {
            let source = JsonLinesSource::open(&path).await?;
            slots.spawn(run_slot_task(
                Box::new(source),
                Arc::clone(&backend),
                Arc::clone(&config),
                0,
                shutdown_rx.clone(),
            ));
        }
        None => {
            let client = kinesis::client(&config.source.region).await;
            let parallelism = config.sink.parallelism;
            for slot in 0..parallelism {
                let source = KinesisSource::connect(
                    client.clone(),
                    &config.source,
                    slot,
                    parallelism,
                    init::retry_policy(&config),
                )
                .await
                .with_context(|| format!("Failed to open stream {}", config.source.name))?;
                slots.spawn(run_slot_task(
                    Box::new(source),
                    Arc::clone(&backend),
                    Arc::clone(&config),
                    slot,
                    shutdown_rx.clone(),
                ));
            }
        }
    }

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut shutting_down = false;
    let mut failure: Option<anyhow::Error> = None;
    let mut totals = SlotStats::default();

    loop {
        tokio::select! {
            joined = slots.join_next() => {
                let result = match joined {
                    None => break,
                    Some(Ok(result)) => result,
                    Some(Err(e)) => Err(anyhow!("Pipeline slot task failed: {}", e)),
                };
                match result {
                    Ok(stats) => {
                        totals.received += stats.received;
                        totals.accepted += stats.accepted;
                        totals.acknowledged += stats.acknowledged;
                    }
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "Pipeline slot failed, stopping remaining slots");
                        let _ = shutdown_tx.send(true);
                        failure.get_or_insert(e);
                    }
                }
            }
            _ = &mut signal, if !shutting_down => {
                shutting_down = true;
                let _ = shutdown_tx.send(true);
            }
        }
    }

    info!(
        received = totals.received,
        accepted = totals.accepted,
        acknowledged = totals.acknowledged,
        "stream2store stopped"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_slot_task(
    mut source: Box<dyn RecordSource>,
    backend: Arc<dyn WriteBackend>,
    config: Arc<RuntimeConfig>,
    slot: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<SlotStats> {
    let writer = SinkWriter::new(backend, init::sink_settings(&config));
    let stages = init::stages(&config);
    let settings = init::slot_settings(&config, slot);

    run_slot(source.as_mut(), &writer, &stages, &settings, shutdown)
        .await
        .with_context(|| format!("Pipeline slot {} failed", slot))
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining pipeline slots...");
        },
        _ = terminate => {
            info!("Received SIGTERM, draining pipeline slots...");
        },
    }
}
