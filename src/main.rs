//! Command-line runner for procedure files.
use anyhow::Context;
use clap::{Parser, Subcommand};
use daq_sequencer::config::{ApplicationConfig, SequencerConfig};
use daq_sequencer::procedure::{Procedure, RunState};
use daq_sequencer::{Engine, Outcome};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daq_sequencer", version, about = "Run spectroscopy measurement procedures")]
struct Cli {
    /// Configuration file (defaults to config/sequencer.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and run a procedure until it finishes or Ctrl-C stops it
    Run {
        file: PathBuf,
        /// Print every task start/finish as a JSON line on stdout
        #[arg(long)]
        events: bool,
    },
    /// Parse a procedure and print its task tree
    Check { file: PathBuf },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SequencerConfig::load_from(path),
        None => SequencerConfig::load(),
    }
    .context("Failed to load configuration")?;
    if cli.json_logs {
        config.application.json_logs = true;
    }
    init_tracing(&config.application);

    match cli.command {
        Command::Run { file, events } => run(&config, file, events).await,
        Command::Check { file } => check(&config, file),
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(app: &ApplicationConfig) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&app.log_level));
    if app.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn check(config: &SequencerConfig, file: PathBuf) -> anyhow::Result<()> {
    let procedure = Procedure::from_file(&file)
        .with_context(|| format!("Failed to read procedure {}", file.display()))?;
    let mut engine = Engine::with_config(config, RunState::default());
    let root = procedure.build(&mut engine)?;
    print!("{}", engine.describe(root));
    Ok(())
}

async fn run(config: &SequencerConfig, file: PathBuf, events: bool) -> anyhow::Result<()> {
    let procedure = Procedure::from_file(&file)
        .with_context(|| format!("Failed to read procedure {}", file.display()))?;
    let mut engine = Engine::with_config(config, RunState::default());
    let root = procedure.build(&mut engine)?;
    info!(app = %config.application.name, procedure = %procedure.name, "Running procedure");

    let mut event_rx = engine.subscribe();
    let (handle, task) = engine.spawn(root);

    if events {
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(err) => warn!(error = %err, "Cannot serialize event"),
                    },
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping procedure");
            if let Err(err) = stopper.stop(root).await {
                error!(error = %err, "Failed to stop procedure");
            }
        }
    });

    let report = task.await.context("Engine task panicked")??;
    info!(
        repetitions = report.shared.repetition,
        messages = report.shared.log.len(),
        "Procedure ended"
    );
    match report.outcome {
        Outcome::Succeeded => Ok(()),
        Outcome::Failed => {
            error!(procedure = %procedure.name, "Procedure failed");
            std::process::exit(1);
        }
    }
}
