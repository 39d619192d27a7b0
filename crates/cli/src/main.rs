//! CLI entry point for the audio probing engine
//!
//! Loads configuration, builds the backend registry once, and dispatches to
//! the status, probe, compare and batch commands.

use anyhow::{Context, Result};
use audio_prober::{
    derive_plan, format_summary, write_reports, BackendRegistry, BatchError, BatchOrchestrator,
    CancelFlag, Config, EngineSettings, ProbeEngine, ProbeRecord, ProbeStatus, RuleTable,
    TokioCommandRunner,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Version-aware audio metadata prober
#[derive(Parser, Debug)]
#[command(name = "audio-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// ffmpeg version label to use instead of the preferred backend
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Number of concurrent probes (0 = derive from CPU count)
    #[arg(short, long, global = true)]
    workers: Option<u32>,

    /// Timeout in seconds for each probe stage
    #[arg(long, global = true)]
    stage_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show every configured backend and whether it is runnable.
    Status,
    /// Probe a single file.
    Probe {
        file: PathBuf,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe one file with several backends side by side.
    Compare {
        file: PathBuf,
        /// Comma-separated version labels (default: all available)
        #[arg(long, value_delimiter = ',')]
        backends: Vec<String>,
    },
    /// Probe every audio file under a root directory and write reports.
    Batch {
        #[arg(default_value = "Audio")]
        root: PathBuf,
        /// Directory for CSV reports and the JSON summary
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(label) = &cli.backend {
        config.backend.default = label.clone();
    }
    if let Some(workers) = cli.workers {
        config.batch.workers = workers;
    }
    if let Some(secs) = cli.stage_timeout {
        config.probe.stage_timeout_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let runner = Arc::new(TokioCommandRunner);
    let registry = BackendRegistry::discover(&config.backend, runner.as_ref()).await;

    let rules = RuleTable::from_config(&config.probe).context("invalid warning patterns")?;
    let engine = ProbeEngine::new(runner, rules, EngineSettings::from_config(&config.probe));

    match cli.command {
        Commands::Status => {
            print_status(&registry);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Probe { file, json } => {
            let backend = registry.resolve_or_preferred(cli.backend.as_deref())?;
            let record = engine.probe(&file, &backend).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
            Ok(exit_for(&record))
        }
        Commands::Compare { file, backends } => {
            let selected = if backends.is_empty() {
                registry.list_available()
            } else {
                backends
                    .iter()
                    .map(|label| registry.resolve(label))
                    .collect::<Result<Vec<_>, _>>()?
            };
            anyhow::ensure!(!selected.is_empty(), "no ffmpeg backends are available on this system");

            let records = engine.compare(&file, &selected).await?;
            print_comparison(&file, &records);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Batch { root, output_dir } => {
            let backend = registry.resolve_or_preferred(cli.backend.as_deref())?;
            let plan = derive_plan(&config.batch);
            let output_dir = output_dir.unwrap_or_else(|| config.report.output_dir.clone());

            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight probes");
                    on_interrupt.cancel();
                }
            });

            let orchestrator = BatchOrchestrator::new(engine, plan.workers);
            let run = match orchestrator.run(&root, Arc::clone(&backend), &cancel).await {
                Ok(run) => run,
                Err(BatchError::EmptyInput(path)) => {
                    anyhow::bail!("no supported audio files found under {}", path.display())
                }
            };

            let written = write_reports(&output_dir, &run, backend.label())
                .with_context(|| format!("failed to write reports to {}", output_dir.display()))?;
            for result in &run.groups {
                println!("{}\n", format_summary(result));
            }
            if run.cancelled {
                println!("Cancelled: {} file(s) not probed", run.skipped_files);
            }
            println!("{} report(s) saved in {}", written.len(), output_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_for(record: &ProbeRecord) -> ExitCode {
    if record.status == ProbeStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_status(registry: &BackendRegistry) {
    println!(
        "{:<10} {:<10} {:<10} {:<20} {}",
        "LABEL", "KIND", "AVAILABLE", "REPORTED", "INVOCATION"
    );
    for status in registry.status() {
        let label = if status.preferred {
            format!("{}*", status.label)
        } else {
            status.label.clone()
        };
        println!(
            "{:<10} {:<10} {:<10} {:<20} {}",
            label,
            status.kind.to_string(),
            if status.available { "yes" } else { "no" },
            status.reported_version.as_deref().unwrap_or("-"),
            status.invocation
        );
    }
    if registry.preferred().is_err() {
        println!("\nNo ffmpeg backend is runnable on this system.");
    }
}

fn print_record(record: &ProbeRecord) {
    println!("File: {}", record.file_path.display());
    println!("Status: {}", record.status);
    println!("Backend: {}", record.backend_used);
    if let Some(format) = &record.format_name {
        println!(
            "Format: {} ({})",
            format,
            record.mime_type.as_deref().unwrap_or("-")
        );
    }
    if let Some(duration) = record.duration_secs {
        println!("Duration: {:.2} s", duration);
    }
    if let Some(bitrate) = record.bitrate_kbps {
        println!("Bitrate: {:.1} kb/s", bitrate);
    }
    if let Some(channels) = record.channels {
        println!("Channels: {}", channels);
    }
    if let Some(size) = record.file_size_bytes {
        println!("Size: {} bytes", size);
    }
    for warning in &record.warnings {
        println!("Warning: {}", warning);
    }
    if let Some(message) = &record.error_message {
        println!("Error: {}", message);
    }
}

fn print_comparison(file: &Path, records: &[ProbeRecord]) {
    println!("Comparing backends for {}", file.display());
    println!(
        "{:<10} {:<15} {:<8} {:>10} {:>10} {:>8} {:>8}",
        "BACKEND", "STATUS", "FORMAT", "DURATION", "BITRATE", "CHANNELS", "WARNINGS"
    );
    for record in records {
        println!(
            "{:<10} {:<15} {:<8} {:>10} {:>10} {:>8} {:>8}",
            record.backend_used,
            record.status.to_string(),
            record.format_name.as_deref().unwrap_or("-"),
            record
                .duration_secs
                .map(|d| format!("{:.2}", d))
                .unwrap_or_else(|| "-".to_string()),
            record
                .bitrate_kbps
                .map(|b| format!("{:.1}", b))
                .unwrap_or_else(|| "-".to_string()),
            record
                .channels
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.warnings.len()
        );
    }
}
