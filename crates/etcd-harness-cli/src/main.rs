use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use etcd_harness::config::ProbeConfig;
use etcd_harness::{DiagnosticSink, Harness, HarnessConfig, binary_available};

#[derive(Parser)]
#[command(name = "etcd-harness", about = "Run a throwaway local etcd for testing")]
struct Cli {
    /// etcd binary name or path (overrides ETCD_HARNESS_BINARY)
    #[arg(long, global = true)]
    binary: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the etcd binary can be found
    Check,
    /// Start an instance and keep it up until Ctrl-C
    Up {
        /// Readiness probe attempts
        #[arg(long)]
        attempts: Option<u32>,
        /// Per-attempt readiness timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Discard etcd's stderr instead of passing it through
        #[arg(long)]
        quiet: bool,
    },
}

fn resolve_config(
    binary: Option<String>,
    attempts: Option<u32>,
    timeout_ms: Option<u64>,
) -> HarnessConfig {
    let mut config = HarnessConfig::from_env();
    if let Some(binary) = binary {
        config = config.with_binary(binary);
    }
    let probe = ProbeConfig::new(
        attempts.unwrap_or(config.probe.max_attempts),
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(config.probe.per_attempt_timeout),
    );
    config.with_probe(probe)
}

async fn up(config: HarnessConfig, quiet: bool) -> anyhow::Result<()> {
    let sink = if quiet {
        DiagnosticSink::Discard
    } else {
        DiagnosticSink::Inherit
    };
    let mut harness = Harness::start_with(config, sink)
        .await
        .context("failed starting etcd harness")?;

    info!(
        endpoint = harness.endpoint().unwrap_or_default(),
        pid = harness.pid().unwrap_or_default(),
        "etcd up"
    );
    println!("endpoint: {}", harness.endpoint().unwrap_or_default());
    if let Some(dir) = harness.data_dir() {
        println!("data dir: {}", dir.display());
    }
    println!("press Ctrl-C to stop");

    let waited = tokio::signal::ctrl_c().await;
    info!("shutting down etcd");
    harness.stop().await;
    waited.context("failed waiting for Ctrl-C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            let config = resolve_config(cli.binary, None, None);
            if binary_available(&config.binary) {
                println!("{} is available", config.binary);
                ExitCode::SUCCESS
            } else {
                println!("{} is not available", config.binary);
                ExitCode::FAILURE
            }
        }
        Commands::Up {
            attempts,
            timeout_ms,
            quiet,
        } => {
            let config = resolve_config(cli.binary, attempts, timeout_ms);
            match up(config, quiet).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
