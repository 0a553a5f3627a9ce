use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use throughput_bench::backend::{InferenceBackend, OpenAiBackend, SimulatedBackend};
use throughput_bench::bench::{MockInferenceServer, SessionOutcome};
use throughput_bench::error::BenchError;
use throughput_bench::config::{Cli, Command, LogFormat, RunArgs, SimulateArgs, StandaloneArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads env-backed flags
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    tracing::info!("🚀 Throughput benchmark starting...");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        interrupt.cancel();
    });

    let outcome = match cli.command {
        Command::Run(args) => run_remote(args, cancel).await?,
        Command::Simulate(args) => run_simulated(args, cancel).await?,
        Command::Standalone(args) => run_standalone(args, cancel).await?,
    };

    match outcome {
        SessionOutcome::Completed(report) => {
            tracing::info!(
                completed = report.completed_requests,
                failed = report.failed_requests,
                "Benchmark finished"
            );
        }
        SessionOutcome::Interrupted(report) => {
            tracing::info!(
                completed = report.completed_requests,
                total = report.total_requests,
                "Benchmark stopped by operator"
            );
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));

    // Logs go to stderr so the report table on stdout stays clean
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_remote(args: RunArgs, cancel: CancellationToken) -> Result<SessionOutcome> {
    let bench = args.bench.prepare().context("Benchmark configuration failed")?;
    tracing::info!(base_url = %args.base_url, model = %args.model, "Benchmarking remote server");

    let outcome = bench
        .run(cancel, |config| async move {
            OpenAiBackend::new(&args.base_url, &args.model, &config).map_err(BenchError::from)
        })
        .await?;
    Ok(outcome)
}

async fn run_simulated(args: SimulateArgs, cancel: CancellationToken) -> Result<SessionOutcome> {
    let bench = args.bench.prepare().context("Benchmark configuration failed")?;
    let simulation = args.engine.to_config();

    let outcome = bench
        .run(cancel, |config| async move {
            Ok::<_, BenchError>(SimulatedBackend::new(&config, simulation))
        })
        .await?;
    Ok(outcome)
}

async fn run_standalone(args: StandaloneArgs, cancel: CancellationToken) -> Result<SessionOutcome> {
    let bench = args.bench.prepare().context("Benchmark configuration failed")?;

    let engine = Arc::new(SimulatedBackend::new(bench.config(), args.engine.to_config()));
    let mut server = MockInferenceServer::new(engine.clone(), args.port);
    let port = server.start().await.context("Failed to start mock server")?;
    tracing::info!("Mock server listening on port {}", port);

    let base_url = server.url();
    let result = bench
        .run(cancel, |config| async move {
            OpenAiBackend::new(&base_url, "simulated", &config).map_err(BenchError::from)
        })
        .await;

    server.stop();
    engine.shutdown().await;
    Ok(result?)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, interrupting benchmark...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, interrupting benchmark...");
        },
    }
}
