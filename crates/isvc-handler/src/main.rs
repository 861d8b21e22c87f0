use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

use isvc_core::{HandlerConfig, HandlerError, HandlerResult};
use isvc_rollout::{Phase, PhaseOutcome, RolloutController};

mod kube_cluster;

use kube_cluster::KubeCluster;

#[derive(Parser, Debug)]
#[command(
    name = "handler",
    about = "Canary handler for KFServing inference-service experiments",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Ramp the candidate to its initial share and record version info
    Start,
    /// Move all traffic to the winning version
    Finish,
}

impl From<Command> for Phase {
    fn from(command: Command) -> Self {
        match command {
            Command::Start => Phase::Start,
            Command::Finish => Phase::Finish,
        }
    }
}

/// Exit code for a clap parse failure. Help and version requests are not failures.
fn parse_failure_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

/// Every successful outcome, including a skipped finish, exits 0.
fn exit_code(result: &HandlerResult<PhaseOutcome>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Map a `LOG_LEVEL` value to a tracing level.
///
/// Accepts the logrus spellings `warning`, `fatal` and `panic` as well.
fn parse_log_level(raw: &str) -> Option<tracing::Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(tracing::Level::WARN),
        "fatal" | "panic" => Some(tracing::Level::ERROR),
        other => other.parse().ok(),
    }
}

/// Install the fmt subscriber when `level` names a log level; otherwise stay silent.
fn init_logging(level: Option<&str>) {
    let Some(level) = level.and_then(parse_log_level) else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default()
                .add_directive(LevelFilter::from_level(level).into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve once Ctrl-C or SIGTERM arrives.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

async fn run(phase: Phase, config: &HandlerConfig) -> anyhow::Result<HandlerResult<PhaseOutcome>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "failed to install signal handlers"),
        }
    });

    let cluster = KubeCluster::try_default().await?;
    let controller = RolloutController::new(cluster, config.schedule, shutdown_rx);
    Ok(controller.run(phase, config).await)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_failure_code(e.kind()));
        }
    };

    let config = match HandlerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("handler: {}", HandlerError::from(e));
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_level.as_deref());

    let phase = Phase::from(cli.command);
    let result = match run(phase, &config).await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "cluster client unavailable");
            eprintln!("handler: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match &result {
        Ok(outcome) => info!(%phase, ?outcome, "phase succeeded"),
        Err(e) => {
            error!(%phase, error = %e, "phase failed");
            eprintln!("handler {phase}: {e}");
        }
    }
    ExitCode::from(exit_code(&result))
}
