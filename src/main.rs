use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use sentinel_lib::config::SentinelConfig;
use sentinel_lib::engine::{coordinator, SentinelContext};
use sentinel_lib::error::AppError;
use sentinel_lib::scheduler::{self, SchedulerState};
use sentinel_lib::server::{self, throttle::TriggerThrottle, ServerState};
use sentinel_lib::{db, logging};

#[derive(Debug, Parser)]
#[command(name = "sentinel-worker", version, about = "Autonomous self-healing pipeline")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long, env = "SENTINEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP triggers and run the pipeline on a schedule (default).
    Serve,
    /// Run a single pipeline pass and exit.
    RunOnce {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Initialize Sentry before the runtime so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent (local dev).
    let _sentry_guard = sentry::init(sentry_options());

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Sentinel worker exited with error");
            eprintln!("sentinel-worker: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    let config = SentinelConfig::load(cli.config.as_deref())?;
    let _log_guard = logging::init(&config.log);
    tracing::info!("Starting Sentinel worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = db::init_db(&config.database_path)?;
    let ctx = SentinelContext::from_config(pool, config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::RunOnce { json } => {
            let summary = coordinator::run_pipeline(&ctx, "cli").await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "run {} {} in {}ms ({} errors)",
                    summary.run_id.as_deref().unwrap_or("-"),
                    summary.status,
                    summary.duration_ms,
                    summary.errors.len()
                );
            }
            Ok(if summary.status == "failed" { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Command::Serve => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let scheduler_state = Arc::new(SchedulerState::new());
            let throttle = Arc::new(TriggerThrottle::new());

            let loops = scheduler::start_loops(
                scheduler_state.clone(),
                ctx.clone(),
                throttle.clone(),
                shutdown_rx.clone(),
            );

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                }
                let _ = shutdown_tx.send(true);
            });

            let state = Arc::new(ServerState {
                ctx,
                throttle,
                scheduler: scheduler_state,
            });
            let served = server::start_server(state, shutdown_rx).await;
            if served.is_err() {
                loops.iter().for_each(|h| h.abort());
            }
            for handle in loops {
                match handle.await {
                    Err(e) if !e.is_cancelled() => {
                        tracing::warn!(error = %e, "Background loop ended abnormally");
                    }
                    _ => {}
                }
            }
            served.map(|_| ExitCode::SUCCESS)
        }
    }
}

fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: std::env::var("SENTRY_DSN").ok().and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        environment: std::env::var("SENTRY_ENVIRONMENT").ok().map(Into::into),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            if let Some(ref mut request) = event.request {
                request.data = None;
                request.headers.remove("authorization");
                request.headers.remove("x-cron-secret");
            }
            Some(event)
        })),
        ..Default::default()
    }
}
