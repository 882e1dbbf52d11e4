use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use peerpulse::{ClientConfig, Connection, Executor, run_cycle};

/// Initialize tracing with PEERPULSE_LOG and LOG_FORMAT support.
///
/// Logs go to stderr, leaving stdout untouched.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PEERPULSE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        // peerpulse_worker is this binary's own target (startup and outcome lines).
        EnvFilter::new(format!(
            "peerpulse={level},peerpulse_worker={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn main() -> ExitCode {
    init_tracing();
    let config = ClientConfig::parse();

    info!("peerpulse-worker {}", env!("CARGO_PKG_VERSION"));

    match run(config) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Worker failed to start");
            ExitCode::from(2)
        }
    }
}

fn run(config: ClientConfig) -> anyhow::Result<ExitCode> {
    let port = config
        .resolve_port()
        .context("failed to read coordinator port")?;

    // One connection, one payload, one child: a single-threaded runtime is enough.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve_once(config, port))
}

async fn serve_once(config: ClientConfig, port: u16) -> anyhow::Result<ExitCode> {
    info!(host = %config.host, port, "Connecting to coordinator");
    let conn = match Connection::connect(&config.host, port, config.connect_timeout()).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "Could not connect to coordinator");
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(peer = %conn.peer(), "Connected to coordinator");

    let executor = Executor::new(config.executor_config(), config.launcher());
    match run_cycle(conn, &config.worker_config(), &executor).await {
        Ok(report) => {
            info!(
                cycle = %report.cycle_id,
                bounds = %report.bounds,
                result_bytes = report.result_bytes,
                "Work unit completed"
            );
            match serde_json::to_string(&report) {
                Ok(json) => debug!(report = %json, "Cycle report"),
                Err(e) => warn!(error = %e, "Failed to serialize cycle report"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(error = %e, "Work unit aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}
