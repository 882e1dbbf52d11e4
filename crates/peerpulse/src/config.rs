//! Startup configuration for the worker client.
//!
//! Every option is a flag with a `PEERPULSE_*` environment fallback. The port
//! is the one value that may also be answered interactively.

use std::io::{BufRead, IsTerminal, Write};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::bridge::codec::FramingMode;
use crate::executor::{DirectLauncher, ExecutorConfig, InterpreterLauncher, PayloadLauncher};
use crate::worker::WorkerConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "peerpulse-worker",
    version,
    about = "Receive one unit of work from a PeerPulse coordinator, run it, return its output"
)]
pub struct ClientConfig {
    /// Coordinator host name or address.
    #[arg(long, env = "PEERPULSE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Coordinator port. Prompted for on a terminal when absent.
    #[arg(long, env = "PEERPULSE_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "PEERPULSE_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Idle window that ends the payload drain.
    #[arg(long, env = "PEERPULSE_DRAIN_TIMEOUT_MS", default_value_t = 500)]
    pub drain_timeout_ms: u64,

    #[arg(long, env = "PEERPULSE_FRAMING", value_enum, default_value_t = FramingMode::Idle)]
    pub framing: FramingMode,

    /// Program used to run the payload.
    #[arg(long, env = "PEERPULSE_INTERPRETER", default_value = "python3")]
    pub interpreter: String,

    /// Execute the payload directly instead of through the interpreter.
    #[arg(long, env = "PEERPULSE_DIRECT", conflicts_with = "interpreter")]
    pub direct: bool,

    /// Directory for staged payloads (system temp dir by default).
    #[arg(long, env = "PEERPULSE_STAGING_DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Run the payload with an empty environment (plus PATH and the bounds).
    #[arg(long, env = "PEERPULSE_CLEAR_ENV")]
    pub clear_env: bool,

    /// Kill the payload after this many seconds. Unlimited when absent.
    #[arg(long, env = "PEERPULSE_EXEC_TIMEOUT_SECS")]
    pub exec_timeout_secs: Option<u64>,

    #[arg(long, env = "PEERPULSE_CPU_LIMIT_SECS")]
    pub cpu_limit_secs: Option<u64>,

    #[arg(long, env = "PEERPULSE_MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<u64>,

    /// Pause between half-closing and closing the connection.
    #[arg(long, env = "PEERPULSE_LINGER_MS", default_value_t = 1000)]
    pub linger_ms: u64,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_framing(self.framing)
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .with_linger(Duration::from_millis(self.linger_ms))
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::new().with_clear_env(self.clear_env);
        if let Some(dir) = &self.staging_dir {
            config = config.with_staging_root(dir);
        }
        if let Some(secs) = self.exec_timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.cpu_limit_secs {
            config = config.with_cpu_seconds(secs);
        }
        if let Some(mb) = self.memory_limit_mb {
            config = config.with_memory_bytes(mb.saturating_mul(1024 * 1024));
        }
        config
    }

    pub fn launcher(&self) -> Arc<dyn PayloadLauncher> {
        if self.direct {
            Arc::new(DirectLauncher)
        } else {
            Arc::new(InterpreterLauncher::new(&self.interpreter))
        }
    }

    /// The configured port, else an interactive answer, else [`DEFAULT_PORT`].
    pub fn resolve_port(&self) -> std::io::Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        if !std::io::stdin().is_terminal() {
            return Ok(DEFAULT_PORT);
        }

        let mut stderr = std::io::stderr();
        write!(stderr, "Enter server port (default {}): ", DEFAULT_PORT)?;
        stderr.flush()?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        parse_port_answer(&answer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }
}

/// Parse an interactive port answer; blank means [`DEFAULT_PORT`].
pub fn parse_port_answer(answer: &str) -> Result<u16, ParseIntError> {
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    answer.parse()
}
