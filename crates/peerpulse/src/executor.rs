//! Payload execution in an isolated child process.
//!
//! Flow:
//! 1. Stage the payload into its own temporary directory
//! 2. Build the child command through a [`PayloadLauncher`]
//! 3. Inject the bounds (environment and trailing arguments), apply limits
//! 4. Wait for exit, capturing stdout and stderr in full
//! 5. Remove the staging directory (failures are logged, never returned)

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::bridge::protocol::BoundsRecord;
use crate::staging::StagedPayload;

/// Bytes of stderr kept in failure diagnostics.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to stage payload: {0}")]
    Stage(#[source] io::Error),

    #[error("failed to spawn payload: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed waiting for payload: {0}")]
    Wait(#[source] io::Error),

    #[error("payload still running after {0:?}, killed")]
    TimedOut(Duration),
}

/// Builds the command that runs a staged artifact.
///
/// The executor appends the bounds arguments and owns stdio, environment and
/// working directory; a launcher only chooses the program.
pub trait PayloadLauncher: Send + Sync {
    fn command(&self, artifact: &Path) -> Command;

    /// Whether the artifact must carry the executable bit.
    fn needs_executable_artifact(&self) -> bool {
        false
    }
}

/// Runs the artifact through an interpreter: `<program> <artifact>`.
#[derive(Debug, Clone)]
pub struct InterpreterLauncher {
    program: String,
}

impl InterpreterLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PayloadLauncher for InterpreterLauncher {
    fn command(&self, artifact: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(artifact);
        command
    }
}

/// Executes the artifact itself (it must carry a shebang or be a binary).
#[derive(Debug, Clone, Default)]
pub struct DirectLauncher;

impl PayloadLauncher for DirectLauncher {
    fn command(&self, artifact: &Path) -> Command {
        Command::new(artifact)
    }

    fn needs_executable_artifact(&self) -> bool {
        true
    }
}

/// Resource limits applied to the child.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLimits {
    /// Wall-clock limit; the child is killed when it expires.
    pub timeout: Option<Duration>,
    /// RLIMIT_CPU, in seconds.
    pub cpu_seconds: Option<u64>,
    /// RLIMIT_AS, in bytes.
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Parent directory for staging directories (system temp dir if `None`).
    pub staging_root: Option<PathBuf>,
    /// Start the child from an empty environment (keeping only `PATH`).
    pub clear_env: bool,
    pub limits: ExecutionLimits,
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    pub fn with_clear_env(mut self, clear_env: bool) -> Self {
        self.clear_env = clear_env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = Some(timeout);
        self
    }

    pub fn with_cpu_seconds(mut self, seconds: u64) -> Self {
        self.limits.cpu_seconds = Some(seconds);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }
}

/// Everything one execution needs, passed explicitly.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub payload: &'a [u8],
    pub bounds: BoundsRecord,
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, `None` when the child was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Last few KiB of stderr, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&self.stderr[start..]).trim_end().to_string()
    }
}

pub struct Executor {
    config: ExecutorConfig,
    launcher: Arc<dyn PayloadLauncher>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, launcher: Arc<dyn PayloadLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Stage, run and clean up one payload.
    ///
    /// A non-zero exit is not an error here; callers inspect
    /// [`ExecutionResult::success`].
    pub async fn execute(
        &self,
        request: ExecutionRequest<'_>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut staged = StagedPayload::create(
            request.payload,
            self.config.staging_root.as_deref(),
            self.launcher.needs_executable_artifact(),
        )
        .map_err(ExecutionError::Stage)?;

        let outcome = self.run_staged(&staged, request.bounds).await;

        if let Err(e) = staged.cleanup() {
            tracing::warn!(error = %e, dir = %staged.workdir().display(), "Failed to remove staged payload");
        }
        outcome
    }

    async fn run_staged(
        &self,
        staged: &StagedPayload,
        bounds: BoundsRecord,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut command = self.launcher.command(staged.artifact());
        command
            .arg(bounds.lower.to_string())
            .arg(bounds.upper.to_string())
            .current_dir(staged.workdir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if self.config.clear_env {
            command.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
        }
        command.envs(bounds.env());

        #[cfg(unix)]
        {
            // Own process group, so a timeout also reaches whatever the payload forks.
            command.process_group(0);
            apply_rlimits(&mut command, &self.config.limits);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(ExecutionError::Spawn)?;
        let pid = child.id();
        tracing::info!(pid, %bounds, "Payload started");

        let output = match self.config.limits.timeout {
            // Dropping the wait future drops the child, and kill_on_drop kills it.
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output.map_err(ExecutionError::Wait)?,
                Err(_) => {
                    tracing::warn!(timeout = ?limit, "Payload timed out, killing");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    return Err(ExecutionError::TimedOut(limit));
                }
            },
            None => child
                .wait_with_output()
                .await
                .map_err(ExecutionError::Wait)?,
        };

        let result = ExecutionResult {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
            duration: started.elapsed(),
        };
        tracing::info!(
            exit_code = ?result.exit_code(),
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            duration_ms = result.duration.as_millis() as u64,
            "Payload exited"
        );
        Ok(result)
    }
}

#[cfg(unix)]
fn apply_rlimits(command: &mut Command, limits: &ExecutionLimits) {
    let cpu_seconds = limits.cpu_seconds;
    let memory_bytes = limits.memory_bytes;
    if cpu_seconds.is_none() && memory_bytes.is_none() {
        return;
    }

    // SAFETY: the closure runs in the forked child before exec. It only calls
    // setrlimit, which is async-signal-safe, and allocates nothing.
    unsafe {
        command.pre_exec(move || {
            use nix::sys::resource::{Resource, setrlimit};

            if let Some(seconds) = cpu_seconds {
                setrlimit(Resource::RLIMIT_CPU, seconds, seconds)?;
            }
            if let Some(bytes) = memory_bytes {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            }
            Ok(())
        });
    }
}

/// SIGKILL every process left in the payload's group.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid, "Killed payload process group"),
        // Nothing left in the group.
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to kill payload process group"),
    }
}
