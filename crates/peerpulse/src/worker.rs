//! One request/response cycle against the coordinator.
//!
//! Flow:
//! 1. Read the payload (idle drain or length-prefixed frame)
//! 2. Read the 15-byte bounds record
//! 3. Stage and execute the payload
//! 4. On success: send stdout, half-close, linger, close
//!
//! Every failure skips the remaining steps and drops the connection. Nothing is
//! sent back unless the payload exits successfully, so the coordinator reads a
//! close without output as an execution failure.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

use crate::bridge::codec::{
    DEFAULT_DRAIN_TIMEOUT, Framing, FramingError, FramingMode, PayloadFraming, read_bounds,
};
use crate::bridge::protocol::BoundsRecord;
use crate::bridge::transport::{Connection, TransportError};
use crate::executor::{ExecutionError, ExecutionRequest, Executor};

pub const DEFAULT_LINGER: Duration = Duration::from_millis(1000);

/// Identifier attached to every log line of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CycleId(uuid::Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub framing: FramingMode,
    /// Idle window ending the payload drain and the bounds top-up.
    pub drain_timeout: Duration,
    /// Pause between half-close and close.
    pub linger: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::Idle,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            linger: DEFAULT_LINGER,
        }
    }
}

impl WorkerConfig {
    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("payload exited unsuccessfully (exit code {code:?}): {stderr}")]
    ExecutionFailed { code: Option<i32>, stderr: String },
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub bounds: BoundsRecord,
    pub payload_bytes: usize,
    pub result_bytes: usize,
    pub exit_code: Option<i32>,
    pub execution_ms: u64,
    pub started_at: String,
    pub completed_at: String,
}

/// Run one cycle over `conn`, consuming it.
pub async fn run_cycle<S>(
    conn: Connection<S>,
    config: &WorkerConfig,
    executor: &Executor,
) -> Result<CycleReport, CycleError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cycle_id = CycleId::new();
    let span = tracing::info_span!("cycle", id = %cycle_id, peer = %conn.peer());
    serve_cycle(cycle_id, conn, config, executor)
        .instrument(span)
        .await
}

async fn serve_cycle<S>(
    cycle_id: CycleId,
    mut conn: Connection<S>,
    config: &WorkerConfig,
    executor: &Executor,
) -> Result<CycleReport, CycleError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started_at = chrono::Utc::now().to_rfc3339();

    tracing::info!(framing = ?config.framing, "Waiting for payload");
    let mut framing = Framing::new(config.framing, config.drain_timeout);
    let payload = framing.read_payload(&mut conn).await?;
    tracing::info!(bytes = payload.len(), "Received payload");

    let bounds = read_bounds(&mut conn, config.drain_timeout).await?;
    tracing::info!(%bounds, "Received bounds");

    let result = executor
        .execute(ExecutionRequest {
            payload: &payload,
            bounds,
        })
        .await?;

    if !result.success() {
        let stderr = result.stderr_tail();
        tracing::error!(
            exit_code = ?result.exit_code(),
            stderr = %stderr,
            "Payload failed, no result will be returned"
        );
        return Err(CycleError::ExecutionFailed {
            code: result.exit_code(),
            stderr,
        });
    }
    if !result.stderr.is_empty() {
        tracing::debug!(stderr = %result.stderr_tail(), "Payload wrote to stderr");
    }

    let sent = conn.send_all(&result.stdout).await?;
    tracing::info!(bytes = sent, "Result sent");
    conn.close(config.linger).await?;

    Ok(CycleReport {
        cycle_id,
        bounds,
        payload_bytes: payload.len(),
        result_bytes: sent,
        exit_code: result.exit_code(),
        execution_ms: result.duration.as_millis() as u64,
        started_at,
        completed_at: chrono::Utc::now().to_rfc3339(),
    })
}
