//! End-to-end cycles against an in-process fake coordinator over TCP.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::task::JoinHandle;

use peerpulse::{
    BoundsRecord, Connection, CycleError, ExecutionError, Executor, ExecutorConfig, FramingError,
    FramingMode, InterpreterLauncher, PayloadLauncher, WorkerConfig, run_cycle,
};

const DRAIN: Duration = Duration::from_millis(100);
/// Pause the coordinator leaves after the payload, well above DRAIN.
const PAYLOAD_PAUSE: Duration = Duration::from_millis(400);

/// What the fake coordinator does after accepting.
enum Script {
    /// Close immediately without sending anything.
    Hangup,
    /// Payload, pause, bounds window; then read until the worker closes.
    Idle { payload: Vec<u8>, bounds: Vec<u8> },
    /// Length header, payload and bounds in one write; then read until close.
    Framed { payload: Vec<u8>, bounds: Vec<u8> },
}

async fn coordinator(script: Script) -> (u16, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        match script {
            Script::Hangup => return Vec::new(),
            Script::Idle { payload, bounds } => {
                stream.write_all(&payload).await.unwrap();
                tokio::time::sleep(PAYLOAD_PAUSE).await;
                stream.write_all(&bounds).await.unwrap();
            }
            Script::Framed { payload, bounds } => {
                let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
                wire.extend_from_slice(&payload);
                wire.extend_from_slice(&bounds);
                stream.write_all(&wire).await.unwrap();
            }
        }
        let mut returned = Vec::new();
        stream.read_to_end(&mut returned).await.unwrap();
        returned
    });

    (port, handle)
}

struct CountingLauncher {
    inner: InterpreterLauncher,
    calls: AtomicUsize,
}

impl CountingLauncher {
    fn sh() -> Arc<Self> {
        Arc::new(Self {
            inner: InterpreterLauncher::new("sh"),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PayloadLauncher for CountingLauncher {
    fn command(&self, artifact: &Path) -> Command {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.command(artifact)
    }
}

struct Harness {
    staging: tempfile::TempDir,
    launcher: Arc<CountingLauncher>,
    executor_config: ExecutorConfig,
    worker_config: WorkerConfig,
}

impl Harness {
    fn new() -> Self {
        let staging = tempfile::tempdir().unwrap();
        let executor_config = ExecutorConfig::new().with_staging_root(staging.path());
        Self {
            staging,
            launcher: CountingLauncher::sh(),
            executor_config,
            worker_config: WorkerConfig::default()
                .with_drain_timeout(DRAIN)
                .with_linger(Duration::from_millis(20)),
        }
    }

    async fn run(&self, script: Script) -> (Result<peerpulse::CycleReport, CycleError>, Vec<u8>) {
        let (port, coordinator) = coordinator(script).await;
        let conn = Connection::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        let executor = Executor::new(self.executor_config.clone(), self.launcher.clone());

        let outcome = run_cycle(conn, &self.worker_config, &executor).await;
        let returned = coordinator.await.unwrap();
        (outcome, returned)
    }

    fn staged_entries(&self) -> usize {
        std::fs::read_dir(self.staging.path()).unwrap().count()
    }
}

fn idle(payload: &str, bounds: &[u8]) -> Script {
    Script::Idle {
        payload: payload.as_bytes().to_vec(),
        bounds: bounds.to_vec(),
    }
}

#[tokio::test]
async fn bounds_reach_payload_and_output_returns() {
    let harness = Harness::new();
    let payload = "echo \"lower=$PROCESS_BOUND_LOWER upper=$PROCESS_BOUND_UPPER\"\n";

    let (outcome, returned) = harness.run(idle(payload, b"3 7            ")).await;

    let report = outcome.unwrap();
    assert_eq!(returned, b"lower=3 upper=7\n");
    assert_eq!(report.bounds, BoundsRecord::new(3, 7));
    assert_eq!(report.result_bytes, returned.len());
    assert_eq!(harness.launcher.calls(), 1);
    assert_eq!(harness.staged_entries(), 0);
}

#[tokio::test]
async fn malformed_bounds_abort_without_execution() {
    let harness = Harness::new();

    let (outcome, returned) = harness
        .run(idle("echo should-not-run\n", b"abc def........"))
        .await;

    assert!(matches!(
        outcome,
        Err(CycleError::Framing(FramingError::BoundsParse(_)))
    ));
    assert!(returned.is_empty());
    assert_eq!(harness.launcher.calls(), 0);
    assert_eq!(harness.staged_entries(), 0);
}

#[tokio::test]
async fn failed_payload_returns_nothing() {
    let harness = Harness::new();
    let payload = "echo 'half a result'\necho 'singular matrix' >&2\nexit 4\n";

    let (outcome, returned) = harness.run(idle(payload, b"0 9            ")).await;

    match outcome {
        Err(CycleError::ExecutionFailed { code, stderr }) => {
            assert_eq!(code, Some(4));
            assert_eq!(stderr, "singular matrix");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(returned.is_empty());
    assert_eq!(harness.launcher.calls(), 1);
    assert_eq!(harness.staged_entries(), 0);
}

#[tokio::test]
async fn immediate_hangup_is_no_data() {
    let harness = Harness::new();

    let (outcome, returned) = harness.run(Script::Hangup).await;

    assert!(matches!(
        outcome,
        Err(CycleError::Framing(FramingError::NoData))
    ));
    assert!(returned.is_empty());
    assert_eq!(harness.launcher.calls(), 0);
    assert_eq!(harness.staged_entries(), 0);
}

#[tokio::test]
async fn large_output_arrives_complete_and_in_order() {
    let harness = Harness::new();
    // ~6 MB, several times a default socket buffer.
    let payload = "i=0\nwhile [ $i -lt 6 ]; do\n  yes \"row $i 0123456789abcdef\" | head -n 40000\n  i=$((i + 1))\ndone\n";

    let (outcome, returned) = harness.run(idle(payload, b"0 6            ")).await;

    let mut expected = String::new();
    for i in 0..6 {
        expected.push_str(&format!("row {} 0123456789abcdef\n", i).repeat(40_000));
    }
    assert_eq!(outcome.unwrap().result_bytes, expected.len());
    assert_eq!(returned.len(), expected.len());
    assert!(returned == expected.as_bytes());
}

#[tokio::test]
async fn length_prefixed_framing_needs_no_pause() {
    let mut harness = Harness::new();
    harness.worker_config = harness
        .worker_config
        .clone()
        .with_framing(FramingMode::LengthPrefixed);
    let payload = "echo \"$1-$2\"\n";

    let (outcome, returned) = harness
        .run(Script::Framed {
            payload: payload.as_bytes().to_vec(),
            bounds: BoundsRecord::new(11, 22).padded(),
        })
        .await;

    assert_eq!(outcome.unwrap().payload_bytes, payload.len());
    assert_eq!(returned, b"11-22\n");
}

#[tokio::test]
async fn timed_out_payload_returns_nothing() {
    let mut harness = Harness::new();
    harness.executor_config = harness
        .executor_config
        .clone()
        .with_timeout(Duration::from_millis(300));

    let (outcome, returned) = harness.run(idle("sleep 30\n", b"0 1            ")).await;

    assert!(matches!(
        outcome,
        Err(CycleError::Execution(ExecutionError::TimedOut(_)))
    ));
    assert!(returned.is_empty());
    assert_eq!(harness.staged_entries(), 0);
}

#[tokio::test]
async fn empty_output_still_closes_cleanly() {
    let harness = Harness::new();

    let (outcome, returned) = harness.run(idle("true\n", b"5 5            ")).await;

    assert_eq!(outcome.unwrap().result_bytes, 0);
    assert!(returned.is_empty());
}
