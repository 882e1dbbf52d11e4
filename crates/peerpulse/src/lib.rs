//! peerpulse: worker client for the PeerPulse distributed-execution coordinator.

mod staging;

pub mod bridge;
pub mod config;
pub mod executor;
pub mod worker;

pub use bridge::codec::{FramingError, FramingMode};
pub use bridge::protocol::{BoundsParseError, BoundsRecord};
pub use bridge::transport::{Connection, TransportError};
pub use config::ClientConfig;
pub use executor::{
    DirectLauncher, ExecutionError, ExecutionRequest, ExecutionResult, Executor, ExecutorConfig,
    InterpreterLauncher, PayloadLauncher,
};
pub use worker::{CycleError, CycleId, CycleReport, WorkerConfig, run_cycle};
