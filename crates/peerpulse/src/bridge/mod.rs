//! Wire bridge between the worker client and the coordinator.
//!
//! This module provides the connection, the payload framing strategies and the
//! record types exchanged with the coordinator.
//!
//! # Architecture
//!
//! - **transport**: TCP connection with read-ahead buffer, full-flush send, half-close
//! - **codec**: Payload framing (idle drain, length-prefixed) and bounds window read
//! - **protocol**: Bounds record and the environment contract handed to payloads

pub mod codec;
pub mod protocol;
pub mod transport;
