//! Payload framing strategies.
//!
//! The coordinator protocol carries no length header: by default the end of the
//! payload is detected by draining the stream until it goes idle. Peers that
//! can send a 4-byte big-endian length header use [`LengthPrefixed`] instead,
//! which uses LengthDelimitedCodec for framing.
//!
//! Both strategies leave the bounds window on the connection for
//! [`read_bounds`].

use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

use super::protocol::{BOUNDS_RECORD_LEN, BoundsParseError, BoundsRecord};
use super::transport::{Connection, TransportError};

/// Size of each payload receive.
pub const CHUNK_SIZE: usize = 8192;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest payload accepted in length-prefixed mode.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("coordinator closed the connection without sending a payload")]
    NoData,

    #[error("malformed bounds record: {0}")]
    BoundsParse(#[from] BoundsParseError),

    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("frame header exceeds the {limit} byte limit")]
    FrameTooLarge {
        limit: usize,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How the payload boundary is found.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    /// Drain until the stream has been idle for the drain timeout.
    #[default]
    Idle,
    /// 4-byte big-endian length header, then the payload.
    LengthPrefixed,
}

/// Reads one payload off a connection.
pub trait PayloadFraming {
    fn read_payload<S>(
        &mut self,
        conn: &mut Connection<S>,
    ) -> impl Future<Output = Result<Vec<u8>, FramingError>>
    where
        S: AsyncRead + AsyncWrite + Unpin;
}

/// Drain-until-idle framing.
///
/// The first receive blocks without a timeout (waiting for the coordinator to
/// start). Later receives use `drain_timeout`; the payload ends at the first
/// receive that returns nothing or times out. A payload that pauses mid-stream
/// for longer than the timeout is cut short at that pause.
#[derive(Debug, Clone)]
pub struct IdleDrain {
    drain_timeout: Duration,
}

impl IdleDrain {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { drain_timeout }
    }
}

impl Default for IdleDrain {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_TIMEOUT)
    }
}

impl PayloadFraming for IdleDrain {
    async fn read_payload<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<u8>, FramingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut payload = conn.receive(CHUNK_SIZE, None).await?;
        if payload.is_empty() {
            return Err(FramingError::NoData);
        }

        let mut chunks = 1usize;
        loop {
            match conn.receive(CHUNK_SIZE, Some(self.drain_timeout)).await {
                Ok(chunk) if chunk.is_empty() => {
                    tracing::trace!("Peer finished writing");
                    break;
                }
                Ok(chunk) => {
                    payload.extend_from_slice(&chunk);
                    chunks += 1;
                }
                Err(TransportError::Timeout(_)) => {
                    tracing::trace!(timeout = ?self.drain_timeout, "Stream went idle");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(bytes = payload.len(), chunks, "Payload drained");
        Ok(payload)
    }
}

/// Length-prefixed framing.
pub struct LengthPrefixed {
    inner: LengthDelimitedCodec,
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthPrefixed {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl PayloadFraming for LengthPrefixed {
    async fn read_payload<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<u8>, FramingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut received = conn.read_ahead_mut().len();
        loop {
            if let Some(frame) = self
                .inner
                .decode(conn.read_ahead_mut())
                .map_err(|source| FramingError::FrameTooLarge {
                    limit: MAX_FRAME_LENGTH,
                    source,
                })?
            {
                tracing::debug!(bytes = frame.len(), "Payload frame decoded");
                return Ok(frame.to_vec());
            }

            match conn.fill_read_ahead().await? {
                0 if received == 0 => return Err(FramingError::NoData),
                0 => {
                    return Err(FramingError::Truncated {
                        buffered: conn.read_ahead_mut().len(),
                    });
                }
                n => received += n,
            }
        }
    }
}

/// Framing selected at startup.
pub enum Framing {
    Idle(IdleDrain),
    LengthPrefixed(LengthPrefixed),
}

impl Framing {
    pub fn new(mode: FramingMode, drain_timeout: Duration) -> Self {
        match mode {
            FramingMode::Idle => Self::Idle(IdleDrain::new(drain_timeout)),
            FramingMode::LengthPrefixed => Self::LengthPrefixed(LengthPrefixed::new()),
        }
    }
}

impl PayloadFraming for Framing {
    async fn read_payload<S>(&mut self, conn: &mut Connection<S>) -> Result<Vec<u8>, FramingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Self::Idle(f) => f.read_payload(conn).await,
            Self::LengthPrefixed(f) => f.read_payload(conn).await,
        }
    }
}

/// Read and parse the bounds window that follows the payload.
///
/// The first receive blocks; if it returns a short window, further receives
/// bounded by `top_up_timeout` fill it until [`BOUNDS_RECORD_LEN`] bytes, peer
/// close, or idle.
pub async fn read_bounds<S>(
    conn: &mut Connection<S>,
    top_up_timeout: Duration,
) -> Result<BoundsRecord, FramingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut window = conn.receive(BOUNDS_RECORD_LEN, None).await?;
    while !window.is_empty() && window.len() < BOUNDS_RECORD_LEN {
        match conn
            .receive(BOUNDS_RECORD_LEN - window.len(), Some(top_up_timeout))
            .await
        {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => window.extend_from_slice(&chunk),
            Err(TransportError::Timeout(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }

    tracing::trace!(window = %String::from_utf8_lossy(&window), "Bounds window received");
    Ok(BoundsRecord::parse(&window)?)
}
