//! Stream transport to the coordinator.
//!
//! A [`Connection`] wraps one stream (TCP in production, any
//! `AsyncRead + AsyncWrite` in tests) plus a read-ahead buffer. Bytes read past
//! a frame boundary stay in that buffer and are served first by later receives.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_util::bytes::BytesMut;

/// Send-side socket buffer, sized so bursty result writes rarely block.
pub const SEND_BUFFER_SIZE: u32 = 16 * 1024 * 1024;

const READ_AHEAD_RESERVE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    #[error("connecting to {addr} timed out after {after:?}")]
    ConnectionTimeout { addr: String, after: Duration },

    #[error("no data received within {0:?}")]
    Timeout(Duration),

    #[error("connection broken after sending {sent} of {total} bytes")]
    BrokenConnection { sent: usize, total: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The worker's single connection to the coordinator.
pub struct Connection<S = TcpStream> {
    stream: S,
    peer: String,
    read_ahead: BytesMut,
}

impl Connection<TcpStream> {
    /// Connect to `host:port`, trying each resolved address in turn.
    ///
    /// The send buffer is enlarged to [`SEND_BUFFER_SIZE`] before connecting.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let target = format!("{}:{}", host, port);

        let attempt = async {
            let mut last_err = io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", target),
            );
            for addr in lookup_host(&target).await? {
                match connect_addr(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "Connect attempt failed");
                        last_err = e;
                    }
                }
            }
            Err::<TcpStream, io::Error>(last_err)
        };

        let stream = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::ConnectionRefused { addr: target });
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(TransportError::ConnectionTimeout {
                    addr: target,
                    after: timeout,
                });
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: target,
                    after: timeout,
                });
            }
        };

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(target);
        tracing::debug!(%peer, "Connected");
        Ok(Self::new(stream, peer))
    }
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    configured_socket(addr)?.connect(addr).await
}

/// Unconnected socket for `addr` with the enlarged send buffer.
pub(crate) fn configured_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    // The kernel may clamp (or double) the requested size.
    tracing::trace!(
        requested = SEND_BUFFER_SIZE,
        effective = socket.send_buffer_size().unwrap_or(0),
        "Configured send buffer"
    );
    Ok(socket)
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            read_ahead: BytesMut::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receive up to `max_bytes`.
    ///
    /// Returns an empty vec on orderly peer close. With a timeout set, fails
    /// with [`TransportError::Timeout`] when nothing arrives in time.
    pub async fn receive(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.read_ahead.is_empty() {
            let n = max_bytes.min(self.read_ahead.len());
            return Ok(self.read_ahead.split_to(n).to_vec());
        }

        let mut buf = vec![0u8; max_bytes];
        let read = self.stream.read(&mut buf);
        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransportError::Timeout(limit))??,
            None => read.await?,
        };
        buf.truncate(n);
        tracing::trace!(bytes = n, "Received chunk");
        Ok(buf)
    }

    /// Read whatever is available into the read-ahead buffer.
    ///
    /// Returns the number of bytes appended, 0 on peer close.
    pub(crate) async fn fill_read_ahead(&mut self) -> Result<usize, TransportError> {
        self.read_ahead.reserve(READ_AHEAD_RESERVE);
        let n = self.stream.read_buf(&mut self.read_ahead).await?;
        Ok(n)
    }

    pub(crate) fn read_ahead_mut(&mut self) -> &mut BytesMut {
        &mut self.read_ahead
    }

    /// Send every byte of `bytes`, retrying short writes.
    pub async fn send_all(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        send_all(&mut self.stream, bytes).await
    }

    /// Shut down the send direction; reads remain possible.
    pub async fn half_close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        tracing::trace!(peer = %self.peer, "Half-closed send direction");
        Ok(())
    }

    /// Half-close, give the peer `linger` to drain its receive buffer, then close.
    ///
    /// Closing straight after the last send can race the peer's final read and
    /// truncate the tail of the output on some stacks.
    pub async fn close(mut self, linger: Duration) -> Result<(), TransportError> {
        self.half_close().await?;
        tokio::time::sleep(linger).await;
        tracing::debug!(peer = %self.peer, "Connection closed");
        Ok(())
    }
}

/// Write all of `bytes` to `writer`, looping over partial writes.
///
/// A write that makes no progress fails with
/// [`TransportError::BrokenConnection`].
pub async fn send_all<W>(writer: &mut W, bytes: &[u8]) -> Result<usize, TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = bytes.len();
    let mut sent = 0;
    while sent < total {
        let n = writer.write(&bytes[sent..]).await?;
        if n == 0 {
            return Err(TransportError::BrokenConnection { sent, total });
        }
        sent += n;
        tracing::trace!(sent, total, "Partial send");
    }
    writer.flush().await?;
    Ok(sent)
}
