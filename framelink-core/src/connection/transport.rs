//! Byte channel seen by the connection loop.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A connected duplex byte channel.
///
/// `recv` must be cancel-safe: the loop races it against handle commands
/// and drops the losing future.
#[async_trait]
pub trait Transport: Send {
    /// Read at most `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was written.
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release the channel. `grace` bounds how long a graceful close may take.
    async fn close(&mut self, grace: Option<Duration>);
}

/// [`Transport`] over any tokio stream, with an optional per-call deadline.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    io_timeout: Option<Duration>,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S, io_timeout: Option<Duration>) -> Self {
        Self { stream, io_timeout }
    }
}

async fn with_deadline<F, T>(deadline: Option<Duration>, op: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out after {limit:?}"))
        })?,
        None => fut.await,
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_deadline(self.io_timeout, "read", self.stream.read(buf)).await
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_deadline(self.io_timeout, "write", self.stream.write(buf)).await
    }

    async fn close(&mut self, grace: Option<Duration>) {
        let result = match grace {
            Some(limit) => match tokio::time::timeout(limit, self.stream.shutdown()).await {
                Ok(r) => r,
                Err(_) => {
                    debug!("graceful close exceeded {limit:?}");
                    return;
                }
            },
            None => self.stream.shutdown().await,
        };
        if let Err(e) = result {
            debug!("close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_and_writes_through() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .write(b"xyz")
            .build();
        let mut transport = StreamTransport::new(mock, None);

        let mut buf = [0u8; 8];
        assert_eq!(transport.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(transport.send(b"xyz").await.unwrap(), 3);
        assert_eq!(transport.recv(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_deadline_maps_to_timed_out() {
        let (_keep_open, peer) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(peer, Some(Duration::from_millis(20)));
        let mut buf = [0u8; 8];
        let err = transport.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn read_error_is_propagated() {
        let mock = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut transport = StreamTransport::new(mock, None);
        let mut buf = [0u8; 8];
        let err = transport.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
