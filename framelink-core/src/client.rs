//! Outbound endpoint: one dialed connection plus a request correlator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::LinkCodec;
use crate::config::LinkConfig;
use crate::connection::{ConnectionHandle, ConnectionState, FramedConnection, StreamTransport, Transport};
use crate::correlator::{Correlator, PendingReply};
use crate::error::{CloseReason, LinkError};
use crate::frame::Frame;

/// A connected client.
///
/// Replies are matched to requests by id; the correlator watchdog runs on
/// its own task and expires requests even when the socket is silent. When
/// the connection closes, every pending request fails with
/// [`LinkError::ConnectionReset`].
pub struct Client {
    handle: ConnectionHandle<Frame>,
    correlator: Arc<Correlator<Frame>>,
    next_id: AtomicU64,
    config: LinkConfig,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<CloseReason, LinkError>>>,
}

impl Client {
    /// Dial `addr` over TCP.
    pub async fn connect(addr: SocketAddr, config: LinkConfig) -> Result<Self, LinkError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_tcp(stream, config)
    }

    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream, config: LinkConfig) -> Result<Self, LinkError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local_port = stream.local_addr()?.port();
        let transport = StreamTransport::new(stream, config.io_timeout());
        Self::start(transport, peer, local_port, config)
    }

    /// Start the connection loop and the watchdog over `transport`.
    pub fn start<T>(transport: T, peer: SocketAddr, local_port: u16, config: LinkConfig) -> Result<Self, LinkError>
    where
        T: Transport + 'static,
    {
        let correlator = Arc::new(Correlator::<Frame>::new());
        let cancel = CancellationToken::new();

        let mut connection = FramedConnection::outbound(
            transport,
            peer,
            local_port,
            Arc::new(LinkCodec),
            correlator.clone(),
            &config,
        );
        {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            connection.on_close(move |reason, peer, _| {
                let failed = correlator.reset_all();
                if failed > 0 {
                    warn!(%peer, failed, "connection closed with requests in flight: {reason}");
                }
                cancel.cancel();
            });
        }
        connection.establish()?;
        let handle = connection.handle();
        let task = connection.spawn();
        correlator.spawn_watchdog(config.watchdog_interval(), cancel.clone());

        info!(%peer, "client connected");
        Ok(Self {
            handle,
            correlator,
            next_id: AtomicU64::new(1),
            config,
            cancel,
            task: Some(task),
        })
    }

    /// Allocate a fresh request id.
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a prepared request frame and wait for its reply.
    ///
    /// Expiry follows issue order: a request is not timed out while an
    /// older request with a longer timeout is still pending. Use one
    /// timeout per client (as [`call`](Self::call) does) when prompt expiry
    /// matters.
    pub async fn request(&self, frame: Frame, timeout: Duration) -> Result<Frame, LinkError> {
        self.request_pending(frame, timeout).await.await
    }

    /// Send a prepared request frame; the returned future resolves with
    /// the reply.
    pub async fn request_pending(&self, frame: Frame, timeout: Duration) -> PendingReply<Frame> {
        self.correlator.request(&self.handle, frame, timeout).await
    }

    /// Send `payload` as a request with a fresh id and the configured
    /// timeout. Returns the response payload.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes, LinkError> {
        let frame = Frame::request(self.next_request_id(), payload)?;
        let reply = self.request(frame, self.config.request_timeout()).await?;
        Ok(reply.payload().clone())
    }

    /// Fire-and-forget message.
    pub async fn notify(&self, payload: impl Into<Bytes>) -> Result<(), LinkError> {
        self.correlator.notify(&self.handle, Frame::notify(payload)?).await
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn handle(&self) -> &ConnectionHandle<Frame> {
        &self.handle
    }

    pub fn correlator(&self) -> &Arc<Correlator<Frame>> {
        &self.correlator
    }

    /// Tell the peer we are leaving, flush, and wait for the loop to end.
    pub async fn disconnect(mut self) -> Result<CloseReason, LinkError> {
        if self.handle.state() == ConnectionState::Connected {
            if let Err(e) = self.handle.send(Frame::disconnect()).await {
                warn!("disconnect notice not sent: {e}");
            }
            self.handle.shutdown();
        }
        let task = self
            .task
            .take()
            .ok_or(LinkError::InvalidState("connection task already joined"))?;
        task.await
            .map_err(|e| LinkError::Other(format!("connection task failed: {e}")))?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.shutdown();
        self.cancel.cancel();
    }
}
