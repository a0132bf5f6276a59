//! Framed connection: turns a duplex byte channel into a loop of
//! *read available bytes → decode frames → dispatch/store → write replies*.
//!
//! One connection is driven by exactly one task, which owns both buffers.
//! Other tasks talk to it through a cloneable [`ConnectionHandle`].

pub mod role;
pub mod state;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::ElasticBuffer;
use crate::codec::FrameCodec;
use crate::config::LinkConfig;
use crate::error::{CloseReason, LinkError};

pub use role::{Dispatcher, ReplyContext, ReplySink, ReplyStore, Role};
pub use state::{ConnectionState, StateCell};
pub use transport::{StreamTransport, Transport};

/// Invoked exactly once when a connection reaches `Closed`, with the
/// reason, the peer address and the local port.
pub type CloseCallback = Box<dyn Fn(&CloseReason, SocketAddr, u16) + Send + Sync + 'static>;

// ── Shared state ─────────────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    state: StateCell,
    peer: SocketAddr,
    local_port: u16,
    origin: Instant,
    /// Milliseconds since `origin` (+1) when the current read began; 0 when idle.
    read_started: AtomicU64,
    stall_threshold: Duration,
}

impl Shared {
    fn mark_read_started(&self) {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        self.read_started.store(now, Ordering::Release);
    }

    fn mark_read_finished(&self) {
        self.read_started.store(0, Ordering::Release);
    }

    fn is_stalled(&self) -> bool {
        let started = self.read_started.load(Ordering::Acquire);
        if started == 0 {
            return false;
        }
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        now.saturating_sub(started) > self.stall_threshold.as_millis() as u64
    }
}

enum Command<M> {
    Send {
        message: M,
        ack: oneshot::Sender<Result<(), LinkError>>,
    },
    /// Wake the loop so it notices a state change.
    Wake,
}

// ── FrameSender ──────────────────────────────────────────────────

/// The send surface of a connection, as seen by request correlation.
#[async_trait]
pub trait FrameSender<M>: Send + Sync {
    /// Queue `message` for writing. Resolves once it sits in the
    /// connection's outbound buffer.
    async fn send_frame(&self, message: M) -> Result<(), LinkError>;
}

// ── ConnectionHandle ─────────────────────────────────────────────

/// Cloneable handle to a running [`FramedConnection`].
pub struct ConnectionHandle<M> {
    commands: mpsc::Sender<Command<M>>,
    shared: Arc<Shared>,
}

impl<M> Clone for ConnectionHandle<M> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> std::fmt::Debug for ConnectionHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.shared.peer)
            .field("state", &self.shared.state.load())
            .finish()
    }
}

impl<M: Send + 'static> ConnectionHandle<M> {
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn local_port(&self) -> u16 {
        self.shared.local_port
    }

    /// `true` if the loop has been blocked in one read for longer than the
    /// stall threshold. Does not cancel the read.
    pub fn is_stalled(&self) -> bool {
        self.shared.is_stalled()
    }

    /// Encode `message` into the outbound buffer; it is written on the
    /// loop's next drain phase.
    pub async fn send(&self, message: M) -> Result<(), LinkError> {
        if !self.state().can_write() {
            return Err(LinkError::InvalidState("connection is not writable"));
        }
        let (ack, done) = oneshot::channel();
        self.commands.send(Command::Send { message, ack }).await?;
        done.await.map_err(|_| LinkError::ConnectionClosed)?
    }

    /// Request a graceful shutdown: `Connected → HalfClosing`.
    ///
    /// Pending outbound bytes are still written before the connection
    /// closes. Returns `false` if the connection was not `Connected`.
    pub fn shutdown(&self) -> bool {
        if let Err(e) = self.shared.state.begin_shutdown() {
            debug!(peer = %self.shared.peer, "shutdown ignored: {e}");
            return false;
        }
        info!(peer = %self.shared.peer, "shutdown requested");
        // A full queue already guarantees a wake-up.
        let _ = self.commands.try_send(Command::Wake);
        true
    }
}

#[async_trait]
impl<M: Send + 'static> FrameSender<M> for ConnectionHandle<M> {
    async fn send_frame(&self, message: M) -> Result<(), LinkError> {
        self.send(message).await
    }
}

// ── FramedConnection ─────────────────────────────────────────────

enum FillOutcome {
    /// The socket backlog is exhausted (or a command interrupted the wait).
    Drained(usize),
    /// The connection must be torn down.
    Closed(CloseReason),
}

/// A duplex byte channel plus the buffers and loop that frame it.
pub struct FramedConnection<C: FrameCodec, T: Transport> {
    transport: T,
    codec: Arc<C>,
    role: Role<C>,
    inbound: ElasticBuffer,
    outbound: ElasticBuffer,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command<C::Message>>,
    commands_tx: mpsc::Sender<Command<C::Message>>,
    commands_open: bool,
    on_close: Option<CloseCallback>,
    max_read_chunk: usize,
    close_grace: Duration,
}

impl<C: FrameCodec, T: Transport + 'static> FramedConnection<C, T> {
    /// Wrap an accepted socket. Starts `Connected`.
    pub fn inbound(
        transport: T,
        peer: SocketAddr,
        local_port: u16,
        codec: Arc<C>,
        dispatcher: Arc<dyn Dispatcher<C>>,
        config: &LinkConfig,
    ) -> Self {
        Self::with_role(
            transport,
            peer,
            local_port,
            codec,
            Role::Inbound(dispatcher),
            ConnectionState::Connected,
            config,
        )
    }

    /// Wrap a dialed socket. Starts `NotConnected`; call
    /// [`establish`](Self::establish) before running it.
    pub fn outbound(
        transport: T,
        peer: SocketAddr,
        local_port: u16,
        codec: Arc<C>,
        sink: Arc<dyn ReplySink<C::Message>>,
        config: &LinkConfig,
    ) -> Self {
        Self::with_role(
            transport,
            peer,
            local_port,
            codec,
            Role::Outbound(sink),
            ConnectionState::NotConnected,
            config,
        )
    }

    fn with_role(
        transport: T,
        peer: SocketAddr,
        local_port: u16,
        codec: Arc<C>,
        role: Role<C>,
        initial: ConnectionState,
        config: &LinkConfig,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(config.command_queue.max(1));
        Self {
            transport,
            codec,
            role,
            inbound: ElasticBuffer::new(config.buffer_capacity),
            outbound: ElasticBuffer::new(config.buffer_capacity),
            shared: Arc::new(Shared {
                state: StateCell::new(initial),
                peer,
                local_port,
                origin: Instant::now(),
                read_started: AtomicU64::new(0),
                stall_threshold: config.stall_threshold(),
            }),
            commands,
            commands_tx,
            commands_open: true,
            on_close: None,
            max_read_chunk: config.max_read_chunk.max(1),
            close_grace: config.close_grace(),
        }
    }

    /// Register the close notification.
    pub fn on_close<F>(&mut self, f: F)
    where
        F: Fn(&CloseReason, SocketAddr, u16) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(f));
    }

    /// Mark the underlying socket handshake as complete.
    pub fn establish(&self) -> Result<(), LinkError> {
        self.shared.state.establish()
    }

    pub fn handle(&self) -> ConnectionHandle<C::Message> {
        ConnectionHandle {
            commands: self.commands_tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn inbound_buffer(&self) -> &ElasticBuffer {
        &self.inbound
    }

    pub fn outbound_buffer(&self) -> &ElasticBuffer {
        &self.outbound
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<CloseReason, LinkError>> {
        tokio::spawn(self.run())
    }

    /// Drive the connection until it closes, returning why it closed.
    ///
    /// Connection faults are not errors here: they end the loop with a
    /// [`CloseReason`] after the close callback has run. `Err` is returned
    /// only when the connection was never established.
    pub async fn run(mut self) -> Result<CloseReason, LinkError> {
        // Only the handles may keep the command queue alive.
        let (dead_tx, _) = mpsc::channel(1);
        self.commands_tx = dead_tx;

        match self.state() {
            ConnectionState::NotConnected => {
                return Err(LinkError::InvalidState("connection not established"));
            }
            ConnectionState::Closed => {
                return Err(LinkError::InvalidState("connection already closed"));
            }
            ConnectionState::Connected | ConnectionState::HalfClosing => {}
        }
        debug!(peer = %self.shared.peer, inbound = self.role.is_inbound(), "connection loop started");

        loop {
            if self.state() == ConnectionState::HalfClosing {
                let reason = match self.drain_outbound().await {
                    Ok(()) => CloseReason::Shutdown,
                    Err(reason) => reason,
                };
                return Ok(self.teardown(reason).await);
            }

            match self.fill().await {
                FillOutcome::Drained(n) => trace!(peer = %self.shared.peer, bytes = n, "read phase drained"),
                FillOutcome::Closed(reason) => return Ok(self.teardown(reason).await),
            }

            if let Err(reason) = self.process_inbound() {
                return Ok(self.teardown(reason).await);
            }

            if let Err(reason) = self.drain_outbound().await {
                return Ok(self.teardown(reason).await);
            }
        }
    }

    // ── Read-fill phase ──────────────────────────────────────────

    async fn fill(&mut self) -> FillOutcome {
        let mut total = 0usize;

        loop {
            if self.inbound.writable() == 0 {
                self.inbound.grow(self.max_read_chunk);
            }
            let requested = self.inbound.writable().min(self.max_read_chunk);

            self.shared.mark_read_started();
            let event = tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => Err(cmd),
                read = self.transport.recv(&mut self.inbound.spare_mut()[..requested]) => Ok(read),
            };
            self.shared.mark_read_finished();

            let read = match event {
                Ok(read) => read,
                Err(Some(cmd)) => {
                    self.apply_command(cmd);
                    return FillOutcome::Drained(total);
                }
                Err(None) => {
                    self.commands_open = false;
                    continue;
                }
            };

            match read {
                Ok(0) if total == 0 => {
                    debug!(peer = %self.shared.peer, "peer closed the connection");
                    return FillOutcome::Closed(CloseReason::PeerClosed);
                }
                // Peer paused after a burst; not a close.
                Ok(0) => return FillOutcome::Drained(total),
                Ok(n) => {
                    self.inbound.advance_write(n);
                    total += n;
                    if n < requested {
                        return FillOutcome::Drained(total);
                    }
                }
                Err(e) => {
                    error!(peer = %self.shared.peer, "recv error: {e}");
                    return FillOutcome::Closed(CloseReason::io(&e));
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: Command<C::Message>) {
        match cmd {
            Command::Send { message, ack } => {
                let result = if self.state().can_write() {
                    self.codec.encode(&message, &mut self.outbound)
                } else {
                    Err(LinkError::InvalidState("connection no longer writable"))
                };
                let _ = ack.send(result);
            }
            Command::Wake => {}
        }
    }

    // ── Decode/dispatch phase ────────────────────────────────────

    fn process_inbound(&mut self) -> Result<(), CloseReason> {
        while self.inbound.readable() > 0 {
            let message = match self.codec.decode(&mut self.inbound) {
                Ok(Some(message)) => message,
                // Partial frame: keep the bytes for the next fill.
                Ok(None) => break,
                Err(e) => {
                    error!(peer = %self.shared.peer, "malformed frame, dropping connection: {e}");
                    return Err(CloseReason::Decode(e.to_string()));
                }
            };

            match &self.role {
                Role::Inbound(dispatcher) => {
                    let mut ctx = ReplyContext {
                        codec: self.codec.as_ref(),
                        outbound: &mut self.outbound,
                        state: &self.shared.state,
                        peer: self.shared.peer,
                    };
                    dispatcher.dispatch(message, &mut ctx);
                }
                Role::Outbound(sink) => sink.deliver(message),
            }
        }

        if self.inbound.readable() == 0 {
            self.inbound.reset();
        }
        Ok(())
    }

    // ── Write-drain phase ────────────────────────────────────────

    async fn drain_outbound(&mut self) -> Result<(), CloseReason> {
        while self.state().can_write() && self.outbound.readable() > 0 {
            match self.transport.send(self.outbound.unread()).await {
                Ok(0) => {
                    error!(peer = %self.shared.peer, "write returned zero bytes");
                    let e = std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned zero bytes");
                    return Err(CloseReason::io(&e));
                }
                Ok(n) => self.outbound.advance_read(n),
                Err(e) => {
                    error!(peer = %self.shared.peer, "send error: {e}");
                    return Err(CloseReason::io(&e));
                }
            }
        }
        self.outbound.reset();
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn teardown(&mut self, reason: CloseReason) -> CloseReason {
        if !self.shared.state.close() {
            debug!(peer = %self.shared.peer, "connection already closed");
            return reason;
        }

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Send { ack, .. } = cmd {
                let _ = ack.send(Err(LinkError::ConnectionClosed));
            }
        }

        let grace = self.role.is_inbound().then_some(self.close_grace);
        self.transport.close(grace).await;

        if reason.is_orderly() {
            info!(peer = %self.shared.peer, "connection closed: {reason}");
        } else {
            warn!(peer = %self.shared.peer, "connection closed: {reason}");
        }

        if let Some(callback) = &self.on_close {
            callback(&reason, self.shared.peer, self.shared.local_port);
        }
        reason
    }
}

// ── Tests ────────────────────────────────────────────────────────
