//! Echo service core logic.
//!
//! Accepts TCP sockets and runs one inbound framed connection per socket.
//! Live connections are kept in a session table keyed by peer address;
//! each connection's close callback removes its own entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use framelink_core::{
    ConnectionHandle, ConnectionState, Dispatcher, Frame, FrameKind, FramedConnection, LinkCodec,
    ReplyContext, StreamTransport,
};

use crate::config::NodeConfig;

// ── EchoDispatcher ───────────────────────────────────────────────

/// Answers requests with their own payload.
///
/// Empty requests are rejected, notifications are logged, and a
/// `Disconnect` frame shuts the connection down.
#[derive(Debug, Default)]
pub struct EchoDispatcher {
    requests: AtomicU64,
    notices: AtomicU64,
}

impl EchoDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests answered so far (including rejections).
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn notices(&self) -> u64 {
        self.notices.load(Ordering::Relaxed)
    }
}

impl Dispatcher<LinkCodec> for EchoDispatcher {
    fn dispatch(&self, frame: Frame, ctx: &mut ReplyContext<'_, LinkCodec>) {
        let peer = ctx.peer_addr();
        match frame.kind() {
            FrameKind::Request => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                let id = frame.request_id();
                let reply = if frame.payload().is_empty() {
                    Frame::reject(id, "empty payload")
                } else {
                    Frame::response(id, frame.payload().clone())
                };
                if let Err(e) = reply.and_then(|reply| ctx.reply(&reply)) {
                    warn!(%peer, request_id = id, "reply failed: {e}");
                }
            }
            FrameKind::Notify => {
                self.notices.fetch_add(1, Ordering::Relaxed);
                info!(%peer, bytes = frame.payload().len(), "notify received");
            }
            FrameKind::Disconnect => {
                debug!(%peer, "peer asked to disconnect");
                ctx.shutdown();
            }
            FrameKind::Response | FrameKind::Reject => {
                warn!(%peer, kind = %frame.kind(), "unexpected reply frame on inbound connection");
            }
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

/// One accepted connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub handle: ConnectionHandle<Frame>,
}

type SessionTable = Arc<Mutex<HashMap<SocketAddr, Session>>>;

// ── EchoService ──────────────────────────────────────────────────

/// The top-level echo service.
pub struct EchoService {
    config: NodeConfig,
    running: Arc<AtomicBool>,
    sessions: SessionTable,
    dispatcher: Arc<EchoDispatcher>,
}

impl EchoService {
    /// Create a new service with the given config.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            dispatcher: Arc::new(EchoDispatcher::new()),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, Box<dyn std::error::Error>> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("echo node listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let local_port = listener.local_addr()?.port();
        let mut stall_check = tokio::time::interval(self.config.link.stall_threshold().max(Duration::from_millis(100)));

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = stall_check.tick() => {
                    for peer in self.stalled_sessions() {
                        warn!(%peer, "read stalled longer than {:?}", self.config.link.stall_threshold());
                    }
                    continue;
                }
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            if self.session_count() >= self.config.network.max_connections {
                warn!(%peer, "session limit reached; dropping connection");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay: {e}");
            }

            self.start_session(stream, peer, local_port);
        }

        self.running.store(false, Ordering::SeqCst);
        let open: Vec<Session> = self.sessions.lock().values().cloned().collect();
        for session in &open {
            session.handle.shutdown();
        }
        info!(sessions = open.len(), "echo node stopped");
        Ok(())
    }

    fn start_session(&self, stream: tokio::net::TcpStream, peer: SocketAddr, local_port: u16) {
        let link = &self.config.link;
        let dispatcher: Arc<dyn Dispatcher<LinkCodec>> = self.dispatcher.clone();
        let mut conn = FramedConnection::inbound(
            StreamTransport::new(stream, link.io_timeout()),
            peer,
            local_port,
            Arc::new(LinkCodec),
            dispatcher,
            link,
        );

        let sessions = Arc::clone(&self.sessions);
        conn.on_close(move |reason, peer, _| {
            if let Some(session) = sessions.lock().remove(&peer) {
                info!(%peer, duration = ?session.connected_at.elapsed(), "session ended: {reason}");
            }
        });

        self.sessions.lock().insert(
            peer,
            Session {
                peer,
                connected_at: Instant::now(),
                handle: conn.handle(),
            },
        );
        info!(%peer, "session started");
        conn.spawn();
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Peers whose connection has been blocked in a single read for longer
    /// than the stall threshold.
    pub fn stalled_sessions(&self) -> Vec<SocketAddr> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.handle.state() == ConnectionState::Connected && s.handle.is_stalled())
            .map(|s| s.peer)
            .collect()
    }

    pub fn dispatcher(&self) -> &Arc<EchoDispatcher> {
        &self.dispatcher
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::{CloseReason, Client, ElasticBuffer, FrameCodec, LinkConfig, LinkError};

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = ElasticBuffer::new(0);
        for frame in frames {
            LinkCodec.encode(frame, &mut buf).unwrap();
        }
        buf.unread().to_vec()
    }

    fn test_config() -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.network.listen_addr = "127.0.0.1".into();
        cfg.network.listen_port = 0;
        cfg.link = LinkConfig {
            close_grace_ms: 200,
            watchdog_interval_ms: 10,
            ..Default::default()
        };
        cfg
    }

    async fn run_dispatcher(input: Vec<u8>, expected: Vec<u8>) -> (CloseReason, Arc<EchoDispatcher>) {
        let dispatcher = Arc::new(EchoDispatcher::new());
        let mut mock = tokio_test::io::Builder::new();
        mock.read(&input);
        if !expected.is_empty() {
            mock.write(&expected);
        }
        let conn = FramedConnection::inbound(
            StreamTransport::new(mock.build(), None),
            "127.0.0.1:5000".parse().unwrap(),
            7400,
            Arc::new(LinkCodec),
            dispatcher.clone() as Arc<dyn Dispatcher<LinkCodec>>,
            &LinkConfig::default(),
        );
        (conn.run().await.unwrap(), dispatcher)
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = EchoService::new(NodeConfig::default());
        assert!(!svc.is_running());
        assert_eq!(svc.session_count(), 0);
    }

    #[test]
    fn stop_handle_works() {
        let svc = EchoService::new(NodeConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn echo_answers_requests() {
        let input = wire(&[Frame::request(3, &b"abc"[..]).unwrap()]);
        let expected = wire(&[Frame::response(3, &b"abc"[..]).unwrap()]);
        let (reason, dispatcher) = run_dispatcher(input, expected).await;
        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(dispatcher.requests(), 1);
    }

    #[tokio::test]
    async fn echo_rejects_empty_requests() {
        let input = wire(&[Frame::request(4, Vec::new()).unwrap()]);
        let expected = wire(&[Frame::reject(4, "empty payload").unwrap()]);
        let (_, dispatcher) = run_dispatcher(input, expected).await;
        assert_eq!(dispatcher.requests(), 1);
    }

    #[tokio::test]
    async fn echo_counts_notices_and_honours_disconnect() {
        let input = wire(&[
            Frame::notify(&b"n1"[..]).unwrap(),
            Frame::notify(&b"n2"[..]).unwrap(),
            Frame::disconnect(),
        ]);
        let (reason, dispatcher) = run_dispatcher(input, Vec::new()).await;
        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(dispatcher.notices(), 2);
        assert_eq!(dispatcher.requests(), 0);
    }

    #[tokio::test]
    async fn sessions_are_tracked_and_removed() {
        let svc = Arc::new(EchoService::new(test_config()));
        let listener = svc.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.serve(listener).await.map_err(|e| e.to_string()) })
        };

        let client = Client::connect(addr, test_config().link).await.unwrap();
        let reply = client.call(&b"echo"[..]).await.unwrap();
        assert_eq!(&reply[..], b"echo");

        match client.call(Vec::new()).await {
            Err(LinkError::Rejected(reason)) => assert_eq!(reason, "empty payload"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(svc.session_count(), 1);
        assert_eq!(svc.dispatcher().requests(), 2);

        client.disconnect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while svc.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was never removed");

        svc.stop();
        server.await.unwrap().unwrap();
        assert!(!svc.is_running());
    }
}
