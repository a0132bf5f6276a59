//! What a connection does with decoded messages.
//!
//! Inbound (accepted) connections hand every message to a [`Dispatcher`];
//! outbound (dialed) connections hand it to a [`ReplySink`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::ElasticBuffer;
use crate::codec::FrameCodec;
use crate::connection::state::StateCell;
use crate::error::LinkError;
use crate::frame::Envelope;

/// Routes messages received on an inbound connection.
///
/// Fire-and-forget: a handler answers by writing into the connection's
/// outbound buffer through the [`ReplyContext`].
pub trait Dispatcher<C: FrameCodec>: Send + Sync + 'static {
    fn dispatch(&self, message: C::Message, ctx: &mut ReplyContext<'_, C>);
}

impl<C, F> Dispatcher<C> for F
where
    C: FrameCodec,
    F: Fn(C::Message, &mut ReplyContext<'_, C>) + Send + Sync + 'static,
{
    fn dispatch(&self, message: C::Message, ctx: &mut ReplyContext<'_, C>) {
        self(message, ctx)
    }
}

/// Receives messages arriving on an outbound connection.
pub trait ReplySink<M>: Send + Sync + 'static {
    fn deliver(&self, message: M);
}

/// Which side of the conversation a connection is on.
pub enum Role<C: FrameCodec> {
    /// Server-accepted connection.
    Inbound(Arc<dyn Dispatcher<C>>),
    /// Client-initiated connection.
    Outbound(Arc<dyn ReplySink<C::Message>>),
}

impl<C: FrameCodec> Role<C> {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Role::Inbound(_))
    }
}

// ── ReplyContext ─────────────────────────────────────────────────

/// Handle passed to a [`Dispatcher`] for the message being dispatched.
pub struct ReplyContext<'a, C: FrameCodec> {
    pub(crate) codec: &'a C,
    pub(crate) outbound: &'a mut ElasticBuffer,
    pub(crate) state: &'a StateCell,
    pub(crate) peer: SocketAddr,
}

impl<C: FrameCodec> ReplyContext<'_, C> {
    /// Encode `message` into the outbound buffer. It is flushed in the
    /// write phase that follows the current decode pass.
    pub fn reply(&mut self, message: &C::Message) -> Result<(), LinkError> {
        if !self.state.load().can_write() {
            return Err(LinkError::InvalidState("connection no longer writable"));
        }
        self.codec.encode(message, self.outbound)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Ask for a graceful shutdown once the current pass finishes.
    ///
    /// Returns `false` if the connection was not `Connected`.
    pub fn shutdown(&mut self) -> bool {
        self.state.begin_shutdown().is_ok()
    }
}

// ── ReplyStore ───────────────────────────────────────────────────

/// Pull-based reply lookup keyed by request id.
///
/// The connection stores every message that carries a request id; callers
/// later ask for the reply to a given request and remove it on hit.
#[derive(Debug)]
pub struct ReplyStore<M> {
    replies: Mutex<HashMap<u64, M>>,
}

impl<M> Default for ReplyStore<M> {
    fn default() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> ReplyStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the reply for `request_id`, if it arrived.
    pub fn try_take_reply(&self, request_id: u64) -> Option<M> {
        self.replies.lock().remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.lock().is_empty()
    }
}

impl<M> ReplySink<M> for ReplyStore<M>
where
    M: Envelope + Send + 'static,
{
    fn deliver(&self, message: M) {
        match message.request_id() {
            Some(id) => {
                self.replies.lock().insert(id, message);
            }
            None => debug!("dropping message without request id"),
        }
    }
}
