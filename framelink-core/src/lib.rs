//! # framelink-core
//!
//! Framed request/response transport over a raw byte stream.
//!
//! This crate contains:
//! - **Buffer**: `ElasticBuffer`, a growable byte queue with read/write cursors
//! - **Frame**: the 28-byte header wire format and the `Frame` message type
//! - **Codec**: `FrameCodec` trait and `LinkCodec` for `Frame`s
//! - **Connection**: `FramedConnection`, the read → decode → dispatch → write loop
//! - **Correlator**: matches replies to requests and expires stale ones
//! - **Client**: a dialed connection wired to a correlator
//! - **Error**: `LinkError` and `CloseReason`

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod frame;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use buffer::ElasticBuffer;
pub use client::Client;
pub use codec::{FrameCodec, LinkCodec};
pub use config::LinkConfig;
pub use connection::{
    CloseCallback, ConnectionHandle, ConnectionState, Dispatcher, FrameSender, FramedConnection,
    ReplyContext, ReplySink, ReplyStore, Role, StreamTransport, Transport,
};
pub use correlator::{Clock, Correlator, ManualClock, PendingReply, SystemClock};
pub use error::{CloseReason, LinkError};
pub use frame::{Envelope, Frame, FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, ReplyKind};
