//! Connection lifecycle state machine.
//!
//! ```text
//!  NotConnected ──► Connected ──► HalfClosing ──► Closed
//!        │              │                           ▲
//!        └──────────────┴───────────────────────────┘
//! ```
//!
//! Outbound connections start in `NotConnected`, inbound (accepted)
//! connections start in `Connected`. `Closed` is terminal.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::LinkError;

/// The current phase of a framed connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created but the transport has not been handed over yet.
    NotConnected = 0,
    /// Reading, dispatching and writing.
    Connected = 1,
    /// Shutdown requested; pending outbound bytes still drain.
    HalfClosing = 2,
    /// Terminal. No further I/O is issued.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotConnected,
            1 => Self::Connected,
            2 => Self::HalfClosing,
            _ => Self::Closed,
        }
    }

    /// Outbound bytes may still be written in this state.
    pub fn can_write(&self) -> bool {
        matches!(self, Self::Connected | Self::HalfClosing)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "NotConnected"),
            Self::Connected => write!(f, "Connected"),
            Self::HalfClosing => write!(f, "HalfClosing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ── StateCell ────────────────────────────────────────────────────

/// A `ConnectionState` shared between the connection task and its handles.
///
/// Every transition is a single compare-and-swap, so a handle calling
/// `begin_shutdown` can never resurrect a connection the loop just closed.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        err: &'static str,
    ) -> Result<(), LinkError> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| LinkError::InvalidState(err))
    }

    /// Transition to `Connected`.
    ///
    /// Valid from: `NotConnected`.
    pub fn establish(&self) -> Result<(), LinkError> {
        self.transition(
            ConnectionState::NotConnected,
            ConnectionState::Connected,
            "cannot establish: not in NotConnected state",
        )
    }

    /// Transition to `HalfClosing`.
    ///
    /// Valid from: `Connected`.
    pub fn begin_shutdown(&self) -> Result<(), LinkError> {
        self.transition(
            ConnectionState::Connected,
            ConnectionState::HalfClosing,
            "cannot shut down: not in Connected state",
        )
    }

    /// Force the terminal state from anywhere.
    ///
    /// Returns `false` if the connection was already `Closed`.
    pub fn close(&self) -> bool {
        let previous = self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        ConnectionState::from_u8(previous) != ConnectionState::Closed
    }
}

// ── Tests ────────────────────────────────────────────────────────
