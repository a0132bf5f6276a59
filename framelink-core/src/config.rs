//! Per-connection tuning shared by both roles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection and correlator settings.
///
/// Durations are plain milliseconds so the struct maps 1:1 onto a TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Initial capacity of the inbound and outbound buffers.
    pub buffer_capacity: usize,
    /// Upper bound for a single socket read.
    pub max_read_chunk: usize,
    /// Deadline for one socket read or write; `0` waits forever.
    pub io_timeout_ms: u64,
    /// How long an inbound socket may take to close gracefully.
    pub close_grace_ms: u64,
    /// A read blocked longer than this is reported as stalled.
    pub stall_threshold_ms: u64,
    /// Capacity of the handle → connection command queue.
    pub command_queue: usize,
    /// Timeout applied by `Client::call`; `0` never expires.
    pub request_timeout_ms: u64,
    /// Period of the correlator watchdog.
    pub watchdog_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16 * 1024,
            max_read_chunk: 64 * 1024,
            io_timeout_ms: 0,
            close_grace_ms: 3000,
            stall_threshold_ms: 3000,
            command_queue: 100,
            request_timeout_ms: 5000,
            watchdog_interval_ms: 100,
        }
    }
}

impl LinkConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }
}
