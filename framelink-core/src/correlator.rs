//! Request/response correlation with timeout eviction.
//!
//! A [`Correlator`] keeps two indices over the same pending requests: one
//! by request id for matching replies, one by issue timestamp for expiry.
//! Every entry leaves both indices in the same critical section and its
//! result slot is settled exactly once: by a reply, by the watchdog, or
//! by [`reset_all`](Correlator::reset_all).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{FrameSender, ReplySink};
use crate::error::LinkError;
use crate::frame::{Envelope, ReplyKind};

// ── Clock ────────────────────────────────────────────────────────

/// Source of issue timestamps and watchdog time.
pub trait Clock: Send + Sync + 'static {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall clock, measured from the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Duration) {
        self.0.store(now.as_millis() as u64, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Acquire))
    }
}

// ── Pending entries ──────────────────────────────────────────────

type Slot<M> = oneshot::Sender<Result<M, LinkError>>;

struct Pending<M> {
    /// Issue timestamp in milliseconds; unique across entries.
    timestamp: u64,
    timeout: Duration,
    slot: Slot<M>,
}

struct Indices<M> {
    by_id: HashMap<u64, Pending<M>>,
    /// Issue timestamp → request id. Requests with no timeout are absent.
    by_timestamp: BTreeMap<u64, u64>,
    last_timestamp: Option<u64>,
}

impl<M> Indices<M> {
    /// Strictly increasing: a clock reading at or before the previous
    /// stamp becomes previous + 1.
    fn next_timestamp(&mut self, now: Duration) -> u64 {
        let now = now.as_millis() as u64;
        let stamp = match self.last_timestamp {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_timestamp = Some(stamp);
        stamp
    }

    fn remove(&mut self, request_id: u64) -> Option<Pending<M>> {
        let pending = self.by_id.remove(&request_id)?;
        if self.by_timestamp.get(&pending.timestamp) == Some(&request_id) {
            self.by_timestamp.remove(&pending.timestamp);
        }
        Some(pending)
    }
}

fn settle<M>(slot: Slot<M>, result: Result<M, LinkError>) {
    // The caller may have stopped waiting.
    let _ = slot.send(result);
}

// ── PendingReply ─────────────────────────────────────────────────

/// The eventual outcome of one request.
pub struct PendingReply<M> {
    request_id: u64,
    rx: oneshot::Receiver<Result<M, LinkError>>,
}

impl<M> PendingReply<M> {
    fn settled(request_id: u64, result: Result<M, LinkError>) -> Self {
        let (tx, rx) = oneshot::channel();
        settle(tx, result);
        Self { request_id, rx }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl<M> Future for PendingReply<M> {
    type Output = Result<M, LinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(LinkError::ConnectionReset)))
    }
}

// ── Correlator ───────────────────────────────────────────────────

/// Pending-request table shared by callers, receive loops and the watchdog.
pub struct Correlator<M, K: Clock = SystemClock> {
    clock: K,
    inner: Mutex<Indices<M>>,
}

impl<M> Correlator<M, SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<M> Default for Correlator<M, SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, K: Clock> Correlator<M, K> {
    pub fn with_clock(clock: K) -> Self {
        Self {
            clock,
            inner: Mutex::new(Indices {
                by_id: HashMap::new(),
                by_timestamp: BTreeMap::new(),
                last_timestamp: None,
            }),
        }
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }
}

impl<M, K> Correlator<M, K>
where
    M: Envelope + Send + 'static,
    K: Clock,
{

    /// Send `message` through `sender` and wait for its reply.
    ///
    /// `timeout == 0` disables watchdog expiry for this request. The entry
    /// is registered before the message is written so that a reply can
    /// never overtake its own registration.
    pub async fn request<S>(&self, sender: &S, message: M, timeout: Duration) -> PendingReply<M>
    where
        S: FrameSender<M> + ?Sized,
    {
        let Some(request_id) = message.request_id() else {
            return PendingReply::settled(
                0,
                Err(LinkError::InvalidState("message carries no request id")),
            );
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.by_id.contains_key(&request_id) {
                return PendingReply::settled(request_id, Err(LinkError::DuplicateRequest(request_id)));
            }
            let timestamp = inner.next_timestamp(self.clock.now());
            if !timeout.is_zero() {
                inner.by_timestamp.insert(timestamp, request_id);
            }
            inner.by_id.insert(
                request_id,
                Pending {
                    timestamp,
                    timeout,
                    slot: tx,
                },
            );
        }

        if let Err(e) = sender.send_frame(message).await {
            warn!(request_id, "send request failed: {e}");
            if let Some(pending) = self.inner.lock().remove(request_id) {
                settle(pending.slot, Err(LinkError::SendFailed(e.to_string())));
            }
        }

        PendingReply { request_id, rx }
    }

    /// Send a message that expects no reply.
    pub async fn notify<S>(&self, sender: &S, message: M) -> Result<(), LinkError>
    where
        S: FrameSender<M> + ?Sized,
    {
        sender.send_frame(message).await
    }

    /// Settle the matching request successfully. Returns `false` if no
    /// request with that id is pending.
    pub fn on_response(&self, message: M) -> bool {
        let Some(request_id) = message.request_id() else {
            return false;
        };
        let Some(pending) = self.inner.lock().remove(request_id) else {
            debug!(request_id, "response for unknown request");
            return false;
        };
        settle(pending.slot, Ok(message));
        true
    }

    /// Settle the matching request with the peer's rejection.
    pub fn on_reject(&self, message: M) -> bool {
        let Some(request_id) = message.request_id() else {
            return false;
        };
        let reason = match message.reply_kind() {
            ReplyKind::Reject(reason) => reason,
            _ => String::new(),
        };
        let Some(pending) = self.inner.lock().remove(request_id) else {
            debug!(request_id, "reject for unknown request");
            return false;
        };
        settle(pending.slot, Err(LinkError::Rejected(reason)));
        true
    }

    /// Expire every request whose deadline is at or before `now`.
    ///
    /// The scan follows issue order and stops at the first request that is
    /// still live. A short-timeout request issued after a longer-timeout one
    /// is therefore only expired once every older request has expired or
    /// been answered.
    ///
    /// Returns how many requests were expired.
    pub fn watchdog(&self, now: Duration) -> usize {
        let now = now.as_millis() as u64;
        let mut expired = 0;
        loop {
            let mut inner = self.inner.lock();
            let Some((&timestamp, &request_id)) = inner.by_timestamp.first_key_value() else {
                break;
            };
            let deadline = match inner.by_id.get(&request_id) {
                Some(pending) => timestamp.saturating_add(pending.timeout.as_millis() as u64),
                None => {
                    // Stale stamp; drop it and rescan.
                    inner.by_timestamp.remove(&timestamp);
                    continue;
                }
            };
            if deadline > now {
                break;
            }
            let removed = inner.remove(request_id);
            drop(inner);
            if let Some(pending) = removed {
                debug!(request_id, "request timed out");
                settle(pending.slot, Err(LinkError::Timeout(pending.timeout)));
                expired += 1;
            }
        }
        expired
    }

    /// Run [`watchdog`](Self::watchdog) against the correlator's own clock.
    pub fn watchdog_now(&self) -> usize {
        self.watchdog(self.clock.now())
    }

    /// Settle every pending request with [`LinkError::ConnectionReset`].
    pub fn reset_all(&self) -> usize {
        let drained: Vec<Pending<M>> = {
            let mut inner = self.inner.lock();
            inner.by_timestamp.clear();
            inner.by_id.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            settle(pending.slot, Err(LinkError::ConnectionReset));
        }
        if count > 0 {
            debug!(count, "reset pending requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Number of requests that the watchdog can expire.
    pub fn expiring_count(&self) -> usize {
        self.inner.lock().by_timestamp.len()
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.inner.lock().by_id.contains_key(&request_id)
    }

    /// Run the watchdog every `period` until `cancel` fires.
    pub fn spawn_watchdog(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        correlator.watchdog_now();
                    }
                }
            }
            debug!("watchdog stopped");
        })
    }
}

impl<M, K> ReplySink<M> for Correlator<M, K>
where
    M: Envelope + Send + 'static,
    K: Clock,
{
    fn deliver(&self, message: M) {
        match message.reply_kind() {
            ReplyKind::Response => {
                self.on_response(message);
            }
            ReplyKind::Reject(_) => {
                self.on_reject(message);
            }
            ReplyKind::Unsolicited => debug!("ignoring unsolicited message"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
