//! Deferred completions and the pending-request table
//!
//! Battery-powered mesh devices answer read commands asynchronously, out
//! of order, and sometimes not at all. Every outbound read registers a
//! [`PendingKey`] here together with a single-shot [`Deferred`] completion;
//! when the matching frame arrives it is routed to the waiter, and entries
//! that outlive the response timeout are rejected by a periodic eviction
//! sweep so no caller hangs forever.
//!
//! # Correlation key
//!
//! Requests are identified by `(device, endpoint, sequence)`. The key must
//! be unique within the network's in-flight window; a collision is handled
//! per the configured [`CollisionPolicy`] and is never silent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use hivelink_core::{DeviceId, IncomingMessage};

use crate::config::CollisionPolicy;
use crate::error::{FlushReason, Result, SyncError};

// ============================================================================
// Deferred completion
// ============================================================================

/// Observable state of a deferred completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// Not yet settled
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with an error
    Rejected,
}

struct DeferredInner<T> {
    state: SettleState,
    tx: Option<oneshot::Sender<Result<T>>>,
}

/// Single-shot completion, resolvable exactly once from any call site
///
/// Created together with its [`DeferredFuture`]; the first `resolve` or
/// `reject` wins and every later settle attempt is a `false` no-op.
pub struct Deferred<T> {
    inner: Arc<Mutex<DeferredInner<T>>>,
}

impl<T> Deferred<T> {
    /// Create a completion and the future that observes it
    pub fn new() -> (Self, DeferredFuture<T>) {
        let (tx, rx) = oneshot::channel();
        let deferred = Self {
            inner: Arc::new(Mutex::new(DeferredInner {
                state: SettleState::Pending,
                tx: Some(tx),
            })),
        };
        (deferred, DeferredFuture { rx })
    }

    /// Fulfill with a value; returns whether this call settled it
    pub fn resolve(&self, value: T) -> bool {
        self.settle(SettleState::Fulfilled, Ok(value))
    }

    /// Reject with an error; returns whether this call settled it
    pub fn reject(&self, error: SyncError) -> bool {
        self.settle(SettleState::Rejected, Err(error))
    }

    /// Current settle state
    pub fn state(&self) -> SettleState {
        self.inner.lock().state
    }

    fn settle(&self, state: SettleState, outcome: Result<T>) -> bool {
        let mut inner = self.inner.lock();
        match inner.tx.take() {
            Some(tx) => {
                inner.state = state;
                // The receiver may already be gone; the transition still counts.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Awaitable side of a [`Deferred`]
pub struct DeferredFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for DeferredFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::Internal(
                "completion dropped before settling".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Pending-request table
// ============================================================================

/// Correlation key of one in-flight request
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PendingKey {
    /// Target device
    pub device: DeviceId,
    /// Target endpoint
    pub endpoint: u8,
    /// Transaction sequence number
    pub sequence: u8,
}

impl PendingKey {
    /// Create a key from its components
    pub fn new(device: impl Into<DeviceId>, endpoint: u8, sequence: u8) -> Self {
        Self {
            device: device.into(),
            endpoint,
            sequence,
        }
    }

    /// Key an incoming frame would resolve
    pub fn for_message(message: &IncomingMessage) -> Self {
        Self {
            device: message.device.clone(),
            endpoint: message.endpoint,
            sequence: message.sequence,
        }
    }
}

impl std::fmt::Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.endpoint, self.sequence)
    }
}

struct PendingEntry {
    deferred: Deferred<IncomingMessage>,
    created_at: Instant,
}

/// Counters for monitoring the pending table
#[derive(Debug, Clone, Default)]
pub struct PendingStats {
    /// Entries registered
    pub enqueued: u64,
    /// Entries matched with a response
    pub resolved: u64,
    /// Responses that matched no entry (late or unknown)
    pub orphaned: u64,
    /// Entries rejected by the eviction sweep
    pub timeouts: u64,
    /// Key collisions observed
    pub collisions: u64,
    /// Entries rejected by a flush
    pub flushed: u64,
}

/// Result of waiting on a batch of read futures
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Frames from requests that were answered in time
    pub responses: Vec<IncomingMessage>,
    /// Errors from requests that were not
    pub failures: Vec<SyncError>,
}

impl BatchOutcome {
    /// Whether nothing was answered
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// How many requests timed out or were flushed
    pub fn timed_out(&self) -> usize {
        self.failures
            .iter()
            .filter(|e| matches!(e, SyncError::ResponseTimeout { .. } | SyncError::Flushed(_)))
            .count()
    }
}

/// Keyed registry of in-flight requests with timeout-based eviction
///
/// Shared across all device streams; one mutex guards the key→entry map so
/// `enqueue`, `resolve`, the sweep, and `flush` are mutually exclusive.
pub struct PendingRequestTable {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
    stats: Mutex<PendingStats>,
    timeout: Duration,
    policy: CollisionPolicy,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PendingRequestTable {
    /// Create a table with the given response timeout and collision policy
    pub fn new(timeout: Duration, policy: CollisionPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(PendingStats::default()),
            timeout,
            policy,
            sweeper: Mutex::new(None),
        }
    }

    /// Register a pending request and return the future its caller awaits
    pub fn enqueue(&self, key: PendingKey) -> Result<DeferredFuture<IncomingMessage>> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&key) {
            self.stats.lock().collisions += 1;
            match self.policy {
                CollisionPolicy::Strict => {
                    warn!(key = %key, "Pending key collision, rejecting new request");
                    return Err(SyncError::DuplicateKey(key.to_string()));
                }
                CollisionPolicy::Overwrite => {
                    warn!(key = %key, "Pending key collision, displacing earlier request");
                    existing
                        .deferred
                        .reject(SyncError::DuplicateKey(key.to_string()));
                }
            }
        }

        let (deferred, future) = Deferred::new();
        entries.insert(
            key.clone(),
            PendingEntry {
                deferred,
                created_at: Instant::now(),
            },
        );
        self.stats.lock().enqueued += 1;
        trace!(key = %key, "Pending request registered");
        Ok(future)
    }

    /// Match an incoming frame to its pending request
    ///
    /// Returns `false` when no entry exists for the key. Unsolicited frames
    /// miss here by design on their way to the report path; only a
    /// response-class frame without an entry is a real orphan (late or
    /// unknown) and gets counted and logged.
    pub fn resolve(&self, key: &PendingKey, message: IncomingMessage) -> bool {
        let entry = self.entries.lock().remove(key);
        match entry {
            Some(entry) => {
                entry.deferred.resolve(message);
                self.stats.lock().resolved += 1;
                trace!(key = %key, "Pending request resolved");
                true
            }
            None if message.kind.is_response() => {
                self.stats.lock().orphaned += 1;
                warn!(key = %key, kind = %message.kind, "Response for unknown or expired pending key, dropping");
                false
            }
            None => {
                trace!(key = %key, "No pending entry for frame");
                false
            }
        }
    }

    /// Wait for every future in a batch to settle
    ///
    /// Responses contain exactly the requests that were answered; the
    /// caller decides how to treat a short or empty result.
    pub async fn wait_all(futures: Vec<DeferredFuture<IncomingMessage>>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for settled in futures::future::join_all(futures).await {
            match settled {
                Ok(message) => outcome.responses.push(message),
                Err(err) => outcome.failures.push(err),
            }
        }
        outcome
    }

    /// Remove an entry whose command never made it onto the network
    ///
    /// The caller still owns the future and drops it; nothing is awaiting.
    pub fn cancel(&self, key: &PendingKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Reject and remove entries older than the response timeout
    ///
    /// Returns the number of entries evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<PendingKey> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.created_at) >= self.timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = entries.remove(key) {
                debug!(key = %key, "Pending request timed out");
                entry.deferred.reject(SyncError::ResponseTimeout {
                    key: key.to_string(),
                });
            }
        }

        if !expired.is_empty() {
            self.stats.lock().timeouts += expired.len() as u64;
        }
        expired.len()
    }

    /// Start the recurring eviction sweep
    ///
    /// The sweep rearms itself until the table is dropped or
    /// [`stop_sweeper`](Self::stop_sweeper) aborts it.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let table: Weak<Self> = Arc::downgrade(self);
        let period = self.timeout;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match table.upgrade() {
                    Some(table) => {
                        let evicted = table.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, "Eviction sweep rejected expired pending requests");
                        }
                    }
                    None => break,
                }
            }
        }));
    }

    /// Cancel the eviction sweep
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Reject and remove every pending entry
    ///
    /// Used on disconnect and shutdown so no waiter hangs; returns the
    /// number of entries flushed.
    pub fn flush(&self, reason: FlushReason) -> usize {
        let drained: Vec<(PendingKey, PendingEntry)> = self.entries.lock().drain().collect();
        for (key, entry) in &drained {
            trace!(key = %key, %reason, "Flushing pending request");
            entry.deferred.reject(SyncError::Flushed(reason));
        }
        if !drained.is_empty() {
            self.stats.lock().flushed += drained.len() as u64;
            debug!(count = drained.len(), %reason, "Flushed pending requests");
        }
        drained.len()
    }

    /// Number of in-flight entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no request is in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of table counters
    pub fn stats(&self) -> PendingStats {
        self.stats.lock().clone()
    }

    /// The configured response timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for PendingRequestTable {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
