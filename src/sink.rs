//! Event sink: the boundary where committed occurrences leave the engine.
//!
//! The engine never blocks on or fails because of a sink. Delivery errors
//! are returned as [`SinkError`] and logged by the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::clock::{Clock, SystemClock};
use crate::error::SinkError;
use crate::event::{EventCode, EventOccurrence};

/// Destination for committed occurrences.
///
/// Implementations must be shareable across threads; one sink usually serves
/// every operation scope of an engine.
pub trait EventSink: Send + Sync {
    /// Delivers one occurrence.
    fn emit(&self, occurrence: &EventOccurrence) -> Result<(), SinkError>;

    /// True if the sink has ever accepted `code`.
    fn has_fired(&self, code: &EventCode) -> bool;

    /// True if the sink accepted `code` less than `window` ago.
    fn fired_recently(&self, code: &EventCode, window: Duration) -> bool;
}

#[derive(Debug, Clone)]
struct Accepted {
    code: EventCode,
    at: DateTime<Utc>,
}

// Shared receipt log for sinks that answer history queries.
struct History {
    clock: Arc<dyn Clock>,
    accepted: RwLock<Vec<Accepted>>,
}

impl History {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            accepted: RwLock::new(Vec::new()),
        }
    }

    fn record(&self, code: &EventCode) {
        let at = self.clock.now();
        if let Ok(mut accepted) = self.accepted.write() {
            accepted.push(Accepted {
                code: code.clone(),
                at,
            });
        }
    }

    fn contains(&self, code: &EventCode) -> bool {
        self.accepted
            .read()
            .is_ok_and(|accepted| accepted.iter().any(|a| &a.code == code))
    }

    fn contains_since(&self, code: &EventCode, window: Duration) -> bool {
        let now = self.clock.now();
        self.accepted.read().is_ok_and(|accepted| {
            accepted.iter().rev().any(|a| {
                &a.code == code
                    && now
                        .signed_duration_since(a.at)
                        .to_std()
                        .map_or(true, |elapsed| elapsed < window)
            })
        })
    }
}

/// In-memory sink that keeps every accepted occurrence.
///
/// Intended for tests and embedding. Failure injection makes every
/// subsequent `emit` return the configured error.
pub struct InMemorySink {
    history: History,
    occurrences: RwLock<Vec<EventOccurrence>>,
    failure: RwLock<Option<SinkError>>,
}

impl std::fmt::Debug for InMemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySink").field("len", &self.len()).finish_non_exhaustive()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Uses `clock` to timestamp receipts for `fired_recently`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            history: History::new(clock),
            occurrences: RwLock::new(Vec::new()),
            failure: RwLock::new(None),
        }
    }

    /// Makes every following `emit` fail with `error`.
    pub fn fail_with(&self, error: SinkError) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = Some(error);
        }
    }

    /// Stops failure injection.
    pub fn recover(&self) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = None;
        }
    }

    /// Accepted occurrences in arrival order.
    #[must_use]
    pub fn occurrences(&self) -> Vec<EventOccurrence> {
        self.occurrences.read().map(|o| o.clone()).unwrap_or_default()
    }

    /// Codes of accepted occurrences in arrival order.
    #[must_use]
    pub fn codes(&self) -> Vec<EventCode> {
        self.occurrences
            .read()
            .map(|o| o.iter().map(|occ| occ.code.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.occurrences.read().map_or(0, |o| o.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemorySink {
    fn emit(&self, occurrence: &EventOccurrence) -> Result<(), SinkError> {
        if let Ok(failure) = self.failure.read() {
            if let Some(err) = failure.as_ref() {
                return Err(err.clone());
            }
        }
        self.history.record(&occurrence.code);
        let mut occurrences = self.occurrences.write().map_err(|_| SinkError::Unavailable {
            reason: "occurrence log poisoned".to_string(),
        })?;
        occurrences.push(occurrence.clone());
        Ok(())
    }

    fn has_fired(&self, code: &EventCode) -> bool {
        self.history.contains(code)
    }

    fn fired_recently(&self, code: &EventCode, window: Duration) -> bool {
        self.history.contains_since(code, window)
    }
}

/// Sink that forwards occurrences over a bounded channel without blocking.
///
/// A full queue is reported as `Unavailable`; a dropped receiver as
/// `Disconnected`. Rejected occurrences are counted, not retried.
pub struct ChannelSink {
    tx: Sender<EventOccurrence>,
    history: History,
    dropped: AtomicU64,
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl ChannelSink {
    /// Creates a sink with `capacity` queued occurrences (at least one) and
    /// the receiving end.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<EventOccurrence>) {
        Self::bounded_with_clock(capacity, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn bounded_with_clock(
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> (Self, Receiver<EventOccurrence>) {
        let (tx, rx) = bounded(capacity.max(1));
        let sink = Self {
            tx,
            history: History::new(clock),
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Number of occurrences that could not be queued.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, occurrence: &EventOccurrence) -> Result<(), SinkError> {
        match self.tx.try_send(occurrence.clone()) {
            Ok(()) => {
                self.history.record(&occurrence.code);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::Unavailable {
                    reason: "queue full".to_string(),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::Disconnected)
            }
        }
    }

    fn has_fired(&self, code: &EventCode) -> bool {
        self.history.contains(code)
    }

    fn fired_recently(&self, code: &EventCode, window: Duration) -> bool {
        self.history.contains_since(code, window)
    }
}
