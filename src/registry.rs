//! Per-scope correlation registry.
//!
//! Records which event codes fired (or are about to fire) within one
//! operation scope, and decides whether a candidate occurrence is committed
//! to the sink or suppressed. Rules query it to avoid redundant alerts
//! ("don't emit 'modified' if 'deleted' is firing").

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::entity::EntityKey;
use crate::error::SinkError;
use crate::event::{EventCode, EventOccurrence};
use crate::rules::Candidate;
use crate::sink::EventSink;

/// One entry of the fired log.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredEntry {
    pub code: EventCode,
    pub entity: EntityKey,
    pub at: DateTime<Utc>,
    /// False when the sink reported a failure.
    pub delivered: bool,
}

/// Why a candidate was not committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionReason {
    /// A `suppressed_by` code fired or was reserved at equal or higher precedence.
    SuppressedBy(EventCode),
    /// A `must_not_be_followed_by` code fired or was reserved in the same pass.
    FollowedBy(EventCode),
    /// The same code fired for the same entity within the coalescing window.
    Coalesced {
        window: Duration,
    },
    /// The entity's creation was already reported in this scope.
    AlreadyCreated,
    /// The entity's deletion was already reported in this scope.
    AlreadyDeleted,
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuppressedBy(code) => write!(f, "suppressed by {code}"),
            Self::FollowedBy(code) => write!(f, "followed by {code}"),
            Self::Coalesced { window } => write!(f, "coalesced within {}ms", window.as_millis()),
            Self::AlreadyCreated => write!(f, "already created"),
            Self::AlreadyDeleted => write!(f, "already deleted"),
        }
    }
}

/// Result of committing a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Sent to the sink successfully.
    Delivered,
    /// Recorded as fired, but the sink reported a failure.
    Undelivered(SinkError),
    Suppressed(SuppressionReason),
}

impl CommitOutcome {
    /// True if the occurrence counts as fired (delivered or not).
    #[must_use]
    pub const fn is_fired(&self) -> bool {
        matches!(self, Self::Delivered | Self::Undelivered(_))
    }

    #[must_use]
    pub const fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed(_))
    }
}

/// Event-code bookkeeping for one operation scope.
pub struct CorrelationRegistry {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    consult_sink_history: bool,
    fired: Vec<FiredEntry>,
    /// Codes reserved in the open pass, keyed to the best (lowest) priority.
    reserved: HashMap<EventCode, u32>,
    created: HashSet<EntityKey>,
    expected_creations: HashSet<EntityKey>,
    deleted: HashSet<EntityKey>,
}

impl fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("fired", &self.fired.len())
            .field("reserved", &self.reserved)
            .field("consult_sink_history", &self.consult_sink_history)
            .finish_non_exhaustive()
    }
}

impl CorrelationRegistry {
    /// Creates an empty registry.
    ///
    /// With `consult_sink_history`, fired-state queries also ask the sink, so
    /// codes emitted by earlier scopes count as fired.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, consult_sink_history: bool) -> Self {
        Self {
            sink,
            clock,
            consult_sink_history,
            fired: Vec::new(),
            reserved: HashMap::new(),
            created: HashSet::new(),
            expected_creations: HashSet::new(),
            deleted: HashSet::new(),
        }
    }

    /// True if `code` was committed in this scope.
    #[must_use]
    pub fn has_fired(&self, code: &EventCode) -> bool {
        self.fired.iter().any(|e| &e.code == code)
            || (self.consult_sink_history && self.sink.has_fired(code))
    }

    /// True if `code` was committed or is reserved in the open pass.
    #[must_use]
    pub fn will_or_has_fired(&self, code: &EventCode) -> bool {
        self.reserved.contains_key(code) || self.has_fired(code)
    }

    /// Like [`will_or_has_fired`](Self::will_or_has_fired), but only counts
    /// reservations made at `priority` or better.
    #[must_use]
    pub fn will_or_has_fired_at(&self, code: &EventCode, priority: u32) -> bool {
        self.reserved.get(code).is_some_and(|p| *p <= priority) || self.has_fired(code)
    }

    /// True if `code` was committed less than `window` ago.
    #[must_use]
    pub fn fired_recently(&self, code: &EventCode, window: Duration) -> bool {
        let now = self.clock.now();
        let local = self
            .fired
            .iter()
            .rev()
            .filter(|e| &e.code == code)
            .any(|e| within(now, e.at, window));
        local || (self.consult_sink_history && self.sink.fired_recently(code, window))
    }

    /// True if `code` was committed for `entity` less than `window` ago.
    ///
    /// Only the local log is consulted; the sink does not track entities.
    #[must_use]
    pub fn fired_recently_for(&self, code: &EventCode, entity: &EntityKey, window: Duration) -> bool {
        let now = self.clock.now();
        self.fired
            .iter()
            .rev()
            .filter(|e| &e.code == code && &e.entity == entity)
            .any(|e| within(now, e.at, window))
    }

    /// Marks `code` as about to fire in the open pass.
    pub fn reserve(&mut self, code: &EventCode, priority: u32) {
        self.reserved
            .entry(code.clone())
            .and_modify(|p| *p = (*p).min(priority))
            .or_insert(priority);
    }

    /// Starts a classification pass with no reservations.
    pub fn begin_pass(&mut self) {
        self.reserved.clear();
    }

    /// Ends the pass; reservations do not outlive it.
    pub fn end_pass(&mut self) {
        self.reserved.clear();
    }

    /// Applies correlation policy and, unless suppressed, hands the
    /// occurrence to the sink.
    pub fn commit(&mut self, candidate: Candidate) -> CommitOutcome {
        let own = &candidate.occurrence.code;

        for code in &candidate.suppressed_by {
            let hit = if code == own {
                self.has_fired(code)
            } else {
                self.will_or_has_fired_at(code, candidate.priority)
            };
            if hit {
                return self.suppressed(&candidate, SuppressionReason::SuppressedBy(code.clone()));
            }
        }

        for code in &candidate.must_not_be_followed_by {
            if code != own && self.will_or_has_fired(code) {
                return self.suppressed(&candidate, SuppressionReason::FollowedBy(code.clone()));
            }
        }

        let window = candidate.coalesce_window;
        if !window.is_zero() && self.fired_recently_for(own, &candidate.occurrence.entity, window) {
            return self.suppressed(&candidate, SuppressionReason::Coalesced { window });
        }

        self.deliver(candidate.occurrence)
    }

    /// Commits an entity's creation occurrence at most once per scope.
    pub fn commit_creation(&mut self, occurrence: EventOccurrence) -> CommitOutcome {
        if !self.mark_created(occurrence.entity.clone()) {
            debug!(entity = %occurrence.entity, "creation already reported");
            return CommitOutcome::Suppressed(SuppressionReason::AlreadyCreated);
        }
        self.deliver(occurrence)
    }

    /// Records the entity as created without emitting anything (entity types
    /// with no creation rule). Returns false if it was already created.
    pub fn mark_created(&mut self, key: EntityKey) -> bool {
        self.expected_creations.remove(&key);
        self.created.insert(key)
    }

    /// Commits an entity's deletion occurrence at most once per scope.
    pub fn commit_deletion(&mut self, occurrence: EventOccurrence) -> CommitOutcome {
        if !self.deleted.insert(occurrence.entity.clone()) {
            debug!(entity = %occurrence.entity, "deletion already reported");
            return CommitOutcome::Suppressed(SuppressionReason::AlreadyDeleted);
        }
        self.deliver(occurrence)
    }

    /// Declares that the entity is being created in this scope, so the next
    /// observation is classified as creation even if a snapshot exists.
    pub fn expect_creation(&mut self, key: EntityKey) {
        if !self.created.contains(&key) {
            self.expected_creations.insert(key);
        }
    }

    #[must_use]
    pub fn creation_expected(&self, key: &EntityKey) -> bool {
        self.expected_creations.contains(key)
    }

    /// True if the entity's creation was already committed in this scope.
    #[must_use]
    pub fn was_created(&self, key: &EntityKey) -> bool {
        self.created.contains(key)
    }

    #[must_use]
    pub fn was_deleted(&self, key: &EntityKey) -> bool {
        self.deleted.contains(key)
    }

    /// Fired log in commit order.
    #[must_use]
    pub fn fired(&self) -> &[FiredEntry] {
        &self.fired
    }

    fn suppressed(&self, candidate: &Candidate, reason: SuppressionReason) -> CommitOutcome {
        debug!(
            code = %candidate.occurrence.code,
            rule = %candidate.rule,
            entity = %candidate.occurrence.entity,
            %reason,
            "occurrence suppressed"
        );
        CommitOutcome::Suppressed(reason)
    }

    fn deliver(&mut self, occurrence: EventOccurrence) -> CommitOutcome {
        let result = self.sink.emit(&occurrence);
        let delivered = result.is_ok();
        self.fired.push(FiredEntry {
            code: occurrence.code.clone(),
            entity: occurrence.entity.clone(),
            at: self.clock.now(),
            delivered,
        });

        match result {
            Ok(()) => {
                info!(code = %occurrence.code, entity = %occurrence.entity, "event committed");
                CommitOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    code = %occurrence.code,
                    entity = %occurrence.entity,
                    error = %e,
                    "event sink failed, occurrence dropped"
                );
                CommitOutcome::Undelivered(e)
            }
        }
    }
}

// Elapsed time is strictly less than the window. Timestamps from the future
// (clock moved backwards) count as recent.
fn within(now: DateTime<Utc>, at: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map_or(true, |elapsed| elapsed < window)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::clock::ManualClock;
    use crate::sink::InMemorySink;

    fn occurrence(code: u32) -> EventOccurrence {
        EventOccurrence::new(
            EventCode::from(code),
            EntityKey::new("order", "9"),
            BTreeMap::new(),
            Utc::now(),
        )
    }

    fn candidate(code: u32, priority: u32) -> Candidate {
        Candidate {
            occurrence: occurrence(code),
            rule: format!("order:{code}"),
            priority,
            suppressed_by: Vec::new(),
            must_not_be_followed_by: Vec::new(),
            coalesce_window: Duration::ZERO,
        }
    }

    fn setup() -> (CorrelationRegistry, Arc<InMemorySink>, Arc<ManualClock>) {
        let sink = Arc::new(InMemorySink::new());
        let clock = Arc::new(ManualClock::default());
        let reg = CorrelationRegistry::new(sink.clone(), clock.clone(), false);
        (reg, sink, clock)
    }

    #[test]
    fn commit_records_and_emits() {
        let (mut reg, sink, _) = setup();
        let code = EventCode::from(9010);
        assert!(!reg.has_fired(&code));

        assert_eq!(reg.commit(candidate(9010, 1)), CommitOutcome::Delivered);
        assert!(reg.has_fired(&code));
        assert_eq!(sink.len(), 1);
        assert!(reg.fired()[0].delivered);
    }

    #[test]
    fn reservation_is_visible_until_pass_ends() {
        let (mut reg, _, _) = setup();
        let code = EventCode::from(2003);
        reg.begin_pass();
        reg.reserve(&code, 5);
        assert!(reg.will_or_has_fired(&code));
        assert!(!reg.has_fired(&code));
        assert!(reg.will_or_has_fired_at(&code, 5));
        assert!(!reg.will_or_has_fired_at(&code, 4));
        reg.end_pass();
        assert!(!reg.will_or_has_fired(&code));
    }

    #[test]
    fn suppressed_by_higher_precedence_reservation() {
        let (mut reg, sink, _) = setup();
        reg.begin_pass();
        reg.reserve(&EventCode::from(9010), 1);
        reg.reserve(&EventCode::from(9099), 99);

        let mut fallback = candidate(9099, 99);
        fallback.suppressed_by.push(EventCode::from(9010));
        assert_eq!(
            reg.commit(fallback),
            CommitOutcome::Suppressed(SuppressionReason::SuppressedBy(EventCode::from(9010)))
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn lower_precedence_reservation_does_not_suppress() {
        let (mut reg, _, _) = setup();
        reg.begin_pass();
        reg.reserve(&EventCode::from(1), 1);
        reg.reserve(&EventCode::from(2), 50);

        let mut specific = candidate(1, 1);
        specific.suppressed_by.push(EventCode::from(2));
        assert!(reg.commit(specific).is_fired());
    }

    #[test]
    fn must_not_be_followed_by_sees_whole_pass() {
        let (mut reg, _, _) = setup();
        reg.begin_pass();
        reg.reserve(&EventCode::from(2001), 1);
        reg.reserve(&EventCode::from(2003), 50);

        let mut updated = candidate(2001, 1);
        updated.must_not_be_followed_by.push(EventCode::from(2003));
        assert_eq!(
            reg.commit(updated),
            CommitOutcome::Suppressed(SuppressionReason::FollowedBy(EventCode::from(2003)))
        );
    }

    #[test]
    fn coalescing_window_is_strict() {
        let (mut reg, sink, clock) = setup();
        let mut first = candidate(9010, 1);
        first.coalesce_window = Duration::from_millis(1000);
        assert!(reg.commit(first.clone()).is_fired());

        clock.advance(chrono::Duration::milliseconds(5));
        assert_eq!(
            reg.commit(first.clone()),
            CommitOutcome::Suppressed(SuppressionReason::Coalesced {
                window: Duration::from_millis(1000)
            })
        );

        clock.advance(chrono::Duration::milliseconds(995));
        assert!(reg.commit(first).is_fired());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn coalescing_is_per_entity() {
        let (mut reg, sink, clock) = setup();
        let window = Duration::from_millis(1000);
        let mut first = candidate(2602, 1);
        first.coalesce_window = window;
        let mut other = first.clone();
        other.occurrence.entity = EntityKey::new("order", "10");

        assert!(reg.commit(first.clone()).is_fired());
        clock.advance(chrono::Duration::milliseconds(5));
        assert_eq!(reg.commit(other), CommitOutcome::Delivered);
        assert!(reg.commit(first).is_suppressed());
        assert_eq!(sink.len(), 2);
        assert!(reg.fired_recently_for(&EventCode::from(2602), &EntityKey::new("order", "10"), window));
        assert!(!reg.fired_recently_for(&EventCode::from(2602), &EntityKey::new("order", "11"), window));
    }

    #[test]
    fn zero_window_never_coalesces() {
        let (mut reg, sink, _) = setup();
        assert!(reg.commit(candidate(1, 1)).is_fired());
        assert!(reg.commit(candidate(1, 1)).is_fired());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn sink_failure_still_counts_as_fired() {
        let (mut reg, sink, _) = setup();
        sink.fail_with(SinkError::Unavailable {
            reason: "down".into(),
        });

        let outcome = reg.commit(candidate(9010, 1));
        assert!(matches!(outcome, CommitOutcome::Undelivered(SinkError::Unavailable { .. })));
        assert!(reg.has_fired(&EventCode::from(9010)));
        assert!(!reg.fired()[0].delivered);
    }

    #[test]
    fn creation_committed_once() {
        let (mut reg, sink, _) = setup();
        let key = EntityKey::new("order", "9");
        reg.expect_creation(key.clone());
        assert!(reg.creation_expected(&key));

        assert!(reg.commit_creation(occurrence(9000)).is_fired());
        assert!(reg.was_created(&key));
        assert!(!reg.creation_expected(&key));
        assert_eq!(
            reg.commit_creation(occurrence(9000)),
            CommitOutcome::Suppressed(SuppressionReason::AlreadyCreated)
        );
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn deletion_committed_once() {
        let (mut reg, _, _) = setup();
        assert!(reg.commit_deletion(occurrence(9003)).is_fired());
        assert!(reg.commit_deletion(occurrence(9003)).is_suppressed());
        assert!(reg.was_deleted(&EntityKey::new("order", "9")));
    }

    #[test]
    fn sink_history_consulted_when_enabled() {
        let sink = Arc::new(InMemorySink::new());
        let clock = Arc::new(ManualClock::default());
        let mut earlier = CorrelationRegistry::new(sink.clone(), clock.clone(), false);
        assert!(earlier.commit(candidate(7, 1)).is_fired());

        let isolated = CorrelationRegistry::new(sink.clone(), clock.clone(), false);
        assert!(!isolated.has_fired(&EventCode::from(7)));

        let shared = CorrelationRegistry::new(sink, clock, true);
        assert!(shared.has_fired(&EventCode::from(7)));
        assert!(shared.fired_recently(&EventCode::from(7), Duration::from_secs(1)));
    }
}
