//! Engine entry point and operation scopes.
//!
//! A [`ChangeEngine`] holds the immutable parts (rule catalog, configuration,
//! sink, clock) and is shared freely. Every logical user action gets its own
//! [`OperationScope`], which owns the snapshot store and the correlation
//! registry. Nothing scope-local is global, so concurrent scopes never see
//! each other's fired codes.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::diff::{diff, ChangeRecord, ChangeSet};
use crate::entity::{Attributes, EntityKey, EntityType, Snapshot};
use crate::error::SinkError;
use crate::event::{EventCode, EventOccurrence};
use crate::registry::{CommitOutcome, CorrelationRegistry, SuppressionReason};
use crate::rules::{ClassificationContext, Observation, RuleCatalog};
use crate::sink::EventSink;
use crate::snapshot::SnapshotStore;

/// Shared, immutable engine state.
#[derive(Clone)]
pub struct ChangeEngine {
    catalog: Arc<RuleCatalog>,
    config: Arc<EngineConfig>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ChangeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEngine")
            .field("entity_types", &self.catalog.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChangeEngine {
    /// Creates an engine using the system clock.
    #[must_use]
    pub fn new(catalog: RuleCatalog, config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a scope for one logical user action.
    #[must_use]
    pub fn begin_scope(&self) -> OperationScope {
        let scope = OperationScope {
            id: Uuid::new_v4(),
            engine: self.clone(),
            snapshots: None,
            registry: None,
            stats: ScopeStats::default(),
        };
        debug!(scope = %scope.id, "operation scope opened");
        scope
    }
}

/// What an observation turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// No "before" snapshot, or creation was expected.
    Created,
    Modified,
    /// Diff produced no change records.
    Unchanged,
    Deleted,
    /// The entity type has no rules; changes are reported but nothing fires.
    Unmonitored,
    /// The entity was created earlier in this scope; modification rules are
    /// not evaluated.
    SuppressedByCreation,
}

/// Diagnostics for one `observe` call.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationReport {
    pub entity: EntityKey,
    pub outcome: ObservationOutcome,
    pub changes: Vec<ChangeRecord>,
    /// Occurrences recorded as fired (including undelivered ones).
    pub committed: Vec<EventOccurrence>,
    pub suppressed: Vec<(EventCode, SuppressionReason)>,
    pub undelivered: Vec<(EventCode, SinkError)>,
}

impl ObservationReport {
    fn new(entity: EntityKey, outcome: ObservationOutcome, changes: Vec<ChangeRecord>) -> Self {
        Self {
            entity,
            outcome,
            changes,
            committed: Vec::new(),
            suppressed: Vec::new(),
            undelivered: Vec::new(),
        }
    }

    fn record(&mut self, occurrence: EventOccurrence, outcome: CommitOutcome, stats: &mut ScopeStats) {
        match outcome {
            CommitOutcome::Delivered => {
                stats.committed += 1;
                self.committed.push(occurrence);
            }
            CommitOutcome::Undelivered(err) => {
                stats.committed += 1;
                stats.sink_failures += 1;
                self.undelivered.push((occurrence.code.clone(), err));
                self.committed.push(occurrence);
            }
            CommitOutcome::Suppressed(reason) => {
                stats.suppressed += 1;
                self.suppressed.push((occurrence.code, reason));
            }
        }
    }

    /// Codes committed by this observation, in commit order.
    #[must_use]
    pub fn committed_codes(&self) -> Vec<&EventCode> {
        self.committed.iter().map(|o| &o.code).collect()
    }
}

/// Totals reported when a scope finishes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSummary {
    pub scope_id: Uuid,
    pub snapshots: usize,
    pub observations: usize,
    pub committed: usize,
    pub suppressed: usize,
    pub sink_failures: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct ScopeStats {
    observations: usize,
    committed: usize,
    suppressed: usize,
    sink_failures: usize,
}

/// State owned by one logical user action.
///
/// The snapshot store and correlation registry are created on first use and
/// dropped with the scope. Discarding a scope without calling
/// [`finish`](Self::finish) is fine (e.g. when the host action aborts).
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use deltawatch::{
///     ChangeEngine, ClassificationContext, Condition, EngineConfig, InMemorySink, Rule,
///     RuleCatalog, Snapshot,
/// };
///
/// let catalog = RuleCatalog::builder()
///     .rule(Rule::builder().code(2002).entity_type("coupon").priority(1)
///         .when(Condition::any_changed(["amount"])).build().unwrap())
///     .rule(Rule::fallback(2099, "coupon").build().unwrap())
///     .build()
///     .unwrap();
/// let sink = Arc::new(InMemorySink::new());
/// let engine = ChangeEngine::new(catalog, EngineConfig::default(), sink.clone());
///
/// let mut scope = engine.begin_scope();
/// scope.capture_snapshot(Snapshot::from_json("coupon", "3", serde_json::json!({"amount": "10"})));
/// let after = Snapshot::from_json("coupon", "3", serde_json::json!({"amount": "15"}));
/// let report = scope.observe(&after, &ClassificationContext::new());
/// assert_eq!(report.changes.len(), 1);
/// assert_eq!(sink.len(), 1);
/// ```
pub struct OperationScope {
    id: Uuid,
    engine: ChangeEngine,
    snapshots: Option<SnapshotStore>,
    registry: Option<CorrelationRegistry>,
    stats: ScopeStats,
}

impl fmt::Debug for OperationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationScope")
            .field("id", &self.id)
            .field("snapshots", &self.snapshots.as_ref().map_or(0, SnapshotStore::len))
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl OperationScope {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Captures the "before" state of an entity. First write wins.
    pub fn capture(
        &mut self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        attributes: Attributes,
    ) -> bool {
        self.capture_snapshot(Snapshot::with_capture_time(
            entity_type,
            entity_id,
            attributes,
            self.engine.clock.now(),
        ))
    }

    /// Captures an already built "before" snapshot. First write wins.
    pub fn capture_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let key = snapshot.key().clone();
        let stored = self
            .snapshots
            .get_or_insert_with(SnapshotStore::new)
            .capture_snapshot(snapshot);
        if stored {
            debug!(scope = %self.id, entity = %key, "before snapshot captured");
        }
        stored
    }

    /// The captured "before" snapshot, if any.
    #[must_use]
    pub fn before(&self, entity_type: &EntityType, entity_id: &str) -> Option<&Snapshot> {
        self.snapshots.as_ref()?.get(entity_type, entity_id)
    }

    /// Declares that the entity is being created in this scope.
    ///
    /// The next observation is classified as creation even if a snapshot was
    /// captured, and modification rules for the entity never fire.
    pub fn expect_creation(&mut self, entity_type: impl Into<EntityType>, entity_id: impl Into<String>) {
        let key = EntityKey::new(entity_type, entity_id);
        self.registry_mut().expect_creation(key);
    }

    /// Diffs `after` against the captured "before" state, classifies the
    /// changes and commits the resulting occurrences.
    pub fn observe(&mut self, after: &Snapshot, context: &ClassificationContext) -> ObservationReport {
        self.stats.observations += 1;
        let key = after.key().clone();
        let now = self.engine.clock.now();
        let engine = self.engine.clone();
        let registry = self.registry.get_or_insert_with(|| new_registry(&engine));
        let before = self.snapshots.as_ref().and_then(|s| s.get_by_key(&key));
        let rules = engine.catalog.rules_for(&key.entity_type);

        if registry.was_created(&key) {
            debug!(scope = %self.id, entity = %key, "entity created in this scope, modification suppressed");
            return ObservationReport::new(key, ObservationOutcome::SuppressedByCreation, Vec::new());
        }

        let options = engine.config.diff_options(&key.entity_type);
        let outcome = diff(before, after, &options);

        if outcome.is_creation() || registry.creation_expected(&key) {
            let mut report = ObservationReport::new(key.clone(), ObservationOutcome::Created, Vec::new());
            match rules.and_then(|r| r.created()) {
                Some(rule) => {
                    let obs = Observation {
                        key: &key,
                        before: None,
                        after: Some(after),
                        changes: ChangeSet::new(&[]),
                        context,
                    };
                    let occurrence = rule.build(&obs, now);
                    let committed = registry.commit_creation(occurrence.clone());
                    report.record(occurrence, committed, &mut self.stats);
                }
                None => {
                    registry.mark_created(key.clone());
                }
            }
            debug!(scope = %self.id, entity = %key, "creation observed");
            return report;
        }

        let changes = outcome.into_changes();
        if changes.is_empty() {
            debug!(scope = %self.id, entity = %key, "no changes");
            return ObservationReport::new(key, ObservationOutcome::Unchanged, changes);
        }

        let Some(rules) = rules else {
            debug!(scope = %self.id, entity = %key, changes = changes.len(), "no rules for entity type");
            return ObservationReport::new(key, ObservationOutcome::Unmonitored, changes);
        };

        let obs = Observation {
            key: &key,
            before,
            after: Some(after),
            changes: ChangeSet::new(&changes),
            context,
        };
        registry.begin_pass();
        let candidates = rules.classify(&obs, registry, now, engine.config.default_coalesce_window);
        let mut report = ObservationReport::new(key.clone(), ObservationOutcome::Modified, Vec::new());
        for candidate in candidates {
            let occurrence = candidate.occurrence.clone();
            let committed = registry.commit(candidate);
            report.record(occurrence, committed, &mut self.stats);
        }
        registry.end_pass();

        debug!(
            scope = %self.id,
            entity = %key,
            changes = changes.len(),
            committed = report.committed.len(),
            suppressed = report.suppressed.len(),
            "modification observed"
        );
        report.changes = changes;
        report
    }

    /// Reports that the entity was deleted. At most one deletion occurrence
    /// is committed per entity per scope.
    pub fn observe_deleted(
        &mut self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        context: &ClassificationContext,
    ) -> ObservationReport {
        self.stats.observations += 1;
        let key = EntityKey::new(entity_type, entity_id);
        let now = self.engine.clock.now();
        let engine = self.engine.clone();
        let registry = self.registry.get_or_insert_with(|| new_registry(&engine));
        let before = self.snapshots.as_ref().and_then(|s| s.get_by_key(&key));

        let mut report = ObservationReport::new(key.clone(), ObservationOutcome::Deleted, Vec::new());
        let Some(rule) = engine.catalog.rules_for(&key.entity_type).and_then(|r| r.deleted()) else {
            debug!(scope = %self.id, entity = %key, "no deletion rule for entity type");
            return report;
        };

        let obs = Observation {
            key: &key,
            before,
            after: None,
            changes: ChangeSet::new(&[]),
            context,
        };
        let occurrence = rule.build(&obs, now);
        let committed = registry.commit_deletion(occurrence.clone());
        report.record(occurrence, committed, &mut self.stats);
        report
    }

    /// True if `code` was committed in this scope.
    #[must_use]
    pub fn has_fired(&self, code: &EventCode) -> bool {
        match &self.registry {
            Some(r) => r.has_fired(code),
            None => self.engine.config.consult_sink_history && self.engine.sink.has_fired(code),
        }
    }

    /// True if `code` was committed in this scope or is reserved by a
    /// classification pass in progress.
    #[must_use]
    pub fn will_or_has_fired(&self, code: &EventCode) -> bool {
        match &self.registry {
            Some(r) => r.will_or_has_fired(code),
            None => self.has_fired(code),
        }
    }

    /// True if `code` was committed in this scope less than `window` ago.
    #[must_use]
    pub fn fired_recently(&self, code: &EventCode, window: std::time::Duration) -> bool {
        match &self.registry {
            Some(r) => r.fired_recently(code, window),
            None => {
                self.engine.config.consult_sink_history && self.engine.sink.fired_recently(code, window)
            }
        }
    }

    /// Closes the scope, dropping its snapshots and fired log.
    pub fn finish(self) -> ScopeSummary {
        let summary = ScopeSummary {
            scope_id: self.id,
            snapshots: self.snapshots.as_ref().map_or(0, SnapshotStore::len),
            observations: self.stats.observations,
            committed: self.stats.committed,
            suppressed: self.stats.suppressed,
            sink_failures: self.stats.sink_failures,
        };
        info!(
            scope = %summary.scope_id,
            snapshots = summary.snapshots,
            observations = summary.observations,
            committed = summary.committed,
            suppressed = summary.suppressed,
            sink_failures = summary.sink_failures,
            "operation scope finished"
        );
        summary
    }

    fn registry_mut(&mut self) -> &mut CorrelationRegistry {
        let engine = &self.engine;
        self.registry.get_or_insert_with(|| new_registry(engine))
    }
}

fn new_registry(engine: &ChangeEngine) -> CorrelationRegistry {
    CorrelationRegistry::new(
        Arc::clone(&engine.sink),
        Arc::clone(&engine.clock),
        engine.config.consult_sink_history,
    )
}
