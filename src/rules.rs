//! Classification rules.
//!
//! Rules turn the change records of one entity (plus ambient context) into
//! candidate [`EventOccurrence`]s. Rules for an entity type are evaluated in
//! ascending `priority` order, most specific first; the catch-all fallback
//! always comes last and fires only when no more specific rule matched.
//!
//! Conditions are declarative ([`Condition`]) so they can be inspected and
//! serialized, with an escape hatch for closures ([`Condition::custom`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::{ChangeKind, ChangeRecord, ChangeSet};
use crate::entity::{EntityKey, EntityType, Snapshot};
use crate::error::{DeltaResult, ValidationError};
use crate::event::{EventCode, EventOccurrence};
use crate::registry::CorrelationRegistry;
use crate::value::Value;

/// Ambient information about who performed the action.
///
/// Only used to fill occurrence variables, never for control flow in the
/// engine itself (custom predicates may still read it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationContext {
    /// Identity of the user performing the action.
    pub actor: Option<String>,
    /// Request metadata (client IP, user agent, job name, ...).
    pub metadata: BTreeMap<String, String>,
    /// Links to the entity (edit URL, view URL, ...).
    pub links: BTreeMap<String, String>,
}

impl ClassificationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_link(mut self, key: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.insert(key.into(), url.into());
        self
    }
}

/// Everything a rule can look at for one entity.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub key: &'a EntityKey,
    pub before: Option<&'a Snapshot>,
    pub after: Option<&'a Snapshot>,
    pub changes: ChangeSet<'a>,
    pub context: &'a ClassificationContext,
}

impl<'a> Observation<'a> {
    /// Old value at `path`: from the change record if it changed, otherwise
    /// from the "before" snapshot.
    #[must_use]
    pub fn old_value(&self, path: &str) -> Option<&'a Value> {
        match self.changes.get(path) {
            Some(rec) => rec.old_value.as_ref(),
            None => self.before.and_then(|s| s.lookup(path)),
        }
    }

    /// New value at `path`: from the change record if it changed, otherwise
    /// from the "after" snapshot.
    #[must_use]
    pub fn new_value(&self, path: &str) -> Option<&'a Value> {
        match self.changes.get(path) {
            Some(rec) => rec.new_value.as_ref(),
            None => self.after.and_then(|s| s.lookup(path)),
        }
    }
}

type PredicateFn = dyn Fn(&Observation<'_>) -> bool + Send + Sync;
type VariableFn = dyn Fn(&Observation<'_>, &mut BTreeMap<String, String>) + Send + Sync;

/// Named closure predicate.
#[derive(Clone)]
pub struct CustomPredicate {
    name: String,
    f: Arc<PredicateFn>,
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPredicate").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Predicate over the full change set of one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// At least one change record exists.
    AnyChange,

    /// At least one of the keys (or something nested beneath it) changed.
    AnyChanged {
        keys: Vec<String>,
    },

    /// Every key changed in the same action.
    AllChanged {
        keys: Vec<String>,
    },

    /// `key` changed and its new value is `value`.
    ChangedTo {
        key: String,
        value: Value,
    },

    /// `key` changed and its old value was `value`.
    ChangedFrom {
        key: String,
        value: Value,
    },

    /// `key` changed from exactly `from` to exactly `to`.
    Transition {
        key: String,
        from: Value,
        to: Value,
    },

    /// A record of the given kind exists at or beneath `key`.
    KindIs {
        key: String,
        kind: ChangeKind,
    },

    /// `key` changed and its new value's string form matches the regex.
    Matches {
        key: String,
        pattern: String,
    },

    All {
        conditions: Vec<Condition>,
    },

    Any {
        conditions: Vec<Condition>,
    },

    Not {
        condition: Box<Condition>,
    },

    /// Closure predicate. Not serializable; deserializes to a never-matching
    /// placeholder.
    Custom {
        name: String,
        #[serde(skip)]
        predicate: Option<CustomPredicate>,
    },
}

impl Condition {
    /// Creates an `AnyChanged` condition.
    #[must_use]
    pub fn any_changed<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyChanged {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates an `AllChanged` condition.
    #[must_use]
    pub fn all_changed<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllChanged {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a `ChangedTo` condition.
    #[must_use]
    pub fn changed_to(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::ChangedTo {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a `Transition` condition.
    #[must_use]
    pub fn transition(key: impl Into<String>, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self::Transition {
            key: key.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Creates a `Matches` condition.
    #[must_use]
    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    /// Creates a closure condition.
    pub fn custom<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Observation<'_>) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        Self::Custom {
            name: name.clone(),
            predicate: Some(CustomPredicate { name, f: Arc::new(f) }),
        }
    }

    fn evaluate(&self, obs: &Observation<'_>, regexes: &HashMap<String, Regex>) -> bool {
        let changes = &obs.changes;
        match self {
            Self::AnyChange => !changes.is_empty(),
            Self::AnyChanged { keys } => keys.iter().any(|k| changes.touches(k)),
            Self::AllChanged { keys } => !keys.is_empty() && keys.iter().all(|k| changes.touches(k)),
            Self::ChangedTo { key, value } => changes
                .get(key)
                .and_then(|r| r.new_value.as_ref())
                .is_some_and(|v| loosely_equal(v, value)),
            Self::ChangedFrom { key, value } => changes
                .get(key)
                .and_then(|r| r.old_value.as_ref())
                .is_some_and(|v| loosely_equal(v, value)),
            Self::Transition { key, from, to } => changes.get(key).is_some_and(|r| {
                r.old_value.as_ref().is_some_and(|v| loosely_equal(v, from))
                    && r.new_value.as_ref().is_some_and(|v| loosely_equal(v, to))
            }),
            Self::KindIs { key, kind } => changes.under(key).any(|r| r.kind == *kind),
            Self::Matches { key, pattern } => {
                let Some(re) = regexes.get(pattern) else {
                    return false;
                };
                changes
                    .get(key)
                    .and_then(|r| r.new_value.as_ref())
                    .is_some_and(|v| re.is_match(&v.to_plain_string()))
            }
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(obs, regexes)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(obs, regexes)),
            Self::Not { condition } => !condition.evaluate(obs, regexes),
            Self::Custom { predicate, .. } => predicate.as_ref().is_some_and(|p| (p.f)(obs)),
        }
    }

    // Keys a matching rule consumes when it declares no explicit watch list.
    fn referenced_keys<'c>(&'c self, out: &mut Vec<&'c str>) {
        match self {
            Self::AnyChanged { keys } | Self::AllChanged { keys } => {
                out.extend(keys.iter().map(String::as_str));
            }
            Self::ChangedTo { key, .. }
            | Self::ChangedFrom { key, .. }
            | Self::Transition { key, .. }
            | Self::KindIs { key, .. }
            | Self::Matches { key, .. } => out.push(key),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.referenced_keys(out);
                }
            }
            Self::AnyChange | Self::Not { .. } | Self::Custom { .. } => {}
        }
    }

    fn patterns<'c>(&'c self, out: &mut Vec<&'c str>) {
        match self {
            Self::Matches { pattern, .. } => out.push(pattern),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.patterns(out);
                }
            }
            Self::Not { condition } => condition.patterns(out),
            _ => {}
        }
    }
}

// Coerced values arrive as strings, so compare string forms as a fallback.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    actual == expected || actual.to_plain_string() == expected.to_plain_string()
}

/// Where an occurrence variable takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum VariableSource {
    Literal { value: String },
    EntityId,
    EntityType,
    Actor,
    Context { key: String },
    Link { key: String },
    /// Old value at a path (change record first, then the "before" snapshot).
    OldValue { path: String },
    /// New value at a path (change record first, then the "after" snapshot).
    NewValue { path: String },
    /// Comma-separated top-level keys that changed.
    ChangedKeys,
    ChangeCount,
}

impl VariableSource {
    #[must_use]
    pub fn old(path: impl Into<String>) -> Self {
        Self::OldValue { path: path.into() }
    }

    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self::NewValue { path: path.into() }
    }

    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal { value: value.into() }
    }

    fn resolve(&self, obs: &Observation<'_>) -> Option<String> {
        match self {
            Self::Literal { value } => Some(value.clone()),
            Self::EntityId => Some(obs.key.entity_id.clone()),
            Self::EntityType => Some(obs.key.entity_type.to_string()),
            Self::Actor => obs.context.actor.clone(),
            Self::Context { key } => obs.context.metadata.get(key).cloned(),
            Self::Link { key } => obs.context.links.get(key).cloned(),
            Self::OldValue { path } => obs.old_value(path).map(Value::to_plain_string),
            Self::NewValue { path } => obs.new_value(path).map(Value::to_plain_string),
            Self::ChangedKeys => Some(obs.changes.root_keys().join(", ")),
            Self::ChangeCount => Some(obs.changes.len().to_string()),
        }
    }
}

/// Lifecycle slot a rule occupies for its entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Fires when no "before" snapshot exists.
    Created,
    /// Fires when the producer reports the entity gone.
    Deleted,
    /// Specific modification rule.
    Modified,
    /// Catch-all "entity modified, unspecified cause".
    Fallback,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Deleted => write!(f, "deleted"),
            Self::Modified => write!(f, "modified"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A classification rule.
#[derive(Clone)]
pub struct Rule {
    name: String,
    code: EventCode,
    entity_type: EntityType,
    kind: RuleKind,
    priority: u32,
    condition: Condition,
    watches: Vec<String>,
    variables: BTreeMap<String, VariableSource>,
    extra_variables: Option<Arc<VariableFn>>,
    suppressed_by: Vec<EventCode>,
    must_not_be_followed_by: Vec<EventCode>,
    coalesce_window: Option<Duration>,
    regexes: Arc<HashMap<String, Regex>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("entity_type", &self.entity_type)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("condition", &self.condition)
            .field("suppressed_by", &self.suppressed_by)
            .field("must_not_be_followed_by", &self.must_not_be_followed_by)
            .finish_non_exhaustive()
    }
}

impl Rule {
    /// Builder for a specific modification rule.
    #[must_use]
    pub fn builder() -> RuleBuilder {
        RuleBuilder::new(RuleKind::Modified)
    }

    /// Builder for the creation rule of an entity type.
    #[must_use]
    pub fn created(code: impl Into<EventCode>, entity_type: impl Into<EntityType>) -> RuleBuilder {
        RuleBuilder::new(RuleKind::Created).code(code).entity_type(entity_type)
    }

    /// Builder for the deletion rule of an entity type.
    #[must_use]
    pub fn deleted(code: impl Into<EventCode>, entity_type: impl Into<EntityType>) -> RuleBuilder {
        RuleBuilder::new(RuleKind::Deleted).code(code).entity_type(entity_type)
    }

    /// Builder for the catch-all rule of an entity type (lowest precedence).
    #[must_use]
    pub fn fallback(code: impl Into<EventCode>, entity_type: impl Into<EntityType>) -> RuleBuilder {
        RuleBuilder::new(RuleKind::Fallback)
            .code(code)
            .entity_type(entity_type)
            .priority(u32::MAX)
            .when(Condition::AnyChange)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn code(&self) -> &EventCode {
        &self.code
    }

    #[must_use]
    pub const fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        self.kind
    }

    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    #[must_use]
    pub const fn condition(&self) -> &Condition {
        &self.condition
    }

    #[must_use]
    pub fn suppressed_by(&self) -> &[EventCode] {
        &self.suppressed_by
    }

    #[must_use]
    pub fn must_not_be_followed_by(&self) -> &[EventCode] {
        &self.must_not_be_followed_by
    }

    /// Whether the rule's predicate holds for this observation.
    #[must_use]
    pub fn matches(&self, obs: &Observation<'_>) -> bool {
        match self.kind {
            RuleKind::Created | RuleKind::Deleted => true,
            RuleKind::Modified | RuleKind::Fallback => self.condition.evaluate(obs, &self.regexes),
        }
    }

    /// Indices of the change records this rule consumes when it matches.
    fn consumed(&self, changes: &[ChangeRecord]) -> Vec<usize> {
        let mut keys: Vec<&str> = self.watches.iter().map(String::as_str).collect();
        if keys.is_empty() {
            self.condition.referenced_keys(&mut keys);
        }
        changes
            .iter()
            .enumerate()
            .filter(|(_, r)| keys.is_empty() || keys.iter().any(|k| r.is_under(k)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Builds the occurrence for a matching observation.
    #[must_use]
    pub fn build(&self, obs: &Observation<'_>, now: DateTime<Utc>) -> EventOccurrence {
        let mut vars = BTreeMap::new();
        for (name, source) in &self.variables {
            if let Some(v) = source.resolve(obs) {
                vars.insert(name.clone(), v);
            }
        }
        if let Some(extra) = &self.extra_variables {
            extra(obs, &mut vars);
        }
        EventOccurrence::new(self.code.clone(), obs.key.clone(), vars, now)
    }

    /// Builds a commit candidate carrying this rule's correlation policy.
    #[must_use]
    pub fn candidate(
        &self,
        obs: &Observation<'_>,
        now: DateTime<Utc>,
        default_window: Duration,
    ) -> Candidate {
        Candidate {
            occurrence: self.build(obs, now),
            rule: self.name.clone(),
            priority: self.priority,
            suppressed_by: self.suppressed_by.clone(),
            must_not_be_followed_by: self.must_not_be_followed_by.clone(),
            coalesce_window: self.coalesce_window.unwrap_or(default_window),
        }
    }
}

/// Builder for [`Rule`].
///
/// # Example
/// ```
/// use deltawatch::{Condition, Rule, VariableSource};
///
/// let rule = Rule::builder()
///     .code(9010)
///     .entity_type("order")
///     .priority(1)
///     .when(Condition::any_changed(["status"]))
///     .variable("OldStatus", VariableSource::old("status"))
///     .variable("NewStatus", VariableSource::new("status"))
///     .build()
///     .unwrap();
/// assert_eq!(rule.priority(), 1);
/// ```
#[derive(Clone)]
pub struct RuleBuilder {
    kind: RuleKind,
    name: Option<String>,
    code: Option<EventCode>,
    entity_type: Option<EntityType>,
    priority: Option<u32>,
    condition: Option<Condition>,
    watches: Vec<String>,
    variables: BTreeMap<String, VariableSource>,
    extra_variables: Option<Arc<VariableFn>>,
    suppressed_by: Vec<EventCode>,
    must_not_be_followed_by: Vec<EventCode>,
    coalesce_window: Option<Duration>,
}

impl RuleBuilder {
    fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            name: None,
            code: None,
            entity_type: None,
            priority: None,
            condition: None,
            watches: Vec::new(),
            variables: BTreeMap::new(),
            extra_variables: None,
            suppressed_by: Vec::new(),
            must_not_be_followed_by: Vec::new(),
            coalesce_window: None,
        }
    }

    /// Human-readable rule name used in logs (default: `<type>:<code>`).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Event code emitted by the rule (required).
    #[must_use]
    pub fn code(mut self, code: impl Into<EventCode>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Entity type the rule applies to (required).
    #[must_use]
    pub fn entity_type(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Evaluation order; lower runs first (required for modification rules).
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Predicate over the change set (required for modification rules).
    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Attribute key (or prefix) this rule consumes when it matches.
    #[must_use]
    pub fn watch(mut self, key: impl Into<String>) -> Self {
        self.watches.push(key.into());
        self
    }

    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, source: VariableSource) -> Self {
        self.variables.insert(name.into(), source);
        self
    }

    /// Closure that adds or overrides variables after the declarative ones.
    #[must_use]
    pub fn variables_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Observation<'_>, &mut BTreeMap<String, String>) + Send + Sync + 'static,
    {
        self.extra_variables = Some(Arc::new(f));
        self
    }

    /// Drop this rule's occurrence when `code` has fired or is reserved by a
    /// rule evaluated no later than this one.
    #[must_use]
    pub fn suppressed_by(mut self, code: impl Into<EventCode>) -> Self {
        self.suppressed_by.push(code.into());
        self
    }

    /// Drop this rule's occurrence when `code` is reserved anywhere in the same
    /// pass or has already fired.
    #[must_use]
    pub fn must_not_be_followed_by(mut self, code: impl Into<EventCode>) -> Self {
        self.must_not_be_followed_by.push(code.into());
        self
    }

    /// Coalescing window for repeated occurrences of this rule's code.
    #[must_use]
    pub fn coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = Some(window);
        self
    }

    /// Validates and builds the rule.
    pub fn build(self) -> Result<Rule, ValidationError> {
        let code = self.code.ok_or_else(|| ValidationError::MissingField {
            field: "code".to_string(),
        })?;
        if code.is_empty() {
            return Err(ValidationError::EmptyEventCode);
        }

        let entity_type = self.entity_type.ok_or_else(|| ValidationError::MissingField {
            field: "entity_type".to_string(),
        })?;
        if entity_type.as_str().is_empty() {
            return Err(ValidationError::EmptyEntityType);
        }

        let (priority, condition) = match self.kind {
            RuleKind::Created | RuleKind::Deleted => (0, Condition::AnyChange),
            RuleKind::Modified | RuleKind::Fallback => {
                let priority = self.priority.ok_or_else(|| ValidationError::MissingField {
                    field: "priority".to_string(),
                })?;
                let condition = self.condition.ok_or_else(|| ValidationError::MissingField {
                    field: "condition".to_string(),
                })?;
                (priority, condition)
            }
        };

        let mut patterns = Vec::new();
        condition.patterns(&mut patterns);
        let mut regexes = HashMap::new();
        for pattern in patterns {
            let re = Regex::new(pattern).map_err(|e| ValidationError::InvalidRegex {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            regexes.insert(pattern.to_string(), re);
        }

        let name = self
            .name
            .unwrap_or_else(|| format!("{entity_type}:{code}"));

        Ok(Rule {
            name,
            code,
            entity_type,
            kind: self.kind,
            priority,
            condition,
            watches: self.watches,
            variables: self.variables,
            extra_variables: self.extra_variables,
            suppressed_by: self.suppressed_by,
            must_not_be_followed_by: self.must_not_be_followed_by,
            coalesce_window: self.coalesce_window,
            regexes: Arc::new(regexes),
        })
    }
}

/// A rule's occurrence together with the correlation policy to apply on commit.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub occurrence: EventOccurrence,
    pub rule: String,
    pub priority: u32,
    pub suppressed_by: Vec<EventCode>,
    pub must_not_be_followed_by: Vec<EventCode>,
    pub coalesce_window: Duration,
}

/// All rules registered for one entity type.
#[derive(Debug, Clone)]
pub struct EntityRules {
    entity_type: EntityType,
    created: Option<Rule>,
    deleted: Option<Rule>,
    /// Ascending priority; the fallback (if any) is last.
    modifications: Vec<Rule>,
}

impl EntityRules {
    #[must_use]
    pub const fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    #[must_use]
    pub const fn created(&self) -> Option<&Rule> {
        self.created.as_ref()
    }

    #[must_use]
    pub const fn deleted(&self) -> Option<&Rule> {
        self.deleted.as_ref()
    }

    #[must_use]
    pub fn modifications(&self) -> &[Rule] {
        &self.modifications
    }

    /// Evaluates modification rules in priority order and returns candidates.
    ///
    /// Each matching rule reserves its code with the registry before the next
    /// rule is evaluated. The fallback is skipped once any more specific
    /// match consumed change records.
    pub fn classify(
        &self,
        obs: &Observation<'_>,
        registry: &mut CorrelationRegistry,
        now: DateTime<Utc>,
        default_window: Duration,
    ) -> Vec<Candidate> {
        let records = obs.changes.records();
        let mut consumed = vec![false; records.len()];
        let mut candidates = Vec::new();

        for rule in &self.modifications {
            if rule.kind == RuleKind::Fallback && consumed.iter().any(|c| *c) {
                debug!(rule = %rule.name, "fallback skipped, changes already consumed");
                continue;
            }
            if !rule.matches(obs) {
                continue;
            }

            registry.reserve(&rule.code, rule.priority);
            for i in rule.consumed(records) {
                if let Some(slot) = consumed.get_mut(i) {
                    *slot = true;
                }
            }
            debug!(rule = %rule.name, code = %rule.code, priority = rule.priority, "rule matched");
            candidates.push(rule.candidate(obs, now, default_window));
        }

        candidates
    }
}

/// Rule sets for every monitored entity type.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    by_type: HashMap<EntityType, EntityRules>,
}

impl RuleCatalog {
    #[must_use]
    pub fn builder() -> RuleCatalogBuilder {
        RuleCatalogBuilder::default()
    }

    /// Groups and validates rules.
    ///
    /// # Errors
    /// - `DuplicateLifecycleRule` for a second created/deleted/fallback rule of one type
    /// - `DuplicatePriority` when two modification rules of one type share a priority
    /// - `FallbackNotLast` when the fallback is not the largest priority
    /// - `MissingFallback` when modification rules exist without a fallback
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self, ValidationError> {
        let mut grouped: HashMap<EntityType, EntityRules> = HashMap::new();

        for rule in rules {
            let entry = grouped
                .entry(rule.entity_type.clone())
                .or_insert_with(|| EntityRules {
                    entity_type: rule.entity_type.clone(),
                    created: None,
                    deleted: None,
                    modifications: Vec::new(),
                });

            let slot = match rule.kind {
                RuleKind::Created => &mut entry.created,
                RuleKind::Deleted => &mut entry.deleted,
                RuleKind::Modified | RuleKind::Fallback => {
                    if rule.kind == RuleKind::Fallback
                        && entry.modifications.iter().any(|r| r.kind == RuleKind::Fallback)
                    {
                        return Err(ValidationError::DuplicateLifecycleRule {
                            entity_type: rule.entity_type.to_string(),
                            kind: rule.kind.to_string(),
                        });
                    }
                    if entry.modifications.iter().any(|r| r.priority == rule.priority) {
                        return Err(ValidationError::DuplicatePriority {
                            entity_type: rule.entity_type.to_string(),
                            priority: rule.priority,
                        });
                    }
                    entry.modifications.push(rule);
                    continue;
                }
            };
            if slot.is_some() {
                return Err(ValidationError::DuplicateLifecycleRule {
                    entity_type: rule.entity_type.to_string(),
                    kind: rule.kind.to_string(),
                });
            }
            *slot = Some(rule);
        }

        for rules in grouped.values_mut() {
            rules.modifications.sort_by_key(|r| r.priority);
            let Some(last) = rules.modifications.last() else {
                continue;
            };
            if last.kind != RuleKind::Fallback {
                if let Some(fallback) = rules.modifications.iter().find(|r| r.kind == RuleKind::Fallback) {
                    return Err(ValidationError::FallbackNotLast {
                        entity_type: rules.entity_type.to_string(),
                        priority: fallback.priority,
                    });
                }
                return Err(ValidationError::MissingFallback {
                    entity_type: rules.entity_type.to_string(),
                });
            }
        }

        Ok(Self { by_type: grouped })
    }

    /// Rules for an entity type, or `None` for unmonitored types.
    #[must_use]
    pub fn rules_for(&self, entity_type: &EntityType) -> Option<&EntityRules> {
        self.by_type.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.by_type.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Accumulates rules for [`RuleCatalog::from_rules`].
#[derive(Debug, Clone, Default)]
pub struct RuleCatalogBuilder {
    rules: Vec<Rule>,
}

impl RuleCatalogBuilder {
    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Validates and freezes the accumulated rules.
    ///
    /// # Errors
    /// `DeltaError::Validation` for any rule set [`RuleCatalog::from_rules`] rejects.
    pub fn build(self) -> DeltaResult<RuleCatalog> {
        Ok(RuleCatalog::from_rules(self.rules)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::diff::{diff, DiffOptions};
    use crate::sink::InMemorySink;

    fn registry() -> CorrelationRegistry {
        CorrelationRegistry::new(
            Arc::new(InMemorySink::new()),
            Arc::new(ManualClock::default()),
            false,
        )
    }

    fn order_rules() -> RuleCatalog {
        RuleCatalog::builder()
            .rule(
                Rule::builder()
                    .code(9010)
                    .entity_type("order")
                    .priority(1)
                    .when(Condition::any_changed(["status"]))
                    .variable("OldStatus", VariableSource::old("status"))
                    .variable("NewStatus", VariableSource::new("status"))
                    .build()
                    .unwrap(),
            )
            .rule(
                Rule::builder()
                    .code(9020)
                    .entity_type("order")
                    .priority(2)
                    .when(Condition::all_changed(["billing.city", "billing.zip"]))
                    .build()
                    .unwrap(),
            )
            .rule(Rule::fallback(9099, "order").suppressed_by(9010).build().unwrap())
            .build()
            .unwrap()
    }

    fn observe<'a>(
        key: &'a EntityKey,
        before: &'a Snapshot,
        after: &'a Snapshot,
        changes: &'a [ChangeRecord],
        ctx: &'a ClassificationContext,
    ) -> Observation<'a> {
        Observation {
            key,
            before: Some(before),
            after: Some(after),
            changes: ChangeSet::new(changes),
            context: ctx,
        }
    }

    fn codes(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.occurrence.code.as_str()).collect()
    }

    #[test]
    fn specific_rule_consumes_and_skips_fallback() {
        let catalog = order_rules();
        let rules = catalog.rules_for(&EntityType::from("order")).unwrap();
        let before = Snapshot::from_json("order", "9", json!({"status": "processing"}));
        let after = Snapshot::from_json("order", "9", json!({"status": "completed"}));
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        let ctx = ClassificationContext::new().with_actor("alice");
        let obs = observe(after.key(), &before, &after, &changes, &ctx);

        let mut reg = registry();
        let candidates = rules.classify(&obs, &mut reg, Utc::now(), Duration::ZERO);
        assert_eq!(codes(&candidates), vec!["9010"]);
        assert_eq!(candidates[0].occurrence.variable("OldStatus"), Some("processing"));
        assert_eq!(candidates[0].occurrence.variable("NewStatus"), Some("completed"));
        assert!(reg.will_or_has_fired(&EventCode::from(9010)));
    }

    #[test]
    fn fallback_fires_for_unclaimed_changes() {
        let catalog = order_rules();
        let rules = catalog.rules_for(&EntityType::from("order")).unwrap();
        let before = Snapshot::from_json("order", "9", json!({"note": "a"}));
        let after = Snapshot::from_json("order", "9", json!({"note": "b"}));
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        let ctx = ClassificationContext::new();
        let obs = observe(after.key(), &before, &after, &changes, &ctx);

        let candidates = rules.classify(&obs, &mut registry(), Utc::now(), Duration::ZERO);
        assert_eq!(codes(&candidates), vec!["9099"]);
        assert_eq!(candidates[0].suppressed_by, vec![EventCode::from(9010)]);
    }

    #[test]
    fn all_changed_requires_every_key() {
        let catalog = order_rules();
        let rules = catalog.rules_for(&EntityType::from("order")).unwrap();
        let before = Snapshot::from_json("order", "9", json!({"billing": {"city": "A", "zip": "1"}}));
        let only_city = Snapshot::from_json("order", "9", json!({"billing": {"city": "B", "zip": "1"}}));
        let both = Snapshot::from_json("order", "9", json!({"billing": {"city": "B", "zip": "2"}}));
        let ctx = ClassificationContext::new();

        let changes = diff(Some(&before), &only_city, &DiffOptions::default()).into_changes();
        let obs = observe(only_city.key(), &before, &only_city, &changes, &ctx);
        let got = rules.classify(&obs, &mut registry(), Utc::now(), Duration::ZERO);
        assert_eq!(codes(&got), vec!["9099"]);

        let changes = diff(Some(&before), &both, &DiffOptions::default()).into_changes();
        let obs = observe(both.key(), &before, &both, &changes, &ctx);
        let got = rules.classify(&obs, &mut registry(), Utc::now(), Duration::ZERO);
        assert_eq!(codes(&got), vec!["9020"]);
    }

    #[test]
    fn declarative_conditions() {
        let before = Snapshot::from_json(
            "user",
            "5",
            json!({"status": "pending", "email": "a@x.org", "roles": ["author"]}),
        );
        let after = Snapshot::from_json(
            "user",
            "5",
            json!({"status": "active", "email": "a@y.com", "roles": ["author", "editor"]}),
        );
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        let ctx = ClassificationContext::new();
        let obs = observe(after.key(), &before, &after, &changes, &ctx);
        let none = HashMap::new();

        assert!(Condition::transition("status", "pending", "active").evaluate(&obs, &none));
        assert!(!Condition::transition("status", "active", "pending").evaluate(&obs, &none));
        assert!(Condition::changed_to("status", "active").evaluate(&obs, &none));
        assert!(Condition::ChangedFrom {
            key: "email".into(),
            value: "a@x.org".into()
        }
        .evaluate(&obs, &none));
        assert!(Condition::KindIs {
            key: "roles".into(),
            kind: ChangeKind::Added
        }
        .evaluate(&obs, &none));
        assert!(!Condition::KindIs {
            key: "roles".into(),
            kind: ChangeKind::Removed
        }
        .evaluate(&obs, &none));
        assert!(Condition::Not {
            condition: Box::new(Condition::any_changed(["password"]))
        }
        .evaluate(&obs, &none));
        assert!(Condition::Any {
            conditions: vec![
                Condition::any_changed(["password"]),
                Condition::any_changed(["email"]),
            ]
        }
        .evaluate(&obs, &none));
        assert!(Condition::custom("actorless", |o| o.context.actor.is_none()).evaluate(&obs, &none));
    }

    #[test]
    fn regex_condition_is_compiled_at_build() {
        let rule = Rule::builder()
            .code(4005)
            .entity_type("user")
            .priority(1)
            .when(Condition::matches("email", r"@y\.com$"))
            .build()
            .unwrap();
        let before = Snapshot::from_json("user", "5", json!({"email": "a@x.org"}));
        let after = Snapshot::from_json("user", "5", json!({"email": "a@y.com"}));
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        let ctx = ClassificationContext::new();
        let obs = observe(after.key(), &before, &after, &changes, &ctx);
        assert!(rule.matches(&obs));

        let err = Rule::builder()
            .code(4005)
            .entity_type("user")
            .priority(1)
            .when(Condition::matches("email", "("))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRegex { .. }));
    }

    #[test]
    fn variables_fall_back_to_snapshots() {
        let rule = Rule::builder()
            .code(2002)
            .entity_type("product")
            .priority(1)
            .when(Condition::any_changed(["price"]))
            .variable("Title", VariableSource::new("title"))
            .variable("Actor", VariableSource::Actor)
            .variable("Ip", VariableSource::Context { key: "ip".into() })
            .variable("EditLink", VariableSource::Link { key: "edit".into() })
            .variable("Id", VariableSource::EntityId)
            .variable("Changed", VariableSource::ChangedKeys)
            .variable("Missing", VariableSource::new("nope"))
            .variables_with(|obs, vars| {
                vars.insert("Count".into(), obs.changes.len().to_string());
            })
            .build()
            .unwrap();
        let before = Snapshot::from_json("product", "42", json!({"title": "A", "price": "10"}));
        let after = Snapshot::from_json("product", "42", json!({"title": "A", "price": "12"}));
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        let ctx = ClassificationContext::new()
            .with_actor("bob")
            .with_metadata("ip", "10.0.0.1")
            .with_link("edit", "/edit/42");
        let obs = observe(after.key(), &before, &after, &changes, &ctx);

        let occ = rule.build(&obs, Utc::now());
        assert_eq!(occ.variable("Title"), Some("A"));
        assert_eq!(occ.variable("Actor"), Some("bob"));
        assert_eq!(occ.variable("Ip"), Some("10.0.0.1"));
        assert_eq!(occ.variable("EditLink"), Some("/edit/42"));
        assert_eq!(occ.variable("Id"), Some("42"));
        assert_eq!(occ.variable("Changed"), Some("price"));
        assert_eq!(occ.variable("Count"), Some("1"));
        assert!(occ.variable("Missing").is_none());
    }

    #[test]
    fn explicit_watch_limits_consumption() {
        let rule = Rule::builder()
            .code(1)
            .entity_type("t")
            .priority(1)
            .when(Condition::custom("always", |_| true))
            .watch("a")
            .build()
            .unwrap();
        let before = Snapshot::from_json("t", "1", json!({"a": 1, "b": 1}));
        let after = Snapshot::from_json("t", "1", json!({"a": 2, "b": 2}));
        let changes = diff(Some(&before), &after, &DiffOptions::default()).into_changes();
        assert_eq!(rule.consumed(&changes), vec![0]);

        let greedy = Rule::builder()
            .code(2)
            .entity_type("t")
            .priority(2)
            .when(Condition::AnyChange)
            .build()
            .unwrap();
        assert_eq!(greedy.consumed(&changes), vec![0, 1]);
    }

    #[test]
    fn builder_requires_fields() {
        let err = Rule::builder().entity_type("x").priority(1).build().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "code"));

        let err = Rule::builder().code(1).entity_type("x").when(Condition::AnyChange).build().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { ref field } if field == "priority"));

        let err = Rule::builder().code("").entity_type("x").priority(1).when(Condition::AnyChange).build().unwrap_err();
        assert!(matches!(err, ValidationError::EmptyEventCode));

        assert!(Rule::created(2000, "post").build().is_ok());
    }

    #[test]
    fn catalog_rejects_duplicate_priority() {
        let a = Rule::builder().code(1).entity_type("t").priority(5).when(Condition::AnyChange).build().unwrap();
        let b = Rule::builder().code(2).entity_type("t").priority(5).when(Condition::AnyChange).build().unwrap();
        let fb = Rule::fallback(3, "t").build().unwrap();
        let err = RuleCatalog::from_rules([a, b, fb]).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicatePriority { priority: 5, .. }));
    }

    #[test]
    fn catalog_requires_fallback_last() {
        let a = Rule::builder().code(1).entity_type("t").priority(5).when(Condition::AnyChange).build().unwrap();
        let err = RuleCatalog::from_rules([a.clone()]).unwrap_err();
        assert!(matches!(err, ValidationError::MissingFallback { .. }));

        let fb = Rule::fallback(3, "t").priority(1).build().unwrap();
        let err = RuleCatalog::from_rules([a, fb]).unwrap_err();
        assert!(matches!(err, ValidationError::FallbackNotLast { priority: 1, .. }));
    }

    #[test]
    fn catalog_builder_reports_validation_errors() {
        let err = RuleCatalog::builder()
            .rule(Rule::builder().code(1).entity_type("t").priority(5).when(Condition::AnyChange).build().unwrap())
            .build()
            .unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(err.as_validation(), Some(ValidationError::MissingFallback { .. })));
    }

    #[test]
    fn catalog_rejects_second_creation_rule() {
        let err = RuleCatalog::from_rules([
            Rule::created(1, "post").build().unwrap(),
            Rule::created(2, "post").build().unwrap(),
        ])
        .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateLifecycleRule { .. }));
    }

    #[test]
    fn catalog_orders_by_priority() {
        let catalog = RuleCatalog::builder()
            .rule(Rule::fallback(99, "t").build().unwrap())
            .rule(Rule::builder().code(3).entity_type("t").priority(30).when(Condition::AnyChange).build().unwrap())
            .rule(Rule::builder().code(1).entity_type("t").priority(10).when(Condition::AnyChange).build().unwrap())
            .rule(Rule::created(0, "t").build().unwrap())
            .build()
            .unwrap();
        let rules = catalog.rules_for(&EntityType::from("t")).unwrap();
        let priorities: Vec<u32> = rules.modifications().iter().map(Rule::priority).collect();
        assert_eq!(priorities, vec![10, 30, u32::MAX]);
        assert!(rules.created().is_some());
        assert!(rules.deleted().is_none());
        assert!(catalog.rules_for(&EntityType::from("unknown")).is_none());
    }

    #[test]
    fn condition_serde_round_trip_keeps_shape() {
        let cond = Condition::All {
            conditions: vec![
                Condition::transition("status", "pending", "active"),
                Condition::any_changed(["email"]),
            ],
        };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "all");
        assert_eq!(json["conditions"][0]["type"], "transition");
        let back: Condition = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Condition::All { ref conditions } if conditions.len() == 2));
    }
}
