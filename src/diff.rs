//! Structural diff between two snapshots of the same entity.
//!
//! The diff walks both attribute trees in key order and emits one
//! [`ChangeRecord`] per differing leaf. Nested maps produce dotted paths
//! (`settings.enabled`), list elements produce indexed paths (`tags[2]`), and
//! list membership changes are reported per element rather than as one
//! aggregate "list changed" record.
//!
//! A missing "before" snapshot is not an error: [`diff`] returns
//! [`DiffOutcome::Created`] and callers branch on it before classification.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{EntityType, Snapshot};
use crate::value::Value;

/// How a single attribute differs between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present after, absent before.
    Added,
    /// Present before, absent after.
    Removed,
    /// Present on both sides with different values.
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// One field-level difference.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Dotted/indexed path, e.g. `amount`, `settings.enabled`, `roles[1]`.
    pub attribute_key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    /// Top-level attribute this record belongs to (`settings` for `settings.enabled`).
    #[must_use]
    pub fn root_key(&self) -> &str {
        root_of(&self.attribute_key)
    }

    /// True if this record's path is `key` or nested beneath it.
    #[must_use]
    pub fn is_under(&self, key: &str) -> bool {
        path_is_under(&self.attribute_key, key)
    }
}

/// String comparison normalization applied before scalar equality.
///
/// Normalization only decides equality; change records always carry the
/// original values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    /// Ignore leading/trailing whitespace.
    pub trim_whitespace: bool,
    /// Treat runs of internal whitespace as a single space.
    pub collapse_internal_whitespace: bool,
    /// Compare strings case-insensitively.
    pub case_insensitive: bool,
}

impl Normalization {
    /// No normalization: strict equality.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            trim_whitespace: false,
            collapse_internal_whitespace: false,
            case_insensitive: false,
        }
    }

    #[must_use]
    pub const fn is_strict(&self) -> bool {
        !self.trim_whitespace && !self.collapse_internal_whitespace && !self.case_insensitive
    }

    fn apply<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if self.is_strict() {
            return Cow::Borrowed(s);
        }
        let mut out = if self.trim_whitespace { s.trim() } else { s }.to_string();
        if self.collapse_internal_whitespace {
            out = out.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        if self.case_insensitive {
            out = out.to_lowercase();
        }
        Cow::Owned(out)
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            trim_whitespace: true,
            collapse_internal_whitespace: false,
            case_insensitive: false,
        }
    }
}

/// How lists are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    /// Lists are multisets: each removed element yields `Removed` at its old
    /// index, each new element yields `Added` at its new index. Reordering is
    /// not a change.
    #[default]
    Membership,
    /// Lists are compared index by index, recursing into elements.
    Positional,
}

/// Options for one diff invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Attribute paths that never produce change records. An ignored key also
    /// hides everything nested beneath it.
    pub ignored_keys: BTreeSet<String>,
    pub normalization: Normalization,
    pub list_mode: ListMode,
}

impl DiffOptions {
    /// Default options with the given ignored keys.
    #[must_use]
    pub fn ignoring<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    #[must_use]
    pub fn with_list_mode(mut self, list_mode: ListMode) -> Self {
        self.list_mode = list_mode;
        self
    }

    fn is_ignored(&self, path: &str) -> bool {
        if self.ignored_keys.contains(path) {
            return true;
        }
        self.ignored_keys.iter().any(|k| path_is_under(path, k))
    }

    // Copy of `value` (found at `path`) with ignored descendants removed.
    fn prune<'v>(&self, path: &str, value: &'v Value) -> Cow<'v, Value> {
        if !self.ignored_keys.iter().any(|k| path_is_under(k, path)) {
            return Cow::Borrowed(value);
        }
        match value {
            Value::Map(map) => Cow::Owned(Value::Map(
                map.iter()
                    .filter_map(|(k, v)| {
                        let p = join_key(path, k);
                        (!self.is_ignored(&p)).then(|| (k.clone(), self.prune(&p, v).into_owned()))
                    })
                    .collect(),
            )),
            Value::List(items) => Cow::Owned(Value::List(
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| {
                        let p = join_index(path, i);
                        (!self.is_ignored(&p)).then(|| self.prune(&p, v).into_owned())
                    })
                    .collect(),
            )),
            _ => Cow::Borrowed(value),
        }
    }
}

/// Result of comparing a possibly-missing "before" snapshot with an "after" snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// No prior snapshot existed: the entity was created.
    Created,
    /// Field-level differences (possibly none).
    Changed(Vec<ChangeRecord>),
}

impl DiffOutcome {
    #[must_use]
    pub const fn is_creation(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Change records; always empty for a creation.
    #[must_use]
    pub fn changes(&self) -> &[ChangeRecord] {
        match self {
            Self::Created => &[],
            Self::Changed(c) => c,
        }
    }

    #[must_use]
    pub fn into_changes(self) -> Vec<ChangeRecord> {
        match self {
            Self::Created => Vec::new(),
            Self::Changed(c) => c,
        }
    }
}

/// Compares `before` against `after`.
///
/// The output is deterministic: maps are walked in key order and list
/// records follow element order.
///
/// # Examples
///
/// ```
/// use deltawatch::{diff, ChangeKind, DiffOptions, Snapshot};
///
/// let before = Snapshot::from_json("coupon", "3", serde_json::json!({"amount": "10"}));
/// let after = Snapshot::from_json("coupon", "3", serde_json::json!({"amount": "15"}));
///
/// let outcome = diff(Some(&before), &after, &DiffOptions::default());
/// let changes = outcome.changes();
/// assert_eq!(changes.len(), 1);
/// assert_eq!(changes[0].attribute_key, "amount");
/// assert_eq!(changes[0].kind, ChangeKind::Modified);
/// ```
#[must_use]
pub fn diff(before: Option<&Snapshot>, after: &Snapshot, options: &DiffOptions) -> DiffOutcome {
    let Some(before) = before else {
        return DiffOutcome::Created;
    };

    if before.fingerprint() == after.fingerprint() {
        return DiffOutcome::Changed(Vec::new());
    }

    let mut walker = Walker {
        after,
        options,
        out: Vec::new(),
    };
    walker.maps(
        "",
        before.attributes().iter(),
        after.attributes().iter(),
    );
    DiffOutcome::Changed(walker.out)
}

struct Walker<'a> {
    after: &'a Snapshot,
    options: &'a DiffOptions,
    out: Vec<ChangeRecord>,
}

impl Walker<'_> {
    fn push(&mut self, path: String, old: Option<&Value>, new: Option<&Value>, kind: ChangeKind) {
        self.out.push(ChangeRecord {
            entity_type: self.after.entity_type().clone(),
            entity_id: self.after.entity_id().to_string(),
            attribute_key: path,
            old_value: old.cloned(),
            new_value: new.cloned(),
            kind,
        });
    }

    fn maps<'v, B, A>(&mut self, prefix: &str, before: B, after: A)
    where
        B: Iterator<Item = (&'v String, &'v Value)>,
        A: Iterator<Item = (&'v String, &'v Value)>,
    {
        // Sorted merge of two key-ordered iterators.
        let mut before = before.peekable();
        let mut after = after.peekable();
        loop {
            let step = match (before.peek(), after.peek()) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some((bk, _)), Some((ak, _))) => bk.cmp(ak),
            };
            match step {
                std::cmp::Ordering::Less => {
                    if let Some((k, v)) = before.next() {
                        let path = join_key(prefix, k);
                        if !self.options.is_ignored(&path) {
                            self.push(path, Some(v), None, ChangeKind::Removed);
                        }
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some((k, v)) = after.next() {
                        let path = join_key(prefix, k);
                        if !self.options.is_ignored(&path) {
                            self.push(path, None, Some(v), ChangeKind::Added);
                        }
                    }
                }
                std::cmp::Ordering::Equal => {
                    if let (Some((k, old)), Some((_, new))) = (before.next(), after.next()) {
                        let path = join_key(prefix, k);
                        if !self.options.is_ignored(&path) {
                            self.value(path, old, new);
                        }
                    }
                }
            }
        }
    }

    fn value(&mut self, path: String, old: &Value, new: &Value) {
        match (old, new) {
            (Value::Map(o), Value::Map(n)) => self.maps(&path, o.iter(), n.iter()),
            (Value::List(o), Value::List(n)) => match self.options.list_mode {
                ListMode::Membership => self.list_membership(&path, o, n),
                ListMode::Positional => self.list_positional(&path, o, n),
            },
            _ if std::mem::discriminant(old) == std::mem::discriminant(new) => {
                if !scalars_equal(old, new, self.options.normalization) {
                    self.push(path, Some(old), Some(new), ChangeKind::Modified);
                }
            }
            _ => self.mismatched(path, old, new),
        }
    }

    // Values whose representations differ cannot be compared structurally;
    // both sides are reduced to their string form, minus ignored descendants.
    fn mismatched(&mut self, path: String, old: &Value, new: &Value) {
        let norm = self.options.normalization;
        let old_s = self.options.prune(&path, old).to_plain_string();
        let new_s = self.options.prune(&path, new).to_plain_string();
        if norm.apply(&old_s) == norm.apply(&new_s) {
            return;
        }
        debug!(
            attribute = %path,
            old_type = old.type_name(),
            new_type = new.type_name(),
            "attribute type changed, comparing string forms"
        );
        self.push(
            path,
            Some(&Value::String(old_s)),
            Some(&Value::String(new_s)),
            ChangeKind::Modified,
        );
    }

    fn list_membership(&mut self, path: &str, old: &[Value], new: &[Value]) {
        let norm = self.options.normalization;
        let mut matched_new = vec![false; new.len()];
        let mut removed = Vec::new();

        for (i, o) in old.iter().enumerate() {
            let hit = new
                .iter()
                .enumerate()
                .find(|(j, n)| !matched_new[*j] && values_equal(o, n, norm));
            match hit {
                Some((j, _)) => matched_new[j] = true,
                None => removed.push(i),
            }
        }

        for i in removed {
            let p = join_index(path, i);
            if !self.options.is_ignored(&p) {
                self.push(p, old.get(i), None, ChangeKind::Removed);
            }
        }
        for (j, n) in new.iter().enumerate() {
            if matched_new[j] {
                continue;
            }
            let p = join_index(path, j);
            if !self.options.is_ignored(&p) {
                self.push(p, None, Some(n), ChangeKind::Added);
            }
        }
    }

    fn list_positional(&mut self, path: &str, old: &[Value], new: &[Value]) {
        for i in 0..old.len().max(new.len()) {
            let p = join_index(path, i);
            if self.options.is_ignored(&p) {
                continue;
            }
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) => self.value(p, o, n),
                (Some(o), None) => self.push(p, Some(o), None, ChangeKind::Removed),
                (None, Some(n)) => self.push(p, None, Some(n), ChangeKind::Added),
                (None, None) => {}
            }
        }
    }
}

fn scalars_equal(old: &Value, new: &Value, norm: Normalization) -> bool {
    match (old, new) {
        (Value::String(o), Value::String(n)) => norm.apply(o) == norm.apply(n),
        (Value::Float(o), Value::Float(n)) => o == n || (o.is_nan() && n.is_nan()),
        _ => old == new,
    }
}

/// Deep equality under normalization, used for list membership.
fn values_equal(old: &Value, new: &Value, norm: Normalization) -> bool {
    match (old, new) {
        (Value::Map(o), Value::Map(n)) => {
            o.len() == n.len()
                && o.iter()
                    .zip(n.iter())
                    .all(|((ok, ov), (nk, nv))| ok == nk && values_equal(ov, nv, norm))
        }
        (Value::List(o), Value::List(n)) => {
            o.len() == n.len() && o.iter().zip(n.iter()).all(|(a, b)| values_equal(a, b, norm))
        }
        _ if std::mem::discriminant(old) == std::mem::discriminant(new) => {
            scalars_equal(old, new, norm)
        }
        _ => false,
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn join_index(prefix: &str, index: usize) -> String {
    format!("{prefix}[{index}]")
}

fn root_of(path: &str) -> &str {
    let end = path.find(|c| c == '.' || c == '[').unwrap_or(path.len());
    &path[..end]
}

/// True if `path` equals `key` or is nested beneath it.
pub(crate) fn path_is_under(path: &str, key: &str) -> bool {
    match path.strip_prefix(key) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') || rest.starts_with('['),
        None => false,
    }
}

/// Read-only view over a change list used by rule conditions.
#[derive(Debug, Clone, Copy)]
pub struct ChangeSet<'a> {
    records: &'a [ChangeRecord],
}

impl<'a> ChangeSet<'a> {
    #[must_use]
    pub const fn new(records: &'a [ChangeRecord]) -> Self {
        Self { records }
    }

    #[must_use]
    pub const fn records(&self) -> &'a [ChangeRecord] {
        self.records
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.records.len()
    }

    /// True if any record is at or beneath `key`.
    #[must_use]
    pub fn touches(&self, key: &str) -> bool {
        self.records.iter().any(|r| r.is_under(key))
    }

    /// The record at exactly `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&'a ChangeRecord> {
        self.records.iter().find(|r| r.attribute_key == key)
    }

    /// Records at or beneath `key`.
    pub fn under<'k>(&self, key: &'k str) -> impl Iterator<Item = &'a ChangeRecord> + 'k
    where
        'a: 'k,
    {
        let records = self.records;
        records.iter().filter(move |r| r.is_under(key))
    }

    /// Distinct top-level keys touched, in order of first appearance.
    #[must_use]
    pub fn root_keys(&self) -> Vec<&'a str> {
        let mut seen = Vec::new();
        for r in self.records {
            let root = r.root_key();
            if !seen.contains(&root) {
                seen.push(root);
            }
        }
        seen
    }
}
