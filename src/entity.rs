//! Entity identity and immutable snapshots.
//!
//! An entity is identified by its type (e.g. `"product"`, `"order"`) and a
//! producer-assigned id. A [`Snapshot`] is a frozen copy of its attributes at
//! one point in time; once captured it is never mutated.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::Value;

/// Attribute map of a snapshot. Ordered so diffs and fingerprints are stable.
pub type Attributes = BTreeMap<String, Value>;

/// Classification of monitored entities.
///
/// The set of entity types grows with the monitored surface, so this is an
/// open string rather than an enum. Surrounding whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Creates an entity type, trimming surrounding whitespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.len() == name.len() {
            Self(name)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Creates an entity type, rejecting empty names.
    pub fn parse(name: impl Into<String>) -> Result<Self, ValidationError> {
        let ty = Self::new(name);
        if ty.0.is_empty() {
            return Err(ValidationError::EmptyEntityType);
        }
        Ok(ty)
    }

    /// Returns the type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<EntityType> for String {
    fn from(ty: EntityType) -> Self {
        ty.0
    }
}

/// `(entity type, entity id)` pair keying snapshots and per-entity bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    /// Creates a key.
    #[must_use]
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

/// Immutable copy of an entity's attributes at one point in time.
///
/// # Examples
///
/// ```
/// use deltawatch::{Snapshot, Value};
///
/// let snap = Snapshot::from_json("product", "42", serde_json::json!({"title": "A"}));
/// assert_eq!(snap.key().to_string(), "product#42");
/// assert_eq!(snap.get("title"), Some(&Value::from("A")));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    key: EntityKey,
    attributes: Attributes,
    captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Captures a snapshot now.
    #[must_use]
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self::with_capture_time(entity_type, entity_id, attributes, Utc::now())
    }

    /// Captures a snapshot with an explicit capture time.
    #[must_use]
    pub fn with_capture_time(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        attributes: Attributes,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: EntityKey::new(entity_type, entity_id),
            attributes,
            captured_at,
        }
    }

    /// Builds a snapshot from a JSON object. Non-object JSON is stored under
    /// the single attribute `"value"`.
    #[must_use]
    pub fn from_json(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<String>,
        json: serde_json::Value,
    ) -> Self {
        let attributes = match Value::from(json) {
            Value::Map(map) => map,
            other => BTreeMap::from([("value".to_string(), other)]),
        };
        Self::new(entity_type, entity_id, attributes)
    }

    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    #[must_use]
    pub const fn entity_type(&self) -> &EntityType {
        &self.key.entity_type
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.key.entity_id
    }

    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Resolves a dotted/indexed attribute path such as `settings.limits[0].max`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = split_path(path).into_iter();
        let Some(PathSegment::Key(first)) = segments.next() else {
            return None;
        };
        let mut current = self.attributes.get(first)?;
        for segment in segments {
            current = match (segment, current) {
                (PathSegment::Key(k), Value::Map(map)) => map.get(k)?,
                (PathSegment::Index(i), Value::List(items)) => items.get(i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Stable blake3 hash over the attribute tree.
    ///
    /// Two snapshots with identical attributes always share a fingerprint,
    /// regardless of entity id or capture time. Floats are hashed by bit
    /// pattern, so non-finite values stay distinct.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hash_map(&mut hasher, &self.attributes);
        *hasher.finalize().as_bytes()
    }
}

// Each node is a tag byte followed by its payload; strings and collections
// carry a length prefix so adjacent nodes cannot run together.
fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(&[0]);
        }
        Value::Bool(b) => {
            hasher.update(&[1, u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(&[2]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update(&[3]);
            hasher.update(&f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(&[4]);
            hash_str(hasher, s);
        }
        Value::List(items) => {
            hasher.update(&[5]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Map(map) => {
            hasher.update(&[6]);
            hash_map(hasher, map);
        }
    }
}

fn hash_map(hasher: &mut blake3::Hasher, map: &BTreeMap<String, Value>) {
    hasher.update(&(map.len() as u64).to_le_bytes());
    for (key, value) in map {
        hash_str(hasher, key);
        hash_value(hasher, value);
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

#[derive(Debug, PartialEq)]
enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

// `a.b[2].c` -> Key(a), Key(b), Index(2), Key(c). Malformed indices become keys.
fn split_path(path: &str) -> Vec<PathSegment<'_>> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            out.push(PathSegment::Key(key));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(end) = stripped.find(']') else {
                out.push(PathSegment::Key(rest));
                break;
            };
            match stripped[..end].parse::<usize>() {
                Ok(i) => out.push(PathSegment::Index(i)),
                Err(_) => out.push(PathSegment::Key(&stripped[..end])),
            }
            rest = &stripped[end + 1..];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_trims() {
        assert_eq!(EntityType::new("  order "), EntityType::new("order"));
        assert_eq!(EntityType::from("order").as_str(), "order");
    }

    #[test]
    fn test_entity_type_deserialize_trims() {
        let ty: EntityType = serde_json::from_str("\" order \"").unwrap();
        assert_eq!(ty, EntityType::from("order"));
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"order\"");

        let key: EntityKey = serde_json::from_str(r#"{"entity_type": "coupon\n", "entity_id": "3"}"#).unwrap();
        assert_eq!(key, EntityKey::new("coupon", "3"));
    }

    #[test]
    fn test_entity_type_parse_rejects_empty() {
        assert!(matches!(
            EntityType::parse("   "),
            Err(ValidationError::EmptyEntityType)
        ));
        assert!(EntityType::parse("coupon").is_ok());
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("order", "9");
        assert_eq!(key.to_string(), "order#9");
    }

    #[test]
    fn test_snapshot_from_json_object() {
        let snap = Snapshot::from_json("coupon", "3", serde_json::json!({"amount": "10"}));
        assert_eq!(snap.entity_type().as_str(), "coupon");
        assert_eq!(snap.entity_id(), "3");
        assert_eq!(snap.get("amount"), Some(&Value::from("10")));
        assert!(snap.get("missing").is_none());
    }

    #[test]
    fn test_snapshot_from_json_scalar() {
        let snap = Snapshot::from_json("option", "blogname", serde_json::json!("My site"));
        assert_eq!(snap.get("value"), Some(&Value::from("My site")));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("a.b[2].c"),
            vec![
                PathSegment::Key("a"),
                PathSegment::Key("b"),
                PathSegment::Index(2),
                PathSegment::Key("c"),
            ]
        );
        assert_eq!(split_path("roles[0]"), vec![PathSegment::Key("roles"), PathSegment::Index(0)]);
    }

    #[test]
    fn test_snapshot_lookup_nested() {
        let snap = Snapshot::from_json(
            "form",
            "7",
            serde_json::json!({"title": "Contact", "settings": {"limits": [{"max": 5}]}}),
        );
        assert_eq!(snap.lookup("title"), Some(&Value::from("Contact")));
        assert_eq!(snap.lookup("settings.limits[0].max"), Some(&Value::Int(5)));
        assert!(snap.lookup("settings.limits[3]").is_none());
        assert!(snap.lookup("title.nested").is_none());
        assert!(snap.lookup("").is_none());
    }

    #[test]
    fn test_fingerprint_ignores_identity_and_time() {
        let a = Snapshot::from_json("product", "1", serde_json::json!({"title": "A", "price": 10}));
        let b = Snapshot::from_json("product", "2", serde_json::json!({"price": 10, "title": "A"}));
        let c = Snapshot::from_json("product", "1", serde_json::json!({"title": "B", "price": 10}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_non_finite_floats() {
        let snap = |f: f64| {
            let mut attrs = Attributes::new();
            attrs.insert("ratio".to_string(), Value::Float(f));
            Snapshot::new("metric", "1", attrs)
        };
        let inf = snap(f64::INFINITY).fingerprint();
        let neg = snap(f64::NEG_INFINITY).fingerprint();
        let nan = snap(f64::NAN).fingerprint();
        assert_ne!(inf, neg);
        assert_ne!(inf, nan);
        assert_ne!(neg, nan);
        assert_ne!(inf, snap(0.0).fingerprint());
    }

    #[test]
    fn test_fingerprint_keeps_types_apart() {
        let a = Snapshot::from_json("product", "1", serde_json::json!({"price": 10}));
        let b = Snapshot::from_json("product", "1", serde_json::json!({"price": "10"}));
        let c = Snapshot::from_json("product", "1", serde_json::json!({"tags": ["ab", "c"]}));
        let d = Snapshot::from_json("product", "1", serde_json::json!({"tags": ["a", "bc"]}));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(c.fingerprint(), d.fingerprint());
    }
}
