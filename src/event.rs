//! Event codes and occurrences.
//!
//! An [`EventOccurrence`] is a semantic alert ("coupon amount changed") built
//! by a classification rule. It becomes an alert only once the correlation
//! registry commits it to the event sink.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityKey;

/// Alert code understood by the event sink (e.g. `9010`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EventCode(String);

impl EventCode {
    /// Creates a code from its textual form.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for EventCode {
    fn from(code: u32) -> Self {
        Self(code.to_string())
    }
}

impl From<&str> for EventCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for EventCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<EventCode> for String {
    fn from(code: EventCode) -> Self {
        code.0
    }
}

/// A candidate or committed alert.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub id: Uuid,
    pub code: EventCode,
    /// Entity the occurrence describes.
    pub entity: EntityKey,
    /// Values substituted into the sink's message template.
    pub variables: BTreeMap<String, String>,
    pub emitted_at: DateTime<Utc>,
}

impl EventOccurrence {
    /// Creates an occurrence with a fresh id.
    #[must_use]
    pub fn new(
        code: EventCode,
        entity: EntityKey,
        variables: BTreeMap<String, String>,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            entity,
            variables,
            emitted_at,
        }
    }

    /// Returns a variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_code_forms() {
        assert_eq!(EventCode::from(9010).as_str(), "9010");
        assert_eq!(EventCode::from(" 9010 "), EventCode::from(9010));
        assert!(EventCode::from("  ").is_empty());
    }

    #[test]
    fn event_code_serializes_as_string() {
        let json = serde_json::to_string(&EventCode::from(2002)).unwrap();
        assert_eq!(json, "\"2002\"");
        let code: EventCode = serde_json::from_str("\" 2002\"").unwrap();
        assert_eq!(code, EventCode::from(2002));
    }

    #[test]
    fn occurrence_variables() {
        let occ = EventOccurrence::new(
            EventCode::from(9010),
            EntityKey::new("order", "9"),
            BTreeMap::from([("Status".to_string(), "completed".to_string())]),
            Utc::now(),
        );
        assert_eq!(occ.variable("Status"), Some("completed"));
        assert!(occ.variable("Missing").is_none());
        assert!(!occ.id.is_nil());
    }
}
