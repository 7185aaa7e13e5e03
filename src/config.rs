//! Engine configuration.
//!
//! Global diff defaults plus per-entity-type policies (ignored keys and
//! overrides). Loadable from JSON; durations are given in milliseconds.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diff::{DiffOptions, ListMode, Normalization};
use crate::entity::EntityType;
use crate::error::{DeltaResult, ValidationError};

/// Per-entity-type diff policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPolicy {
    /// Volatile attributes (timestamps, cache fields) that never count as changes.
    pub ignored_keys: BTreeSet<String>,
    /// Overrides the engine-wide list comparison mode.
    pub list_mode: Option<ListMode>,
    /// Overrides the engine-wide string normalization.
    pub normalization: Option<Normalization>,
}

impl EntityPolicy {
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
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Coalescing window for rules that do not set their own.
    #[serde(rename = "default_coalesce_window_ms", with = "duration_ms")]
    pub default_coalesce_window: Duration,
    pub normalization: Normalization,
    pub list_mode: ListMode,
    /// Also ask the sink whether a code fired in an earlier scope.
    pub consult_sink_history: bool,
    pub policies: BTreeMap<EntityType, EntityPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_coalesce_window: Duration::from_millis(1000),
            normalization: Normalization::default(),
            list_mode: ListMode::default(),
            consult_sink_history: false,
            policies: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON configuration document. Missing fields take defaults.
    ///
    /// # Errors
    /// `DeltaError::Validation` wrapping `InvalidConfig` when the document is
    /// malformed or a policy is keyed by an empty entity type.
    pub fn from_json_str(json: &str) -> DeltaResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        if config.policies.keys().any(|t| t.as_str().is_empty()) {
            return Err(ValidationError::InvalidConfig {
                reason: "policy keyed by empty entity type".to_string(),
            }
            .into());
        }
        Ok(config)
    }

    /// Sets the policy for an entity type.
    #[must_use]
    pub fn with_policy(mut self, entity_type: impl Into<EntityType>, policy: EntityPolicy) -> Self {
        self.policies.insert(entity_type.into(), policy);
        self
    }

    #[must_use]
    pub fn with_default_coalesce_window(mut self, window: Duration) -> Self {
        self.default_coalesce_window = window;
        self
    }

    #[must_use]
    pub fn with_sink_history(mut self, consult: bool) -> Self {
        self.consult_sink_history = consult;
        self
    }

    /// Effective diff options for an entity type.
    #[must_use]
    pub fn diff_options(&self, entity_type: &EntityType) -> DiffOptions {
        let policy = self.policies.get(entity_type);
        DiffOptions {
            ignored_keys: policy.map(|p| p.ignored_keys.clone()).unwrap_or_default(),
            normalization: policy
                .and_then(|p| p.normalization)
                .unwrap_or(self.normalization),
            list_mode: policy.and_then(|p| p.list_mode).unwrap_or(self.list_mode),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
