//! Error types for deltawatch.
//!
//! Only setup-time operations (building a rule catalog, loading configuration)
//! return errors to callers. Runtime operations on an operation scope never
//! fail the host action; sink failures are typed here so adapters can report
//! them, but the engine logs and absorbs them.

use thiserror::Error;

use crate::event::EventCode;

/// Validation errors raised while building rules, catalogs, or configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Event code cannot be empty")]
    EmptyEventCode,

    #[error("Entity type cannot be empty")]
    EmptyEntityType,

    #[error("Duplicate priority {priority} for entity type '{entity_type}'")]
    DuplicatePriority {
        entity_type: String,
        priority: u32,
    },

    #[error("Entity type '{entity_type}' has more than one {kind} rule")]
    DuplicateLifecycleRule {
        entity_type: String,
        kind: String,
    },

    #[error("Entity type '{entity_type}' has modification rules but no fallback rule")]
    MissingFallback {
        entity_type: String,
    },

    #[error("Fallback rule for '{entity_type}' must have the lowest precedence (priority {priority} is not the largest)")]
    FallbackNotLast {
        entity_type: String,
        priority: u32,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors reported by an [`EventSink`](crate::sink::EventSink) when delivery fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Event sink unavailable: {reason}")]
    Unavailable {
        reason: String,
    },

    #[error("Event sink rejected code {code}: {reason}")]
    Rejected {
        code: EventCode,
        reason: String,
    },

    #[error("Event sink disconnected")]
    Disconnected,
}

/// Top-level error type for deltawatch.
///
/// Returned by the setup-time entry points ([`RuleCatalogBuilder::build`],
/// [`EngineConfig::from_json_str`]).
///
/// [`RuleCatalogBuilder::build`]: crate::rules::RuleCatalogBuilder::build
/// [`EngineConfig::from_json_str`]: crate::config::EngineConfig::from_json_str
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl DeltaError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// The underlying validation error, if any.
    #[must_use]
    pub const fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(e) => Some(e),
        }
    }
}

/// Result type alias for deltawatch operations.
pub type DeltaResult<T> = Result<T, DeltaError>;
