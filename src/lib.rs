//! # deltawatch - Change Detection & Event Correlation
//!
//! deltawatch turns raw entity mutations into semantic audit alerts. A
//! producer captures an entity's "before" state, reports its "after" state,
//! and the engine decides which alerts (if any) to emit.
//!
//! ## Core Concepts
//!
//! - **Snapshot**: immutable copy of an entity's attributes at one instant
//! - **Diff**: field-level change records between two snapshots
//! - **Rule**: prioritized predicate over a change set that builds an event occurrence
//! - **Correlation registry**: per-scope record of fired and reserved event codes
//! - **Operation scope**: one logical user action; owns the snapshot store and registry
//! - **Event sink**: where committed occurrences are delivered
//!
//! ## Usage
//!
//! ```rust
//! use deltawatch::{diff, ChangeKind, DiffOptions, Snapshot};
//! use serde_json::json;
//!
//! let before = Snapshot::from_json("coupon", "3", json!({"amount": "10", "type": "percent"}));
//! let after = Snapshot::from_json("coupon", "3", json!({"amount": "15", "type": "percent"}));
//!
//! let outcome = diff(Some(&before), &after, &DiffOptions::default());
//! let changes = outcome.changes();
//! assert_eq!(changes.len(), 1);
//! assert_eq!(changes[0].attribute_key, "amount");
//! assert_eq!(changes[0].kind, ChangeKind::Modified);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod clock;
pub mod entity;
pub mod error;
pub mod event;
pub mod value;

// Detection
pub mod diff;
pub mod snapshot;

// Classification and correlation
pub mod config;
pub mod registry;
pub mod rules;
pub mod scope;
pub mod sink;

// Re-export primary types at crate root for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EntityPolicy};
pub use diff::{
    diff, ChangeKind, ChangeRecord, ChangeSet, DiffOptions, DiffOutcome, ListMode, Normalization,
};
pub use entity::{Attributes, EntityKey, EntityType, Snapshot};
pub use error::{DeltaError, DeltaResult, SinkError, ValidationError};
pub use event::{EventCode, EventOccurrence};
pub use registry::{CommitOutcome, CorrelationRegistry, FiredEntry, SuppressionReason};
pub use rules::{
    Candidate, ClassificationContext, Condition, EntityRules, Observation, Rule, RuleBuilder,
    RuleCatalog, RuleCatalogBuilder, RuleKind, VariableSource,
};
pub use scope::{ChangeEngine, ObservationOutcome, ObservationReport, OperationScope, ScopeSummary};
pub use sink::{ChannelSink, EventSink, InMemorySink};
pub use snapshot::SnapshotStore;
pub use value::Value;
