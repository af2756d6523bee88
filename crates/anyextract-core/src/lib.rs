//! Core types and control-loop logic for anyextract.
//!
//! Everything here is pure: no I/O, no model calls. The store, AI and host
//! crates build on these types.

use thiserror::Error;

/// Returned when a persisted or user-supplied label does not name a known variant.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed enum whose variants persist as fixed lowercase labels.
macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err($crate::ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub mod confidence;
pub mod config;
pub mod evolution;
pub mod extraction;
pub mod judgment;
pub mod metrics;
pub mod pattern;
pub mod sampling;
pub mod schema;
pub mod task;
pub mod trigger;
pub mod version;

pub use confidence::{ConfidenceEngine, ConfidenceReport, ConfidenceWeights, FieldEvidence, MethodPriors};
pub use config::{ConfigError, Settings};
pub use evolution::{
    CornerCase, Diagnosis, EventType, EvolutionEvent, IssueType, NewCornerCase, NewEvent,
    ResolutionType,
};
pub use extraction::{Extraction, ExtractionMetadata, ExtractionStatus, FieldTrace, NewExtraction};
pub use judgment::{
    FeedbackRecord, FeedbackType, FieldJudgment, Judgment, JudgmentResult, NewFeedback, Verdict,
};
pub use metrics::{FieldStats, QualityMetrics, TierAccuracy, assign_model_tiers};
pub use pattern::{ImplementationType, SharedPattern};
pub use sampling::{Sampleable, SamplingController, Selection, sampling_rate};
pub use schema::{FieldChange, SchemaDefinition, SchemaDiff, SchemaError, SchemaField};
pub use task::{Document, Language, NewDocument, Page, Task, TaskStatus};
pub use trigger::{EvolutionTrigger, TriggerDecision, TriggerReason};
pub use version::{ArtifactKind, NewWorkflow, SchemaVersion, Version, VersionKind, VersionPayload, WorkflowVersion};
