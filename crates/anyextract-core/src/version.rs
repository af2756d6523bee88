//! Versioned schema and workflow artifacts.
//!
//! Versions are immutable once created. A task has at most one active schema
//! version and one active workflow version; creating a new version supersedes
//! the previous one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::SchemaDefinition;

labelled_enum! {
    pub enum VersionKind {
        Schema => "schema",
        Workflow => "workflow",
    }
}

labelled_enum! {
    /// How a workflow artifact is executed.
    pub enum ArtifactKind {
        Plan => "plan",
        Component => "component",
    }
}

impl ArtifactKind {
    /// File extension used in the code store.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "json",
            ArtifactKind::Component => "wasm",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(ArtifactKind::Plan),
            "wasm" | "wat" => Some(ArtifactKind::Component),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub id: i64,
    pub task_id: i64,
    pub version: i64,
    pub definition: SchemaDefinition,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: i64,
    pub task_id: i64,
    pub version: i64,
    pub artifact_path: String,
    pub commit_ref: String,
    pub artifact_kind: ArtifactKind,
    /// Field name to model tier.
    pub model_assignments: BTreeMap<String, String>,
    pub metadata: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Workflow artifact reference to register as the next version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub artifact_path: String,
    pub commit_ref: String,
    pub artifact_kind: ArtifactKind,
    pub model_assignments: BTreeMap<String, String>,
    pub metadata: serde_json::Value,
}

/// Content of a version to create; the registry assigns number and activation.
#[derive(Debug, Clone)]
pub enum VersionPayload {
    Schema(SchemaDefinition),
    Workflow(NewWorkflow),
}

impl VersionPayload {
    pub fn kind(&self) -> VersionKind {
        match self {
            VersionPayload::Schema(_) => VersionKind::Schema,
            VersionPayload::Workflow(_) => VersionKind::Workflow,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Version {
    Schema(SchemaVersion),
    Workflow(WorkflowVersion),
}

impl Version {
    pub fn number(&self) -> i64 {
        match self {
            Version::Schema(v) => v.version,
            Version::Workflow(v) => v.version,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Version::Schema(v) => v.is_active,
            Version::Workflow(v) => v.is_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_extensions() {
        assert_eq!(ArtifactKind::Plan.extension(), "json");
        assert_eq!(ArtifactKind::from_extension("wat"), Some(ArtifactKind::Component));
        assert_eq!(ArtifactKind::from_extension("py"), None);
    }
}
