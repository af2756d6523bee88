//! Extraction records: one per document per run, never mutated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

labelled_enum! {
    pub enum ExtractionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
}

/// How a single field value was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTrace {
    /// `regex`, `filename`, `pattern`, `llm` or `component`.
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Name of the shared pattern that produced the value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_consumed: Option<u64>,
}

impl ExtractionMetadata {
    /// Fields whose value came from the named shared pattern.
    pub fn fields_using_pattern<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(_, t)| t.pattern.as_deref() == Some(pattern))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExtraction {
    pub task_id: i64,
    pub document_id: i64,
    pub schema_version_id: i64,
    pub workflow_version_id: i64,
    pub iteration: i64,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub field_confidence: BTreeMap<String, f64>,
    pub confidence: f64,
    pub llm_calls: i64,
    pub tokens_used: i64,
    pub status: ExtractionStatus,
    pub error: Option<String>,
    pub metadata: ExtractionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: i64,
    pub task_id: i64,
    pub document_id: i64,
    pub schema_version_id: i64,
    pub workflow_version_id: i64,
    pub iteration: i64,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub field_confidence: BTreeMap<String, f64>,
    pub confidence: f64,
    pub llm_calls: i64,
    pub tokens_used: i64,
    pub status: ExtractionStatus,
    pub error: Option<String>,
    pub metadata: ExtractionMetadata,
    pub created_at: DateTime<Utc>,
}

impl Extraction {
    pub fn is_failed(&self) -> bool {
        self.status == ExtractionStatus::Failed
    }

    /// Field values as a JSON object, for prompts and export.
    pub fn fields_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}
