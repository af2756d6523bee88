//! The `ExtractionStrategy` seam: every workflow artifact, whatever its kind,
//! turns one document into field values through this trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyextract_ai::{ChatProvider, Usage};
use anyextract_core::{CornerCase, Document, FieldTrace, Language, SchemaDefinition, SharedPattern, Task};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ArtifactError;

/// Everything an artifact may use while extracting one document.
pub struct ExtractionContext<'a> {
    pub task: &'a Task,
    pub document: &'a Document,
    pub schema: &'a SchemaDefinition,
    pub corner_cases: &'a [CornerCase],
    pub patterns: &'a [SharedPattern],
    /// Field name to model, from the workflow version.
    pub model_assignments: &'a BTreeMap<String, String>,
    /// Worker models ordered largest first.
    pub worker_tiers: &'a [String],
    /// Used when a field has no assignment and there are no tiers.
    pub default_model: &'a str,
    pub language: Language,
    pub provider: Arc<dyn ChatProvider>,
}

/// Assigned model for `field`, else the first tier, else `default`.
pub(crate) fn pick_model<'m>(
    assignments: &'m BTreeMap<String, String>,
    tiers: &'m [String],
    default: &'m str,
    field: Option<&str>,
) -> &'m str {
    field
        .and_then(|f| assignments.get(f))
        .or_else(|| tiers.first())
        .map(String::as_str)
        .unwrap_or(default)
}

impl ExtractionContext<'_> {
    pub fn model_for_field(&self, field: &str) -> &str {
        pick_model(
            self.model_assignments,
            self.worker_tiers,
            self.default_model,
            Some(field),
        )
    }

    /// One model for a set of fields answered together: the largest tier
    /// any of them is assigned to.
    pub fn model_for_fields(&self, fields: &[&str]) -> &str {
        let rank = |model: &str| {
            self.worker_tiers
                .iter()
                .position(|t| t == model)
                .unwrap_or(usize::MAX)
        };
        fields
            .iter()
            .map(|f| self.model_for_field(f))
            .min_by_key(|m| rank(*m))
            .unwrap_or(self.default_model)
    }

    pub fn corner_cases_for<'c>(&'c self, field: &'c str) -> impl Iterator<Item = &'c CornerCase> {
        self.corner_cases.iter().filter(move |c| c.field_name == field)
    }

    pub fn pattern(&self, name: &str) -> Option<&SharedPattern> {
        self.patterns.iter().find(|p| p.name == name)
    }

    /// The context as handed to a component guest.
    pub fn to_json(&self) -> Value {
        json!({
            "task": {
                "name": self.task.name,
                "description": self.task.description,
                "iteration": self.task.iteration,
                "language": self.language,
                "config": self.task.config,
            },
            "document": {
                "filename": self.document.filename,
                "pages": self.document.pages,
                "metadata": self.document.metadata,
            },
            "schema": self.schema,
            "corner_cases": self.corner_cases.iter().map(|c| json!({
                "field_name": c.field_name,
                "description": c.description,
                "pattern": c.pattern,
                "resolution": c.resolution,
                "resolution_type": c.resolution_type,
            })).collect::<Vec<_>>(),
            "shared_patterns": self.patterns.iter().map(|p| json!({
                "name": p.name,
                "category": p.category,
                "description": p.description,
                "implementation": p.implementation,
                "implementation_type": p.implementation_type,
                "confidence": p.confidence,
            })).collect::<Vec<_>>(),
            "model_assignments": self.model_assignments,
        })
    }
}

/// What an artifact produced for one document.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub fields: BTreeMap<String, Value>,
    /// The artifact's own confidence per field, where it reported one.
    pub field_confidence: BTreeMap<String, f64>,
    pub traces: BTreeMap<String, FieldTrace>,
    pub usage: Usage,
    pub audit: Vec<String>,
    pub fuel_consumed: Option<u64>,
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<StrategyOutput, ArtifactError>;
}

/// Whether a produced value counts as found. Blank strings and empty lists do not.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyextract_core::{Page, SchemaField, TaskStatus};
    use chrono::Utc;

    pub fn task() -> Task {
        Task {
            id: 1,
            name: "reports".into(),
            description: "broker reports".into(),
            status: TaskStatus::Running,
            iteration: 0,
            max_iteration: 20,
            language: Language::En,
            config: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn document(filename: &str, pages: &[&str]) -> Document {
        Document {
            id: 1,
            task_id: 1,
            file_hash: "hash".into(),
            filename: filename.into(),
            source_path: format!("/in/{filename}"),
            pages: pages
                .iter()
                .enumerate()
                .map(|(i, t)| Page::new(i as u32 + 1, *t))
                .collect(),
            page_count: pages.len() as i64,
            parse_method: "text".into(),
            is_sample: true,
            metadata: crate::source::filename_metadata(filename),
            created_at: Utc::now(),
        }
    }

    pub fn schema(fields: &[&str]) -> SchemaDefinition {
        SchemaDefinition::new(fields.iter().map(|f| SchemaField::new(*f, "string")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use anyextract_ai::ScriptedProvider;

    #[test]
    fn model_selection_prefers_assignment_then_first_tier() {
        let task = task();
        let doc = document("a.txt", &["x"]);
        let schema = schema(&["title", "date"]);
        let assignments = BTreeMap::from([("date".to_string(), "small".to_string())]);
        let tiers = vec!["large".to_string(), "small".to_string()];
        let ctx = ExtractionContext {
            task: &task,
            document: &doc,
            schema: &schema,
            corner_cases: &[],
            patterns: &[],
            model_assignments: &assignments,
            worker_tiers: &tiers,
            default_model: "worker",
            language: Language::En,
            provider: Arc::new(ScriptedProvider::constant("{}")),
        };
        assert_eq!(ctx.model_for_field("date"), "small");
        assert_eq!(ctx.model_for_field("title"), "large");
        assert_eq!(ctx.model_for_fields(&["date"]), "small");
        assert_eq!(ctx.model_for_fields(&["date", "title"]), "large");

        let no_tiers = ExtractionContext { worker_tiers: &[], ..ctx };
        assert_eq!(no_tiers.model_for_field("title"), "worker");
    }

    #[test]
    fn presence_ignores_blank_values() {
        assert!(!is_present(&Value::Null));
        assert!(!is_present(&json!("  ")));
        assert!(!is_present(&json!([])));
        assert!(is_present(&json!(0)));
        assert!(is_present(&json!("x")));
    }
}
