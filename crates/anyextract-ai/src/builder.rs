//! Builder model: document analysis, schema proposal, artifact generation
//! and repair, failure diagnosis.

use std::sync::Arc;

use anyextract_core::task::truncate_chars;
use anyextract_core::{
    CornerCase, Diagnosis, Document, FieldJudgment, JudgmentResult, Language, SchemaDefinition,
    SchemaField, SharedPattern,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::json::{is_parse_error, strip_code_fences};
use crate::prompts;
use crate::provider::{ChatMessage, ChatProvider, ChatRequest, InferenceError, Usage, chat_json};

/// Failures shown to the diagnosis prompt.
pub const DIAGNOSIS_FAILURES: usize = 10;
/// Artifact source shown to the diagnosis prompt.
pub const DIAGNOSIS_SOURCE_CHARS: usize = 5000;
/// Failures shown to the repair prompt.
pub const REPAIR_FAILURES: usize = 5;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("generated artifact still invalid after retry: {0}")]
    InvalidArtifact(String),
    #[error("malformed builder output: {0}")]
    Malformed(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Checks a generated artifact before it is committed.
pub trait ArtifactValidator: Send + Sync {
    /// `Err` carries a message suitable for feeding back to the model.
    fn validate(&self, source: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentAnalysis {
    pub document_type: String,
    pub language: String,
    pub structure_description: String,
    pub key_sections: Vec<String>,
    pub suggested_fields: Vec<SchemaField>,
    pub complexity: String,
    pub notes: Vec<Value>,
}

/// A generated artifact source and what it cost.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub source: String,
    pub usage: Usage,
    /// Whether the first attempt failed validation.
    pub retried: bool,
}

/// One failed extraction as shown to the builder.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub extraction_id: i64,
    pub document: String,
    pub fields: Value,
    pub field_confidence: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub result: JudgmentResult,
    pub score: f64,
    pub field_judgments: Vec<FieldJudgment>,
    pub reasoning: String,
}

#[derive(Serialize)]
struct JudgmentView<'a> {
    extraction_id: i64,
    result: JudgmentResult,
    score: f64,
    field_judgments: &'a [FieldJudgment],
    reasoning: &'a str,
}

pub struct Builder {
    provider: Arc<dyn ChatProvider>,
    model: String,
    language: Language,
}

impl Builder {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>, language: Language) -> Self {
        Self {
            provider,
            model: model.into(),
            language,
        }
    }

    async fn ask_json(&self, system: &str, prompt: String) -> Result<(Value, Usage), BuildError> {
        let request = ChatRequest::new(
            &self.model,
            vec![ChatMessage::system(system), ChatMessage::user(prompt)],
        )
        .temperature(0.1);
        let (parsed, response) = chat_json(self.provider.as_ref(), request).await?;
        let mut usage = Usage::default();
        usage.add(&response);
        if is_parse_error(&parsed) {
            return Err(BuildError::Malformed(truncate_chars(&response.content, 200)));
        }
        Ok((parsed, usage))
    }

    // ── Bootstrap ──

    /// Characterize the task's sample documents (first five, first three pages each).
    pub async fn analyze(&self, samples: &[Document]) -> Result<(DocumentAnalysis, Usage), BuildError> {
        let used = &samples[..samples.len().min(5)];
        let contents = used
            .iter()
            .map(|doc| {
                let text = doc
                    .pages
                    .iter()
                    .take(3)
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "--- Document: {} ---\nFilename metadata: {}\n{}",
                    doc.filename,
                    serde_json::to_string(&doc.metadata).unwrap_or_default(),
                    truncate_chars(&text, 2000)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = prompts::analyze_documents(self.language, used.len(), &contents);
        let (parsed, usage) = self.ask_json(prompts::ANALYST_SYSTEM, prompt).await?;
        let analysis: DocumentAnalysis = serde_json::from_value(parsed)?;
        info!(
            document_type = %analysis.document_type,
            complexity = %analysis.complexity,
            suggested = analysis.suggested_fields.len(),
            "analyzed samples"
        );
        Ok((analysis, usage))
    }

    pub async fn propose_schema(
        &self,
        task_description: &str,
        analysis: &DocumentAnalysis,
        patterns: &[SharedPattern],
    ) -> Result<(SchemaDefinition, Usage), BuildError> {
        let patterns: Vec<Value> = patterns
            .iter()
            .take(5)
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "category": p.category,
                    "description": p.description,
                    "type": p.implementation_type,
                    "confidence": p.confidence,
                })
            })
            .collect();
        let prompt = prompts::propose_schema(
            self.language,
            task_description,
            &serde_json::to_string_pretty(analysis)?,
            &serde_json::to_string_pretty(&patterns)?,
        );
        let (parsed, usage) = self.ask_json(prompts::SCHEMA_SYSTEM, prompt).await?;
        let schema: SchemaDefinition = serde_json::from_value(parsed)?;
        schema
            .validate()
            .map_err(|e| BuildError::Malformed(format!("proposed schema: {e}")))?;
        info!(fields = schema.fields.len(), "proposed schema");
        Ok((schema, usage))
    }

    pub async fn generate_workflow(
        &self,
        schema: &SchemaDefinition,
        samples: &[Document],
        analysis: &DocumentAnalysis,
        validator: &dyn ArtifactValidator,
    ) -> Result<GeneratedArtifact, BuildError> {
        let sample_content = samples
            .iter()
            .take(3)
            .map(|doc| {
                let text = doc
                    .pages
                    .iter()
                    .take(2)
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("--- {} ---\n{}\n", doc.filename, truncate_chars(&text, 1500))
            })
            .collect::<Vec<_>>()
            .join("\n");
        let summary = serde_json::json!({
            "document_type": analysis.document_type,
            "language": analysis.language,
            "structure_description": analysis.structure_description,
            "key_sections": analysis.key_sections,
            "complexity": analysis.complexity,
        });
        let prompt = prompts::generate_workflow(
            self.language,
            &serde_json::to_string_pretty(schema)?,
            &truncate_chars(&sample_content, 6000),
            &serde_json::to_string_pretty(&summary)?,
        );
        self.generate_validated(prompts::BUILDER_SYSTEM, prompt, validator).await
    }

    // ── Evolution ──

    pub async fn diagnose(
        &self,
        failures: &[FailureReport],
        schema: &SchemaDefinition,
        workflow_source: &str,
    ) -> Result<(Diagnosis, Usage), BuildError> {
        let shown = &failures[..failures.len().min(DIAGNOSIS_FAILURES)];
        let extractions: Vec<Value> = shown
            .iter()
            .map(|f| {
                serde_json::json!({
                    "extraction_id": f.extraction_id,
                    "document": f.document,
                    "result": f.fields,
                    "field_confidences": f.field_confidence,
                    "error": f.error,
                })
            })
            .collect();
        let judgments: Vec<JudgmentView<'_>> = shown
            .iter()
            .map(|f| JudgmentView {
                extraction_id: f.extraction_id,
                result: f.result,
                score: f.score,
                field_judgments: &f.field_judgments,
                reasoning: &f.reasoning,
            })
            .collect();
        let prompt = prompts::diagnose(
            self.language,
            &serde_json::to_string_pretty(&extractions)?,
            &serde_json::to_string_pretty(&judgments)?,
            &serde_json::to_string_pretty(schema)?,
            &truncate_chars(workflow_source, DIAGNOSIS_SOURCE_CHARS),
        );
        let (parsed, usage) = self.ask_json(prompts::DIAGNOSE_SYSTEM, prompt).await?;
        let diagnosis: Diagnosis = serde_json::from_value(parsed)?;
        info!(
            issue = %diagnosis.issue_type,
            fields = ?diagnosis.affected_fields,
            affected = diagnosis.affected_percentage,
            "diagnosed failures"
        );
        Ok((diagnosis, usage))
    }

    pub async fn modify_workflow(
        &self,
        current_source: &str,
        diagnosis: &Diagnosis,
        schema: &SchemaDefinition,
        failures: &[FailureReport],
        corner_cases: &[CornerCase],
        validator: &dyn ArtifactValidator,
    ) -> Result<GeneratedArtifact, BuildError> {
        let cases: Vec<Value> = corner_cases
            .iter()
            .map(|c| {
                serde_json::json!({
                    "field_name": c.field_name,
                    "description": c.description,
                    "pattern": c.pattern,
                    "resolution": c.resolution,
                    "resolution_type": c.resolution_type,
                })
            })
            .collect();
        let prompt = prompts::modify_workflow(
            self.language,
            current_source,
            &serde_json::to_string_pretty(diagnosis)?,
            &serde_json::to_string_pretty(schema)?,
            &serde_json::to_string_pretty(&failures[..failures.len().min(REPAIR_FAILURES)])?,
            &serde_json::to_string_pretty(&cases)?,
        );
        self.generate_validated(prompts::BUILDER_SYSTEM, prompt, validator).await
    }

    /// Generate, validate, and on failure retry once with the error fed back.
    async fn generate_validated(
        &self,
        system: &str,
        prompt: String,
        validator: &dyn ArtifactValidator,
    ) -> Result<GeneratedArtifact, BuildError> {
        let mut usage = Usage::default();
        let first = ChatRequest::new(
            &self.model,
            vec![ChatMessage::system(system), ChatMessage::user(prompt.clone())],
        )
        .temperature(0.2)
        .max_tokens(8192);
        let response = self.provider.chat(&first).await?;
        usage.add(&response);
        let source = strip_code_fences(&response.content).to_string();

        let Err(error) = validator.validate(&source) else {
            return Ok(GeneratedArtifact {
                source,
                usage,
                retried: false,
            });
        };
        warn!(error = %error, "generated artifact invalid, retrying");

        let retry = ChatRequest::new(
            &self.model,
            vec![
                ChatMessage::system(prompts::REPAIR_SYSTEM),
                ChatMessage::user(prompt),
                ChatMessage::assistant(source),
                ChatMessage::user(prompts::repair(&error)),
            ],
        )
        .temperature(0.1)
        .max_tokens(8192);
        let response = self.provider.chat(&retry).await?;
        usage.add(&response);
        let source = strip_code_fences(&response.content).to_string();
        validator
            .validate(&source)
            .map_err(BuildError::InvalidArtifact)?;
        Ok(GeneratedArtifact {
            source,
            usage,
            retried: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use anyextract_core::IssueType;

    /// Accepts sources that parse as JSON objects with `"entry": "extract"`.
    struct EntryValidator;

    impl ArtifactValidator for EntryValidator {
        fn validate(&self, source: &str) -> Result<(), String> {
            let v: Value = serde_json::from_str(source).map_err(|e| e.to_string())?;
            match v.get("entry").and_then(Value::as_str) {
                Some("extract") => Ok(()),
                _ => Err("missing entry point \"extract\"".into()),
            }
        }
    }

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new(vec![SchemaField::new("title", "string")])
    }

    fn builder(provider: Arc<ScriptedProvider>) -> Builder {
        Builder::new(provider, "builder", Language::En)
    }

    #[tokio::test]
    async fn valid_first_attempt_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::constant(
            "```json\n{\"entry\": \"extract\", \"fields\": {}}\n```",
        ));
        let out = builder(provider.clone())
            .generate_workflow(&schema(), &[], &DocumentAnalysis::default(), &EntryValidator)
            .await
            .unwrap();
        assert!(!out.retried);
        assert_eq!(out.usage.calls, 1);
        assert!(out.source.starts_with('{'));
    }

    #[tokio::test]
    async fn invalid_first_attempt_retries_with_error() {
        let provider = Arc::new(ScriptedProvider::new(|req| {
            if req.messages.len() > 2 {
                Ok("{\"entry\": \"extract\", \"fields\": {}}".into())
            } else {
                Ok("{\"fields\": {}}".into())
            }
        }));
        let out = builder(provider.clone())
            .generate_workflow(&schema(), &[], &DocumentAnalysis::default(), &EntryValidator)
            .await
            .unwrap();
        assert!(out.retried);
        assert_eq!(out.usage.calls, 2);
        let retry = &provider.requests()[1];
        assert!(retry.last_user_text().contains("missing entry point"));
    }

    #[tokio::test]
    async fn second_invalid_attempt_is_fatal() {
        let provider = Arc::new(ScriptedProvider::constant("not a plan"));
        let err = builder(provider.clone())
            .generate_workflow(&schema(), &[], &DocumentAnalysis::default(), &EntryValidator)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidArtifact(_)));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn diagnosis_sees_at_most_ten_failures() {
        let provider = Arc::new(ScriptedProvider::constant(
            r#"{"issue_type": "corner_case", "affected_fields": ["date"], "affected_percentage": 0.05,
                "description": "Quarter dates", "suggested_fix": "map quarters", "evidence": [{"doc": "a"}]}"#,
        ));
        let failures: Vec<FailureReport> = (0..15)
            .map(|i| FailureReport {
                extraction_id: i,
                document: format!("doc{i}.txt"),
                fields: serde_json::json!({"date": null}),
                field_confidence: serde_json::json!({"date": 0.1}),
                error: None,
                result: JudgmentResult::Incorrect,
                score: 0.2,
                field_judgments: vec![],
                reasoning: String::new(),
            })
            .collect();
        let source = "x".repeat(9000);
        let (d, usage) = builder(provider.clone())
            .diagnose(&failures, &schema(), &source)
            .await
            .unwrap();
        assert_eq!(d.issue_type, IssueType::CornerCase);
        assert_eq!(usage.calls, 1);
        let prompt = provider.requests()[0].last_user_text();
        assert!(prompt.contains("doc9.txt"));
        assert!(!prompt.contains("doc10.txt"));
        assert!(!prompt.contains(&"x".repeat(5001)));
    }

    #[tokio::test]
    async fn proposed_schema_is_validated() {
        let provider = Arc::new(ScriptedProvider::constant(r#"{"fields": [], "description": "none"}"#));
        let err = builder(provider)
            .propose_schema("extract titles", &DocumentAnalysis::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Malformed(_)));
    }
}
