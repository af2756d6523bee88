//! Batch extraction: run the active workflow over documents, score every
//! field, and persist one extraction per document.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyextract_ai::Usage;
use anyextract_core::confidence::calibrate_weights;
use anyextract_core::pattern::INITIAL_PATTERN_CONFIDENCE;
use anyextract_core::{
    ConfidenceEngine, CornerCase, Document, Extraction, ExtractionMetadata, ExtractionStatus,
    FieldEvidence, NewExtraction, QualityMetrics, SchemaVersion, SharedPattern, Task, WorkflowVersion,
};
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Pipeline;
use crate::error::PipelineError;
use crate::loader::ArtifactLoader;
use crate::strategy::{ExtractionContext, ExtractionStrategy, StrategyOutput};

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Stored extractions, ordered by document.
    pub extractions: Vec<Extraction>,
    pub completed: usize,
    pub failed: usize,
    pub usage: Usage,
}

/// Whether an extracted value can be found verbatim in the document text.
/// Numbers and booleans are searched by their literal form.
pub(crate) fn occurs_in(value: &Value, text: &str) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && text.contains(s)
        }
        Value::Number(n) => text.contains(&n.to_string()),
        Value::Bool(b) => text.contains(if *b { "true" } else { "false" }),
        Value::Array(items) => items.iter().any(|v| occurs_in(v, text)),
        Value::Object(map) => map.values().any(|v| occurs_in(v, text)),
    }
}

/// Text a corner-case pattern is matched against: strings as they are,
/// other non-null values as JSON.
fn value_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        other => Some(Cow::Owned(other.to_string())),
    }
}

/// Corner cases that carry a usable regex, compiled once per batch.
fn corner_case_regexes(cases: &[CornerCase]) -> Vec<(String, Regex)> {
    cases
        .iter()
        .filter_map(|case| {
            let pattern = case.pattern.as_deref()?;
            match Regex::new(pattern) {
                Ok(re) => Some((case.field_name.clone(), re)),
                Err(e) => {
                    warn!(field = %case.field_name, error = %e, "corner case pattern does not compile");
                    None
                }
            }
        })
        .collect()
}

/// Everything shared by the documents of one batch.
struct Batch<'a> {
    pipeline: &'a Pipeline,
    task: &'a Task,
    schema: &'a SchemaVersion,
    workflow: &'a WorkflowVersion,
    corner_cases: &'a [CornerCase],
    case_regexes: Vec<(String, Regex)>,
    patterns: &'a [SharedPattern],
    history: &'a BTreeMap<String, f64>,
    engine: ConfidenceEngine,
}

impl Batch<'_> {
    fn record(&self, document: &Document) -> NewExtraction {
        NewExtraction {
            task_id: self.task.id,
            document_id: document.id,
            schema_version_id: self.schema.id,
            workflow_version_id: self.workflow.id,
            iteration: self.task.iteration,
            fields: BTreeMap::new(),
            field_confidence: BTreeMap::new(),
            confidence: 0.0,
            llm_calls: 0,
            tokens_used: 0,
            status: ExtractionStatus::Failed,
            error: None,
            metadata: ExtractionMetadata::default(),
        }
    }

    fn failed(&self, document: &Document, error: String) -> NewExtraction {
        warn!(
            task = %self.task.name,
            document = %document.filename,
            error = %error,
            "extraction failed"
        );
        NewExtraction {
            error: Some(error),
            ..self.record(document)
        }
    }

    async fn run(&self, strategy: &dyn ExtractionStrategy, document: &Document) -> NewExtraction {
        let settings = self.pipeline.settings();
        let ctx = ExtractionContext {
            task: self.task,
            document,
            schema: &self.schema.definition,
            corner_cases: self.corner_cases,
            patterns: self.patterns,
            model_assignments: &self.workflow.model_assignments,
            worker_tiers: &settings.models.worker_tiers,
            default_model: settings.default_worker_model(),
            language: self.task.language,
            provider: self.pipeline.provider.clone(),
        };
        match strategy.extract(&ctx).await {
            Ok(output) => self.completed(document, output),
            Err(e) => self.failed(document, e.to_string()),
        }
    }

    fn completed(&self, document: &Document, output: StrategyOutput) -> NewExtraction {
        let text = document.full_text();
        let engine = &self.engine;
        let report = engine.score_extraction(&output.fields, &self.schema.definition, |field, value| {
            let method = output
                .traces
                .get(field)
                .map(|t| t.method.as_str())
                .unwrap_or_default();
            FieldEvidence {
                llm_confidence: output
                    .field_confidence
                    .get(field)
                    .copied()
                    .unwrap_or(FieldEvidence::default().llm_confidence),
                method_prior: engine.priors.for_method(method),
                historical_accuracy: self.history.get(field).copied(),
                source_present: value.is_some_and(|v| occurs_in(v, &text)),
                corner_case_matched: value.and_then(value_text).is_some_and(|v| {
                    self.case_regexes
                        .iter()
                        .any(|(f, re)| f == field && re.is_match(&v))
                }),
            }
        });
        debug!(
            document = %document.filename,
            confidence = report.aggregate,
            llm_calls = output.usage.calls,
            "extracted document"
        );
        NewExtraction {
            fields: output.fields,
            field_confidence: report.per_field,
            confidence: report.aggregate,
            llm_calls: output.usage.calls,
            tokens_used: output.usage.tokens,
            status: ExtractionStatus::Completed,
            metadata: ExtractionMetadata {
                fields: output.traces,
                audit: output.audit,
                fuel_consumed: output.fuel_consumed,
            },
            ..self.record(document)
        }
    }
}

impl Pipeline {
    /// Extract `documents` with `workflow` (the active version when `None`)
    /// and store one extraction each at the task's current iteration.
    ///
    /// A document whose artifact fails becomes a `failed` extraction carrying
    /// the error; only store errors abort the batch.
    pub async fn execute(
        &self,
        task: &Task,
        documents: &[Document],
        workflow: Option<&WorkflowVersion>,
    ) -> Result<BatchReport, PipelineError> {
        let schema = self.store.active_schema(task.id)?;
        let workflow = match workflow {
            Some(w) => w.clone(),
            None => self.store.active_workflow(task.id)?,
        };
        let corner_cases = self.store.corner_cases(task.id)?;
        let patterns = self
            .store
            .find_matching_patterns(None, INITIAL_PATTERN_CONFIDENCE)?;
        let judgments = self.store.judgments(task.id)?;
        let history = QualityMetrics::from_judgments(&judgments).field_accuracy();
        let mut engine = self.settings.confidence_engine();
        engine.weights = calibrate_weights(&judgments, &engine.weights);

        let loader = ArtifactLoader::new(&self.code, &self.components);
        let strategy: Result<Arc<dyn ExtractionStrategy>, String> =
            loader.load(&workflow).await.map_err(|e| e.to_string());

        let batch = Batch {
            pipeline: self,
            task,
            schema: &schema,
            workflow: &workflow,
            corner_cases: &corner_cases,
            case_regexes: corner_case_regexes(&corner_cases),
            patterns: &patterns,
            history: &history,
            engine,
        };
        let batch = &batch;
        let strategy = &strategy;

        info!(
            task = %task.name,
            iteration = task.iteration,
            workflow_version = workflow.version,
            documents = documents.len(),
            "executing batch"
        );

        let mut records: Vec<NewExtraction> = futures::stream::iter(documents)
            .map(|document| async move {
                match strategy {
                    Ok(strategy) => batch.run(strategy.as_ref(), document).await,
                    Err(e) => batch.failed(document, format!("failed to load workflow: {e}")),
                }
            })
            .buffer_unordered(self.settings.execution.concurrency.max(1))
            .collect()
            .await;
        records.sort_by_key(|r| r.document_id);

        let mut report = BatchReport::default();
        for record in &records {
            report.usage.calls += record.llm_calls;
            report.usage.tokens += record.tokens_used;
            let stored = self.store.insert_extraction(record)?;
            if stored.is_failed() {
                report.failed += 1;
            } else {
                report.completed += 1;
            }
            report.extractions.push(stored);
        }
        info!(
            task = %task.name,
            completed = report.completed,
            failed = report.failed,
            llm_calls = report.usage.calls,
            tokens = report.usage.tokens,
            "batch complete"
        );
        Ok(report)
    }
}
