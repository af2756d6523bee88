//! Task creation: ingest documents, have the builder analyze samples,
//! propose a schema and write the first extraction plan.

use std::path::Path;

use anyextract_ai::{DocumentAnalysis, Usage};
use anyextract_core::{
    ArtifactKind, Document, EventType, Language, NewEvent, NewWorkflow, SchemaDefinition, Task,
    TaskStatus, VersionPayload,
};
use serde_json::json;
use tracing::{info, warn};

use crate::code_store::sanitize_task_name;
use crate::error::PipelineError;
use crate::plan::PlanValidator;
use crate::source::read_documents;
use crate::{Pipeline, require_status};

/// Minimum confidence for shared patterns offered to the schema proposal.
pub const PROPOSAL_PATTERN_CONFIDENCE: f64 = 0.6;

#[derive(Debug)]
pub struct BootstrapReport {
    pub task: Task,
    pub documents: usize,
    pub samples: usize,
    pub analysis: DocumentAnalysis,
    pub schema: SchemaDefinition,
    pub workflow_version: i64,
    pub commit_ref: String,
    pub usage: Usage,
}

impl Pipeline {
    /// Read documents under `input` and store the ones the task has not seen.
    pub fn ingest(&self, task: &Task, input: &Path) -> Result<Vec<Document>, PipelineError> {
        let docs = read_documents(input)?;
        let stored = self
            .store
            .add_documents(task.id, &docs, self.settings.bootstrap.max_samples)?;
        info!(
            task = %task.name,
            read = docs.len(),
            new = stored.len(),
            input = %input.display(),
            "ingested documents"
        );
        Ok(stored)
    }

    /// Create a task from documents and a description, ending in `Running`
    /// with schema v1 and workflow v1.
    ///
    /// The task is stored under its sanitized name, which also names its
    /// artifact directory. A failure after the task row exists marks the
    /// task `Failed`.
    pub async fn bootstrap(
        &self,
        name: &str,
        description: &str,
        input: &Path,
        language: Option<Language>,
    ) -> Result<BootstrapReport, PipelineError> {
        let sanitized = sanitize_task_name(name);
        if sanitized.is_empty() {
            return Err(PipelineError::InvalidTaskName(name.to_string()));
        }
        let task = self.store.create_task(
            &sanitized,
            description,
            language.unwrap_or(self.settings.language),
            self.settings.evolution.max_iterations,
            &json!({ "source": input.display().to_string() }),
        )?;
        match self.bootstrap_inner(&task, input).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(task = %task.name, error = %e, "bootstrap failed");
                if let Err(mark) = self.store.set_task_status(task.id, TaskStatus::Failed) {
                    warn!(task = %task.name, error = %mark, "could not mark task failed");
                }
                Err(e)
            }
        }
    }

    async fn bootstrap_inner(&self, task: &Task, input: &Path) -> Result<BootstrapReport, PipelineError> {
        require_status(task, TaskStatus::Bootstrapping, "bootstrap requires a new task")?;
        let documents = self.ingest(task, input)?;
        if documents.is_empty() {
            return Err(PipelineError::NoDocuments(input.display().to_string()));
        }
        let samples = self.store.sample_documents(task.id)?;

        let builder = self.builder(task);
        let mut usage = Usage::default();
        let (analysis, u) = builder.analyze(&samples).await?;
        usage.merge(u);

        let patterns = self
            .store
            .find_matching_patterns(Some(&analysis.document_type), PROPOSAL_PATTERN_CONFIDENCE)?;
        let (schema, u) = builder
            .propose_schema(&task.description, &analysis, &patterns)
            .await?;
        usage.merge(u);
        let schema_version = self.store.create_schema_version(task.id, &schema)?;

        let generated = builder
            .generate_workflow(&schema, &samples, &analysis, &PlanValidator)
            .await?;
        usage.merge(generated.usage);

        let version = self.store.next_workflow_version(task.id)?;
        let (artifact_path, commit_ref) = self.code.write(
            &sanitize_task_name(&task.name),
            version,
            ArtifactKind::Plan,
            generated.source.as_bytes(),
        )?;
        let workflow = NewWorkflow {
            artifact_path,
            commit_ref: commit_ref.clone(),
            artifact_kind: ArtifactKind::Plan,
            model_assignments: Default::default(),
            metadata: json!({ "retried": generated.retried }),
        };
        let event = NewEvent::new(EventType::Bootstrap, 0)
            .trigger(json!({ "documents": documents.len(), "samples": samples.len() }))
            .mutation(json!({
                "document_type": analysis.document_type,
                "schema_version": schema_version.version,
                "fields": schema.field_names(),
                "workflow_version": version,
                "commit_ref": commit_ref,
            }))
            .outcome(json!({ "llm_calls": usage.calls, "tokens_used": usage.tokens }));
        self.store
            .create_version_with_event(task.id, &VersionPayload::Workflow(workflow), &event)?;
        let task = self.store.set_task_status(task.id, TaskStatus::Running)?;

        info!(
            task = %task.name,
            documents = documents.len(),
            fields = schema.fields.len(),
            version,
            "bootstrap complete"
        );
        Ok(BootstrapReport {
            task,
            documents: documents.len(),
            samples: samples.len(),
            analysis,
            schema,
            workflow_version: version,
            commit_ref,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedJudge, pipeline};
    use anyextract_ai::{ScriptedProvider, prompts};
    use anyextract_core::JudgmentResult;
    use anyextract_store::StoreError;
    use std::sync::Arc;

    const PLAN: &str = r#"{"entry": "extract", "fields": {"title": {"rule": "filename", "key": "title"}, "rating": {"rule": "llm"}}}"#;

    fn builder() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(|req| {
            let system = req.messages.first().map(|m| m.text()).unwrap_or_default();
            Ok(if system == prompts::ANALYST_SYSTEM {
                json!({
                    "document_type": "broker_report",
                    "language": "en",
                    "structure_description": "one page summary",
                    "key_sections": ["rating"],
                    "suggested_fields": [],
                    "complexity": "low",
                    "notes": [],
                })
                .to_string()
            } else if system == prompts::SCHEMA_SYSTEM {
                json!({"fields": [
                    {"name": "title", "type": "string", "required": true},
                    {"name": "rating", "type": "string"},
                ]})
                .to_string()
            } else {
                format!("```json\n{PLAN}\n```")
            })
        }))
    }

    fn write_inputs(dir: &Path) {
        std::fs::write(dir.join("Acme：Q3 Outlook_J Doe.txt"), "Rating: Buy").unwrap();
        std::fs::write(dir.join("Acme：Q4 Outlook_J Doe.txt"), "Rating: Hold").unwrap();
        std::fs::write(dir.join("notes.csv"), "ignored").unwrap();
    }

    #[tokio::test]
    async fn bootstrap_creates_first_versions() {
        let input = tempfile::tempdir().unwrap();
        write_inputs(input.path());
        let work = tempfile::tempdir().unwrap();
        let provider = builder();
        let p = pipeline(
            work.path(),
            provider.clone(),
            Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 1.0)),
        );

        let report = p
            .bootstrap("reports", "broker reports", input.path(), None)
            .await
            .unwrap();
        assert_eq!(report.task.status, TaskStatus::Running);
        assert_eq!(report.documents, 2);
        assert_eq!(report.samples, 2);
        assert_eq!(report.analysis.document_type, "broker_report");
        assert_eq!(report.schema.field_names(), vec!["title", "rating"]);
        assert_eq!(report.workflow_version, 1);
        assert_eq!(provider.calls(), 3);

        let store = p.store();
        assert_eq!(store.active_schema(report.task.id).unwrap().version, 1);
        let workflow = store.active_workflow(report.task.id).unwrap();
        assert_eq!(workflow.artifact_path, "reports/extract_v1.json");
        // Code fences are stripped before the plan is stored.
        assert_eq!(p.code().read_path(&workflow.artifact_path).unwrap(), PLAN.as_bytes());
        let events = store.events(report.task.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Bootstrap);
        assert_eq!(events[0].mutation["document_type"], "broker_report");
    }

    #[tokio::test]
    async fn empty_input_fails_the_task() {
        let input = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let p = pipeline(
            work.path(),
            builder(),
            Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 1.0)),
        );
        let err = p
            .bootstrap("empty", "nothing", input.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoDocuments(_)));
        assert_eq!(p.store().task_by_name("empty").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn task_names_are_stored_sanitized() {
        let input = tempfile::tempdir().unwrap();
        write_inputs(input.path());
        let work = tempfile::tempdir().unwrap();
        let p = pipeline(
            work.path(),
            builder(),
            Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 1.0)),
        );

        let report = p.bootstrap("Reports", "", input.path(), None).await.unwrap();
        assert_eq!(report.task.name, "reports");
        let first = p.store().active_workflow(report.task.id).unwrap();

        // Differs only in case and punctuation, so it names the same directory.
        let err = p.bootstrap("reports!", "", input.path(), None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Conflict(_))));
        assert_eq!(p.store().tasks().unwrap().len(), 1);
        assert_eq!(p.code().read_path(&first.artifact_path).unwrap(), PLAN.as_bytes());

        let err = p.bootstrap("?!:", "", input.path(), None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTaskName(_)));
    }

    #[tokio::test]
    async fn reingesting_skips_known_documents() {
        let input = tempfile::tempdir().unwrap();
        write_inputs(input.path());
        let work = tempfile::tempdir().unwrap();
        let p = pipeline(
            work.path(),
            builder(),
            Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 1.0)),
        );
        let report = p.bootstrap("reports", "", input.path(), None).await.unwrap();
        assert!(p.ingest(&report.task, input.path()).unwrap().is_empty());

        std::fs::write(input.path().join("new.txt"), "Rating: Sell").unwrap();
        let added = p.ingest(&report.task, input.path()).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].filename, "new.txt");
    }
}
