//! The closed loop: run, judge, decide, diagnose, mutate, re-verify.

use std::collections::BTreeSet;
use std::path::Path;

use anyextract_ai::{FailureReport, Usage};
use anyextract_core::{
    ArtifactKind, Diagnosis, EventType, Extraction, IssueType, Judgment, NewCornerCase, NewEvent,
    NewWorkflow, Task, TriggerDecision, WorkflowVersion,
};
use serde_json::json;
use tracing::{info, warn};

use crate::code_store::sanitize_task_name;
use crate::error::PipelineError;
use crate::executor::BatchReport;
use crate::observer::ObserveReport;
use crate::plan::PlanValidator;
use crate::{Pipeline, require_status};

/// Sampling tag on judgments made right after a mutation.
pub const REVERIFY_METHOD: &str = "reverify";

#[derive(Debug)]
pub struct EvolutionReport {
    pub diagnosis: Diagnosis,
    pub failures: usize,
    pub corner_cases_added: usize,
    pub from_version: i64,
    pub to_version: i64,
    pub commit_ref: String,
    /// Iteration the task is at after the commit.
    pub iteration: i64,
    /// Builder calls for diagnosis and mutation.
    pub usage: Usage,
    pub reexecuted: BatchReport,
    pub reverified: ObserveReport,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing was judged incorrect or partial; the task is unchanged.
    NoFailures,
    Evolved(Box<EvolutionReport>),
}

#[derive(Debug)]
pub struct RunReport {
    pub task: Task,
    pub ingested: usize,
    pub batch: BatchReport,
    pub observation: Option<ObserveReport>,
    pub decision: Option<TriggerDecision>,
    pub cycle: Option<CycleOutcome>,
}

/// Builder-facing view of one failed extraction.
fn failure_report(extraction: &Extraction, judgment: &Judgment, document: String) -> FailureReport {
    FailureReport {
        extraction_id: extraction.id,
        document,
        fields: extraction.fields_json(),
        field_confidence: json!(extraction.field_confidence),
        error: extraction.error.clone(),
        result: judgment.result,
        score: judgment.score,
        field_judgments: judgment.field_judgments.clone(),
        reasoning: judgment.reasoning.clone(),
    }
}

impl Pipeline {
    /// One diagnosis and mutation cycle for a running task.
    ///
    /// The task is moved to `Evolving` first; any failure before the commit
    /// returns it to `Running` untouched.
    pub async fn evolve(&self, task_id: i64) -> Result<CycleOutcome, PipelineError> {
        let task = self.store.begin_evolution(task_id)?;
        match self.evolve_inner(&task).await {
            Ok(CycleOutcome::NoFailures) => {
                self.store.abort_evolution(task.id, "no failed extractions")?;
                info!(task = %task.name, iteration = task.iteration, "nothing to evolve");
                Ok(CycleOutcome::NoFailures)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(abort) = self.store.abort_evolution(task.id, &e.to_string()) {
                    warn!(task = %task.name, error = %abort, "could not abort evolution");
                }
                Err(e)
            }
        }
    }

    async fn evolve_inner(&self, task: &Task) -> Result<CycleOutcome, PipelineError> {
        let failures = self.store.failed_extractions(task.id, task.iteration)?;
        if failures.is_empty() {
            return Ok(CycleOutcome::NoFailures);
        }
        let schema = self.store.active_schema(task.id)?;
        let workflow = self.store.active_workflow(task.id)?;
        let source = self.workflow_source(&workflow)?;

        let mut reports = Vec::with_capacity(failures.len());
        for (extraction, judgment) in &failures {
            let document = self.store.document(extraction.document_id)?;
            reports.push(failure_report(extraction, judgment, document.filename));
        }
        info!(
            task = %task.name,
            iteration = task.iteration,
            failures = reports.len(),
            workflow_version = workflow.version,
            "diagnosing failures"
        );

        let builder = self.builder(task);
        let mut usage = Usage::default();
        let (diagnosis, diag_usage) = builder.diagnose(&reports, &schema.definition, &source).await?;
        usage.merge(diag_usage);

        let mut corner_cases_added = 0;
        if diagnosis.issue_type == IssueType::CornerCase {
            let cases = NewCornerCase::from_diagnosis(&diagnosis);
            let event = NewEvent::new(EventType::CornerCaseAdded, task.iteration)
                .trigger(json!({ "failures": reports.len() }))
                .mutation(json!({
                    "fields": diagnosis.affected_fields,
                    "description": diagnosis.description,
                    "resolution": diagnosis.suggested_fix,
                }));
            corner_cases_added = self.store.add_corner_cases(task.id, &cases, &event)?.len();
        }
        let corner_cases = self.store.corner_cases(task.id)?;

        let generated = builder
            .modify_workflow(
                &source,
                &diagnosis,
                &schema.definition,
                &reports,
                &corner_cases,
                &PlanValidator,
            )
            .await?;
        usage.merge(generated.usage);

        let version = self.store.next_workflow_version(task.id)?;
        let (artifact_path, commit_ref) = self.code.write(
            &sanitize_task_name(&task.name),
            version,
            ArtifactKind::Plan,
            generated.source.as_bytes(),
        )?;
        let new_workflow = NewWorkflow {
            artifact_path,
            commit_ref: commit_ref.clone(),
            artifact_kind: ArtifactKind::Plan,
            model_assignments: workflow.model_assignments.clone(),
            metadata: json!({
                "parent_version": workflow.version,
                "retried": generated.retried,
            }),
        };
        let event = NewEvent::new(EventType::WorkflowUpdate, task.iteration)
            .trigger(json!({
                "failures": reports.len(),
                "failed_extractions": reports.iter().map(|r| r.extraction_id).collect::<Vec<_>>(),
            }))
            .mutation(json!({
                "diagnosis": diagnosis,
                "from_version": workflow.version,
                "to_version": version,
                "commit_ref": commit_ref,
            }))
            .outcome(json!({
                "llm_calls": usage.calls,
                "tokens_used": usage.tokens,
                "validation_retried": generated.retried,
            }));
        let (committed, task) = self.store.commit_evolution(task.id, &new_workflow, &event)?;

        let ids: BTreeSet<i64> = failures.iter().map(|(e, _)| e.document_id).collect();
        let documents = ids
            .into_iter()
            .map(|id| self.store.document(id))
            .collect::<Result<Vec<_>, _>>()?;
        let reexecuted = self.execute(&task, &documents, Some(&committed)).await?;
        let items: Vec<&Extraction> = reexecuted.extractions.iter().collect();
        let reverified = self
            .judge_batch(&task, &schema.definition, &items, REVERIFY_METHOD, false)
            .await?;
        info!(
            task = %task.name,
            iteration = task.iteration,
            version = committed.version,
            reverified = reverified.judgments.len(),
            "evolution cycle complete"
        );

        Ok(CycleOutcome::Evolved(Box::new(EvolutionReport {
            diagnosis,
            failures: reports.len(),
            corner_cases_added,
            from_version: workflow.version,
            to_version: committed.version,
            commit_ref,
            iteration: task.iteration,
            usage,
            reexecuted,
            reverified,
        })))
    }

    /// Artifact source as shown to the builder. Components have no source to
    /// edit, so the builder is asked for a plan that replaces them.
    fn workflow_source(&self, workflow: &WorkflowVersion) -> Result<String, PipelineError> {
        match workflow.artifact_kind {
            ArtifactKind::Plan => {
                let bytes = self.code.read_path(&workflow.artifact_path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            ArtifactKind::Component => Ok(format!(
                "(workflow v{} is a compiled component at {}; its source is not available. \
                 Write a complete extraction plan that replaces it.)",
                workflow.version, workflow.artifact_path
            )),
        }
    }

    /// Ingest new documents from `input`, extract every document of the task,
    /// judge a sample and, when `evolve` is set, run a cycle if the trigger fires.
    pub async fn run(
        &self,
        task_name: &str,
        input: Option<&Path>,
        observe: bool,
        evolve: bool,
    ) -> Result<RunReport, PipelineError> {
        let task = self.running_task(task_name)?;
        let ingested = match input {
            Some(path) => self.ingest(&task, path)?.len(),
            None => 0,
        };
        let documents = self.store.documents(task.id)?;
        if documents.is_empty() {
            return Err(PipelineError::NoDocuments(task.name.clone()));
        }
        let batch = self.execute(&task, &documents, None).await?;

        let mut report = RunReport {
            task,
            ingested,
            batch,
            observation: None,
            decision: None,
            cycle: None,
        };
        if !observe {
            return Ok(report);
        }
        report.observation = Some(self.observe(&report.task, false).await?);
        if !evolve {
            return Ok(report);
        }

        let task = self.store.task(report.task.id)?;
        require_status(&task, anyextract_core::TaskStatus::Running, "evolution requires a running task")?;
        let judgments = self.store.judgments_at_iteration(task.id, task.iteration)?;
        let decision = self.settings.trigger().evaluate(&task, &judgments);
        if decision.fire {
            self.store.record_event(
                task.id,
                &NewEvent::new(EventType::EvolutionTriggered, task.iteration)
                    .trigger(serde_json::to_value(&decision).unwrap_or_default()),
            )?;
            report.cycle = Some(self.evolve(task.id).await?);
            report.task = self.store.task(task.id)?;
        }
        report.decision = Some(decision);
        Ok(report)
    }
}
