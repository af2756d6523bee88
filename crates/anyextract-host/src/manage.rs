//! Explicit, operator-driven changes: schema and workflow versions, model
//! tier optimization, pattern promotion and closing tasks.

use std::path::Path;

use anyextract_core::metrics::DOWNGRADE_ACCURACY;
use anyextract_core::{
    ArtifactKind, EventType, ImplementationType, Judgment, JudgmentResult, NewEvent, NewWorkflow,
    SchemaDefinition, SchemaVersion, SharedPattern, Task, TaskStatus, TierAccuracy, Version,
    VersionPayload, WorkflowVersion, assign_model_tiers,
};
use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::code_store::sanitize_task_name;
use crate::error::{ArtifactError, PipelineError};
use crate::plan::Plan;
use crate::{Pipeline, require_status};

/// Whether the judge found `field` correct, using the overall verdict when
/// there is no per-field judgment.
fn judged_correct(judgment: &Judgment, field: &str) -> bool {
    judgment
        .field_judgments
        .iter()
        .find(|fj| fj.field_name == field)
        .map(|fj| fj.result)
        .unwrap_or(judgment.result)
        == JudgmentResult::Correct
}

fn workflow_version(version: Version) -> Result<WorkflowVersion, PipelineError> {
    match version {
        Version::Workflow(v) => Ok(v),
        Version::Schema(_) => Err(anyextract_store::StoreError::Other(
            "registry returned a schema version".into(),
        )
        .into()),
    }
}

impl Pipeline {
    /// Register `definition` as the task's new active schema.
    pub fn set_schema(
        &self,
        task: &Task,
        definition: &SchemaDefinition,
    ) -> Result<SchemaVersion, PipelineError> {
        definition.validate()?;
        let previous = self.store.active_schema(task.id).ok();
        let diff = previous
            .as_ref()
            .map(|p| p.definition.diff(definition))
            .unwrap_or_default();
        let event = NewEvent::new(EventType::SchemaUpdate, task.iteration)
            .trigger(json!({ "source": "manual" }))
            .mutation(json!({
                "from_version": previous.as_ref().map(|p| p.version),
                "added": diff.added,
                "removed": diff.removed,
                "modified": diff.modified.iter().map(|c| &c.name).collect::<Vec<_>>(),
            }));
        let version = self.store.create_version_with_event(
            task.id,
            &VersionPayload::Schema(definition.clone()),
            &event,
        )?;
        match version {
            Version::Schema(v) => {
                info!(task = %task.name, version = v.version, "schema updated");
                Ok(v)
            }
            Version::Workflow(_) => Err(anyextract_store::StoreError::Other(
                "registry returned a workflow version".into(),
            )
            .into()),
        }
    }

    /// Register an artifact file as the task's new active workflow. Plans
    /// must validate and components must compile before anything is stored.
    pub async fn import_workflow(&self, task: &Task, path: &Path) -> Result<WorkflowVersion, PipelineError> {
        let kind = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ArtifactKind::from_extension)
            .ok_or_else(|| PipelineError::UnsupportedArtifact(path.display().to_string()))?;
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path.display().to_string(), e))?;
        match kind {
            ArtifactKind::Plan => {
                let source = std::str::from_utf8(&bytes)
                    .map_err(|e| ArtifactError::InvalidPlan(format!("plan is not UTF-8: {e}")))?;
                Plan::parse(source)?;
            }
            ArtifactKind::Component => {
                self.components.runtime().await?.compile(&bytes)?;
            }
        }

        let previous = self.store.active_workflow(task.id).ok();
        let version = self.store.next_workflow_version(task.id)?;
        let (artifact_path, commit_ref) =
            self.code
                .write(&sanitize_task_name(&task.name), version, kind, &bytes)?;
        let workflow = NewWorkflow {
            artifact_path,
            commit_ref: commit_ref.clone(),
            artifact_kind: kind,
            model_assignments: previous
                .as_ref()
                .map(|p| p.model_assignments.clone())
                .unwrap_or_default(),
            metadata: json!({ "imported_from": path.display().to_string() }),
        };
        let event = NewEvent::new(EventType::WorkflowUpdate, task.iteration)
            .trigger(json!({ "source": "import", "path": path.display().to_string() }))
            .mutation(json!({
                "from_version": previous.as_ref().map(|p| p.version),
                "to_version": version,
                "kind": kind,
                "commit_ref": commit_ref,
            }));
        let imported = workflow_version(self.store.create_version_with_event(
            task.id,
            &VersionPayload::Workflow(workflow),
            &event,
        )?)?;
        info!(task = %task.name, version, %kind, "imported workflow");
        Ok(imported)
    }

    /// Judged accuracy of each field per model tier, from field traces.
    pub fn tier_accuracy(&self, task: &Task) -> Result<TierAccuracy, PipelineError> {
        let mut accuracy = TierAccuracy::default();
        for (extraction, judgment) in self.store.judged_extractions(task.id)? {
            for (field, trace) in &extraction.metadata.fields {
                if let Some(model) = &trace.model {
                    accuracy.record(field, model, judged_correct(&judgment, field));
                }
            }
        }
        Ok(accuracy)
    }

    /// Move each field to the smallest model tier that has proven accurate
    /// enough. Returns the new workflow version, or `None` when nothing changes.
    pub fn optimize(&self, task: &Task) -> Result<Option<WorkflowVersion>, PipelineError> {
        require_status(task, TaskStatus::Running, "optimization requires a running task")?;
        let accuracy = self.tier_accuracy(task)?;
        let current = self.store.active_workflow(task.id)?;
        let mut assignments = current.model_assignments.clone();
        assignments.extend(assign_model_tiers(
            &accuracy,
            &self.settings.models.worker_tiers,
            DOWNGRADE_ACCURACY,
        ));
        if assignments == current.model_assignments {
            info!(task = %task.name, "model assignments unchanged");
            return Ok(None);
        }

        let bytes = self.code.read_path(&current.artifact_path)?;
        let version = self.store.next_workflow_version(task.id)?;
        let (artifact_path, commit_ref) = self.code.write(
            &sanitize_task_name(&task.name),
            version,
            current.artifact_kind,
            &bytes,
        )?;
        let workflow = NewWorkflow {
            artifact_path,
            commit_ref,
            artifact_kind: current.artifact_kind,
            model_assignments: assignments.clone(),
            metadata: json!({ "parent_version": current.version }),
        };
        let event = NewEvent::new(EventType::ModelDowngrade, task.iteration)
            .trigger(json!({ "accuracy": accuracy.to_json(), "threshold": DOWNGRADE_ACCURACY }))
            .mutation(json!({
                "from_version": current.version,
                "to_version": version,
                "before": current.model_assignments,
                "after": assignments,
            }));
        let optimized = workflow_version(self.store.create_version_with_event(
            task.id,
            &VersionPayload::Workflow(workflow),
            &event,
        )?)?;
        info!(task = %task.name, version, assignments = ?optimized.model_assignments, "optimized model tiers");
        Ok(Some(optimized))
    }

    /// Publish a shared pattern: `regex` when given, else the task's active plan.
    pub fn promote_pattern(
        &self,
        task: &Task,
        name: &str,
        category: Option<&str>,
        description: &str,
        regex: Option<&str>,
    ) -> Result<SharedPattern, PipelineError> {
        let (implementation, kind) = match regex {
            Some(re) => {
                Regex::new(re).map_err(|e| PipelineError::InvalidPattern {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                (re.to_string(), ImplementationType::Regex)
            }
            None => {
                let workflow = self.store.active_workflow(task.id)?;
                if workflow.artifact_kind != ArtifactKind::Plan {
                    return Err(PipelineError::InvalidPattern {
                        name: name.to_string(),
                        reason: "only plans or regexes can be promoted".into(),
                    });
                }
                let bytes = self.code.read_path(&workflow.artifact_path)?;
                (String::from_utf8_lossy(&bytes).into_owned(), ImplementationType::Code)
            }
        };
        let category = category.unwrap_or(&task.name);
        let pattern = self
            .store
            .promote_pattern(name, category, description, &implementation, kind)?;
        self.store.record_event(
            task.id,
            &NewEvent::new(EventType::PatternPromoted, task.iteration).mutation(json!({
                "pattern": pattern.name,
                "category": pattern.category,
                "implementation_type": pattern.implementation_type,
            })),
        )?;
        Ok(pattern)
    }

    /// Move a task to a terminal state. Only `Completed` and `Failed` are accepted.
    pub fn close_task(&self, name: &str, status: TaskStatus) -> Result<Task, PipelineError> {
        let task = self.store.task_by_name(name)?;
        if !status.is_terminal() {
            return Err(PipelineError::TaskState {
                task: task.name,
                status: task.status,
                reason: "tasks can only be closed as completed or failed",
            });
        }
        if task.status.is_terminal() {
            return Err(PipelineError::TaskState {
                task: task.name,
                status: task.status,
                reason: "task is already closed",
            });
        }
        Ok(self.store.set_task_status(task.id, status)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedJudge, pipeline, seed};
    use anyextract_ai::ScriptedProvider;
    use anyextract_core::SchemaField;
    use std::sync::Arc;

    const PLAN: &str = r#"{"entry": "extract", "fields": {"summary": {"rule": "llm"}}}"#;

    fn fixture(dir: &Path) -> Pipeline {
        pipeline(
            dir,
            Arc::new(ScriptedProvider::constant(r#"{"summary": "ok"}"#)),
            Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 1.0)),
        )
    }

    #[test]
    fn schema_update_records_diff() {
        let dir = tempfile::tempdir().unwrap();
        let p = fixture(dir.path());
        let (task, _) = seed(&p, PLAN, &["summary"], &[("a.txt", "x")]);
        let next = SchemaDefinition::new(vec![
            SchemaField::new("summary", "string"),
            SchemaField::new("rating", "string"),
        ]);
        let v = p.set_schema(&task, &next).unwrap();
        assert_eq!(v.version, 2);
        let events = p.store().events(task.id).unwrap();
        assert_eq!(events[0].event_type, EventType::SchemaUpdate);
        assert_eq!(events[0].mutation["added"], json!(["rating"]));

        assert!(p.set_schema(&task, &SchemaDefinition::new(vec![])).is_err());
        assert_eq!(p.store().active_schema(task.id).unwrap().version, 2);
    }

    #[tokio::test]
    async fn import_validates_before_storing() {
        let dir = tempfile::tempdir().unwrap();
        let p = fixture(dir.path());
        let (task, _) = seed(&p, PLAN, &["summary"], &[("a.txt", "x")]);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"entry": "run"}"#).unwrap();
        assert!(p.import_workflow(&task, &bad).await.is_err());
        let unknown = dir.path().join("plan.yaml");
        std::fs::write(&unknown, "entry: extract").unwrap();
        assert!(matches!(
            p.import_workflow(&task, &unknown).await,
            Err(PipelineError::UnsupportedArtifact(_))
        ));
        assert_eq!(p.store().workflow_history(task.id).unwrap().len(), 1);

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"entry": "extract", "fields": {}}"#).unwrap();
        let v = p.import_workflow(&task, &good).await.unwrap();
        assert_eq!(v.version, 2);
        assert!(v.is_active);
        assert!(p.code().diff("reports", 1, 2).unwrap().contains("+{\"entry\": \"extract\", \"fields\": {}}"));
    }

    fn reassign(p: &Pipeline, task: &Task, assignments: &[(&str, &str)]) -> WorkflowVersion {
        let active = p.store().active_workflow(task.id).unwrap();
        p.store()
            .create_workflow_version(
                task.id,
                &NewWorkflow {
                    artifact_path: active.artifact_path,
                    commit_ref: active.commit_ref,
                    artifact_kind: active.artifact_kind,
                    model_assignments: assignments
                        .iter()
                        .map(|(f, m)| (f.to_string(), m.to_string()))
                        .collect(),
                    metadata: serde_json::Value::Null,
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn optimize_downgrades_accurate_fields() {
        let dir = tempfile::tempdir().unwrap();
        let p = fixture(dir.path());
        let (task, docs) = seed(&p, PLAN, &["summary"], &[("a.txt", "x"), ("b.txt", "y")]);

        // Iteration 0 runs on the large tier, iteration 1 on the small one.
        p.execute(&task, &docs, None).await.unwrap();
        p.observe(&task, true).await.unwrap();
        reassign(&p, &task, &[("summary", "small")]);
        let mut later = task.clone();
        later.iteration = 1;
        p.execute(&later, &docs, None).await.unwrap();
        p.observe(&later, true).await.unwrap();
        let accuracy = p.tier_accuracy(&task).unwrap();
        assert_eq!(accuracy.accuracy("summary", "large"), Some(1.0));
        assert_eq!(accuracy.accuracy("summary", "small"), Some(1.0));

        reassign(&p, &task, &[]);
        let optimized = p.optimize(&task).unwrap().unwrap();
        assert_eq!(optimized.version, 4);
        assert_eq!(optimized.model_assignments["summary"], "small");
        assert_eq!(
            p.store().events(task.id).unwrap().last().unwrap().event_type,
            EventType::ModelDowngrade
        );
        assert!(p.optimize(&task).unwrap().is_none());
    }

    #[test]
    fn regex_patterns_must_compile() {
        let dir = tempfile::tempdir().unwrap();
        let p = fixture(dir.path());
        let (task, _) = seed(&p, PLAN, &["summary"], &[("a.txt", "x")]);
        assert!(matches!(
            p.promote_pattern(&task, "broken", None, "", Some("(")),
            Err(PipelineError::InvalidPattern { .. })
        ));
        let pattern = p
            .promote_pattern(&task, "iso_date", Some("dates"), "ISO dates", Some(r"\d{4}-\d{2}-\d{2}"))
            .unwrap();
        assert_eq!(pattern.implementation_type, ImplementationType::Regex);
        let plan = p.promote_pattern(&task, "reports_plan", None, "full plan", None).unwrap();
        assert_eq!(plan.category, "reports");
        assert_eq!(plan.implementation, PLAN);
    }

    #[test]
    fn close_only_to_terminal_states() {
        let dir = tempfile::tempdir().unwrap();
        let p = fixture(dir.path());
        let (task, _) = seed(&p, PLAN, &["summary"], &[("a.txt", "x")]);
        assert!(p.close_task(&task.name, TaskStatus::Evolving).is_err());
        assert_eq!(p.close_task(&task.name, TaskStatus::Completed).unwrap().status, TaskStatus::Completed);
        assert!(p.close_task(&task.name, TaskStatus::Failed).is_err());
    }
}
