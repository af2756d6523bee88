//! Execution host for anyextract: runs workflow artifacts over documents,
//! judges the results, and drives the evolution loop.
//!
//! [`Pipeline`] owns the store, settings and model clients. Its operations are
//! split across modules: [`executor`] extraction, [`observer`] judging,
//! [`evolution`] the diagnosis and mutation cycle, [`bootstrap`] task
//! creation, [`manage`] explicit version and pattern management.

use std::sync::Arc;

use anyextract_ai::{Builder, ChatProvider, Judge, LlmJudge};
use anyextract_core::{Settings, Task, TaskStatus};
use anyextract_store::DuckStore;

pub mod bootstrap;
pub mod code_store;
pub mod component;
mod error;
pub mod evolution;
pub mod executor;
pub mod loader;
pub mod manage;
pub mod observer;
pub mod plan;
pub mod source;
pub mod strategy;

pub use bootstrap::BootstrapReport;
pub use code_store::{CodeStore, sanitize_task_name};
pub use error::{ArtifactError, PipelineError};
pub use evolution::{CycleOutcome, EvolutionReport, RunReport};
pub use executor::BatchReport;
pub use observer::ObserveReport;
pub use plan::{Plan, PlanStrategy, PlanValidator, Rule};
pub use strategy::{ExtractionContext, ExtractionStrategy, StrategyOutput};

use loader::Components;

pub struct Pipeline {
    store: DuckStore,
    settings: Settings,
    provider: Arc<dyn ChatProvider>,
    judge: Option<Arc<dyn Judge>>,
    code: CodeStore,
    components: Components,
}

impl Pipeline {
    pub fn new(store: DuckStore, settings: Settings, provider: Arc<dyn ChatProvider>) -> Self {
        let code = CodeStore::new(&settings.paths.workflows_dir);
        let components = Components::new(settings.execution.clone());
        Self {
            store,
            settings,
            provider,
            judge: None,
            code,
            components,
        }
    }

    /// Judge every extraction with `judge` instead of the configured observer model.
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn store(&self) -> &DuckStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn code(&self) -> &CodeStore {
        &self.code
    }

    pub(crate) fn builder(&self, task: &Task) -> Builder {
        Builder::new(self.provider.clone(), &self.settings.models.builder, task.language)
    }

    pub(crate) fn judge(&self, task: &Task) -> Arc<dyn Judge> {
        match &self.judge {
            Some(judge) => judge.clone(),
            None => Arc::new(LlmJudge::new(
                self.provider.clone(),
                &self.settings.models.observer,
                &self.settings.models.observer_vision,
                task.language,
            )),
        }
    }

    /// Load a task by name and require it to be `Running`.
    pub fn running_task(&self, name: &str) -> Result<Task, PipelineError> {
        let task = self.store.task_by_name(name)?;
        require_status(&task, TaskStatus::Running, "operation requires a running task")?;
        Ok(task)
    }
}

pub(crate) fn require_status(
    task: &Task,
    status: TaskStatus,
    reason: &'static str,
) -> Result<(), PipelineError> {
    if task.status == status {
        Ok(())
    } else {
        Err(PipelineError::TaskState {
            task: task.name.clone(),
            status: task.status,
            reason,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Pipelines over an in-memory store with scripted models.

    use super::*;
    use anyextract_ai::{InferenceError, JudgeRequest, ScriptedProvider};
    use anyextract_core::{
        ArtifactKind, Document, JudgmentResult, Language, NewDocument, NewWorkflow, Page,
        SchemaDefinition, SchemaField, Verdict,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type FieldsFn<T> = Box<dyn Fn(&serde_json::Value) -> T + Send + Sync>;

    /// Judge answering from a closure over the extracted fields.
    pub struct ScriptedJudge {
        verdict: FieldsFn<Verdict>,
        fail_when: Option<FieldsFn<bool>>,
        pub calls: Mutex<Vec<bool>>,
    }

    impl ScriptedJudge {
        pub fn new(verdict: impl Fn(&serde_json::Value) -> Verdict + Send + Sync + 'static) -> Self {
            Self {
                verdict: Box::new(verdict),
                fail_when: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Answer with a server error for extractions matching `predicate`.
        pub fn failing_when(
            mut self,
            predicate: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
        ) -> Self {
            self.fail_when = Some(Box::new(predicate));
            self
        }

        pub fn constant(result: JudgmentResult, score: f64) -> Self {
            Self::new(move |_| verdict(result, score))
        }

        /// Vision flag of every call, in order.
        pub fn vision_calls(&self) -> Vec<bool> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    pub fn verdict(result: JudgmentResult, score: f64) -> Verdict {
        Verdict {
            result,
            score,
            field_judgments: Vec::new(),
            reasoning: String::new(),
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, InferenceError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(request.page_image.is_some());
            }
            if self.fail_when.as_ref().is_some_and(|f| f(request.fields)) {
                return Err(InferenceError::Server {
                    status: 500,
                    body: "judge unavailable".into(),
                });
            }
            Ok((self.verdict)(request.fields))
        }
    }

    pub fn settings(workflows: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.workflows_dir = workflows.to_path_buf();
        settings.models.worker_tiers = vec!["large".into(), "small".into()];
        settings
    }

    pub fn pipeline(
        workflows: &std::path::Path,
        provider: Arc<ScriptedProvider>,
        judge: Arc<ScriptedJudge>,
    ) -> Pipeline {
        Pipeline::new(DuckStore::open().unwrap(), settings(workflows), provider).with_judge(judge)
    }

    pub fn new_document(filename: &str, text: &str) -> NewDocument {
        NewDocument {
            file_hash: crate::source::content_hash(format!("{filename}\n{text}").as_bytes()),
            filename: filename.into(),
            source_path: format!("/in/{filename}"),
            pages: vec![Page::new(1, text)],
            parse_method: "text".into(),
            metadata: crate::source::filename_metadata(filename),
        }
    }

    /// A running task at iteration 0 with schema v1, plan v1 and `docs` ingested.
    pub fn seed(
        p: &Pipeline,
        plan: &str,
        fields: &[&str],
        docs: &[(&str, &str)],
    ) -> (Task, Vec<Document>) {
        let store = p.store();
        let task = store
            .create_task("reports", "broker reports", Language::En, 20, &serde_json::Value::Null)
            .unwrap();
        let new: Vec<NewDocument> = docs.iter().map(|(f, t)| new_document(f, t)).collect();
        let documents = store.add_documents(task.id, &new, 10).unwrap();
        let schema = SchemaDefinition::new(
            fields.iter().map(|f| SchemaField::new(*f, "string")).collect(),
        );
        store.create_schema_version(task.id, &schema).unwrap();
        let (path, commit) = p
            .code()
            .write(&sanitize_task_name(&task.name), 1, ArtifactKind::Plan, plan.as_bytes())
            .unwrap();
        store
            .create_workflow_version(
                task.id,
                &NewWorkflow {
                    artifact_path: path,
                    commit_ref: commit,
                    artifact_kind: ArtifactKind::Plan,
                    model_assignments: BTreeMap::new(),
                    metadata: serde_json::Value::Null,
                },
            )
            .unwrap();
        let task = store.set_task_status(task.id, TaskStatus::Running).unwrap();
        (task, documents)
    }
}
