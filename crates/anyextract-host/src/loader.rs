//! Loads workflow artifacts by version key and caches them for a batch.

use std::collections::HashMap;
use std::sync::Arc;

use anyextract_core::config::ExecutionSettings;
use anyextract_core::{ArtifactKind, WorkflowVersion};
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::code_store::CodeStore;
use crate::component::{ComponentRuntime, ComponentStrategy};
use crate::error::ArtifactError;
use crate::plan::PlanStrategy;
use crate::strategy::ExtractionStrategy;

/// Component runtime created on first use, so plan-only tasks never build
/// a wasmtime engine.
pub struct Components {
    settings: ExecutionSettings,
    runtime: OnceCell<Arc<ComponentRuntime>>,
}

impl Components {
    pub fn new(settings: ExecutionSettings) -> Self {
        Self {
            settings,
            runtime: OnceCell::new(),
        }
    }

    pub async fn runtime(&self) -> Result<Arc<ComponentRuntime>, ArtifactError> {
        self.runtime
            .get_or_try_init(|| async { ComponentRuntime::new(&self.settings).map(Arc::new) })
            .await
            .cloned()
    }
}

/// Artifact cache keyed by `(task_id, version)`.
pub struct ArtifactLoader<'a> {
    code: &'a CodeStore,
    components: &'a Components,
    cache: Mutex<HashMap<(i64, i64), Arc<dyn ExtractionStrategy>>>,
}

impl<'a> ArtifactLoader<'a> {
    pub fn new(code: &'a CodeStore, components: &'a Components) -> Self {
        Self {
            code,
            components,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(
        &self,
        workflow: &WorkflowVersion,
    ) -> Result<Arc<dyn ExtractionStrategy>, ArtifactError> {
        let key = (workflow.task_id, workflow.version);
        let mut cache = self.cache.lock().await;
        if let Some(strategy) = cache.get(&key) {
            return Ok(strategy.clone());
        }

        let bytes = self.code.read_path(&workflow.artifact_path)?;
        let strategy: Arc<dyn ExtractionStrategy> = match workflow.artifact_kind {
            ArtifactKind::Plan => {
                let source = String::from_utf8(bytes)
                    .map_err(|e| ArtifactError::InvalidPlan(format!("plan is not UTF-8: {e}")))?;
                Arc::new(PlanStrategy::from_source(&source)?)
            }
            ArtifactKind::Component => {
                let runtime = self.components.runtime().await?;
                Arc::new(ComponentStrategy::new(runtime, &bytes)?)
            }
        };
        info!(
            task_id = workflow.task_id,
            version = workflow.version,
            kind = %workflow.artifact_kind,
            path = %workflow.artifact_path,
            "loaded workflow artifact"
        );
        cache.insert(key, strategy.clone());
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn workflow(path: &str, kind: ArtifactKind) -> WorkflowVersion {
        WorkflowVersion {
            id: 1,
            task_id: 7,
            version: 1,
            artifact_path: path.into(),
            commit_ref: "00000000".into(),
            artifact_kind: kind,
            model_assignments: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn plans_are_cached_per_version() {
        let dir = tempfile::tempdir().unwrap();
        let code = CodeStore::new(dir.path());
        let components = Components::new(ExecutionSettings::default());
        let (path, _) = code
            .write("t", 1, ArtifactKind::Plan, br#"{"entry": "extract", "fields": {}}"#)
            .unwrap();
        let loader = ArtifactLoader::new(&code, &components);
        let wf = workflow(&path, ArtifactKind::Plan);

        let first = loader.load(&wf).await.unwrap();
        // Later reads come from the cache even if the file goes away.
        std::fs::remove_file(code.resolve(&path)).unwrap();
        let second = loader.load(&wf).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalid_plan_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let code = CodeStore::new(dir.path());
        let components = Components::new(ExecutionSettings::default());
        let (path, _) = code.write("t", 1, ArtifactKind::Plan, b"{\"entry\": \"main\"}").unwrap();
        let loader = ArtifactLoader::new(&code, &components);
        let err = loader.load(&workflow(&path, ArtifactKind::Plan)).await.err().unwrap();
        assert!(matches!(err, ArtifactError::InvalidPlan(_)));
    }
}
