//! Version registry for schema and workflow artifacts.
//!
//! Each task's versions are numbered densely from 1. Creating a version
//! deactivates the previous active one and inserts the new one as active,
//! inside a single transaction.

use anyextract_core::{
    NewEvent, NewWorkflow, SchemaDefinition, SchemaVersion, Version, VersionKind, VersionPayload,
    WorkflowVersion,
};
use duckdb::{Connection, Row, params};
use tracing::info;

use crate::StoreError;
use crate::duck::{DuckStore, json_col, label_col, next_id, now, query_opt, time_col, to_json, ts};
use crate::events::insert_event;

const SCHEMA_VERSION_COLUMNS: &str = "id, task_id, version, definition, is_active, created_at";

const WORKFLOW_VERSION_COLUMNS: &str = "id, task_id, version, artifact_path, commit_ref, artifact_kind, model_assignments, metadata, is_active, created_at";

fn schema_version_from_row(row: &Row<'_>) -> duckdb::Result<SchemaVersion> {
    Ok(SchemaVersion {
        id: row.get(0)?,
        task_id: row.get(1)?,
        version: row.get(2)?,
        definition: json_col(row, 3)?,
        is_active: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

fn workflow_version_from_row(row: &Row<'_>) -> duckdb::Result<WorkflowVersion> {
    Ok(WorkflowVersion {
        id: row.get(0)?,
        task_id: row.get(1)?,
        version: row.get(2)?,
        artifact_path: row.get(3)?,
        commit_ref: row.get(4)?,
        artifact_kind: label_col(row, 5)?,
        model_assignments: json_col(row, 6)?,
        metadata: json_col(row, 7)?,
        is_active: row.get(8)?,
        created_at: time_col(row, 9)?,
    })
}

fn table(kind: VersionKind) -> &'static str {
    match kind {
        VersionKind::Schema => "schema_versions",
        VersionKind::Workflow => "workflow_versions",
    }
}

/// Highest version number of `kind` for the task plus one, starting at 1.
pub(crate) fn next_version(
    conn: &Connection,
    kind: VersionKind,
    task_id: i64,
) -> Result<i64, StoreError> {
    let sql = format!(
        "SELECT (COALESCE(MAX(version), 0) + 1)::BIGINT FROM {} WHERE task_id = ?",
        table(kind)
    );
    Ok(conn.query_row(&sql, [task_id], |r| r.get(0))?)
}

fn deactivate(conn: &Connection, kind: VersionKind, task_id: i64) -> Result<(), StoreError> {
    let sql = format!(
        "UPDATE {} SET is_active = false WHERE task_id = ? AND is_active",
        table(kind)
    );
    conn.execute(&sql, [task_id])?;
    Ok(())
}

pub(crate) fn insert_schema_version(
    conn: &Connection,
    task_id: i64,
    definition: &SchemaDefinition,
) -> Result<SchemaVersion, StoreError> {
    let version = next_version(conn, VersionKind::Schema, task_id)?;
    deactivate(conn, VersionKind::Schema, task_id)?;
    let id = next_id(conn, "seq_schema_versions")?;
    let created_at = now();
    conn.execute(
        &format!("INSERT INTO schema_versions ({SCHEMA_VERSION_COLUMNS}) VALUES (?, ?, ?, ?, true, ?)"),
        params![id, task_id, version, to_json(definition)?, ts(&created_at)],
    )?;
    Ok(SchemaVersion {
        id,
        task_id,
        version,
        definition: definition.clone(),
        is_active: true,
        created_at,
    })
}

pub(crate) fn insert_workflow_version(
    conn: &Connection,
    task_id: i64,
    workflow: &NewWorkflow,
) -> Result<WorkflowVersion, StoreError> {
    let version = next_version(conn, VersionKind::Workflow, task_id)?;
    deactivate(conn, VersionKind::Workflow, task_id)?;
    let id = next_id(conn, "seq_workflow_versions")?;
    let created_at = now();
    conn.execute(
        &format!(
            "INSERT INTO workflow_versions ({WORKFLOW_VERSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, true, ?)"
        ),
        params![
            id,
            task_id,
            version,
            workflow.artifact_path,
            workflow.commit_ref,
            workflow.artifact_kind.as_str(),
            to_json(&workflow.model_assignments)?,
            to_json(&workflow.metadata)?,
            ts(&created_at),
        ],
    )?;
    Ok(WorkflowVersion {
        id,
        task_id,
        version,
        artifact_path: workflow.artifact_path.clone(),
        commit_ref: workflow.commit_ref.clone(),
        artifact_kind: workflow.artifact_kind,
        model_assignments: workflow.model_assignments.clone(),
        metadata: workflow.metadata.clone(),
        is_active: true,
        created_at,
    })
}

fn insert_version(
    conn: &Connection,
    task_id: i64,
    payload: &VersionPayload,
) -> Result<Version, StoreError> {
    Ok(match payload {
        VersionPayload::Schema(def) => Version::Schema(insert_schema_version(conn, task_id, def)?),
        VersionPayload::Workflow(wf) => {
            Version::Workflow(insert_workflow_version(conn, task_id, wf)?)
        }
    })
}

pub(crate) fn load_active_workflow(
    conn: &Connection,
    task_id: i64,
) -> Result<Option<WorkflowVersion>, StoreError> {
    query_opt(
        conn,
        &format!(
            "SELECT {WORKFLOW_VERSION_COLUMNS} FROM workflow_versions WHERE task_id = ? AND is_active"
        ),
        [task_id],
        workflow_version_from_row,
    )
}

impl DuckStore {
    /// Register the next version of an artifact and make it the only active one.
    pub fn create_version(
        &self,
        task_id: i64,
        payload: &VersionPayload,
    ) -> Result<Version, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        crate::tasks::load_task(&tx, task_id)?;
        let version = insert_version(&tx, task_id, payload)?;
        tx.commit()?;
        info!(task_id, kind = %payload.kind(), version = version.number(), "created version");
        Ok(version)
    }

    /// Like [`create_version`](Self::create_version), recording an event in the same transaction.
    pub fn create_version_with_event(
        &self,
        task_id: i64,
        payload: &VersionPayload,
        event: &NewEvent,
    ) -> Result<Version, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        crate::tasks::load_task(&tx, task_id)?;
        let version = insert_version(&tx, task_id, payload)?;
        insert_event(&tx, task_id, event)?;
        tx.commit()?;
        info!(
            task_id,
            kind = %payload.kind(),
            version = version.number(),
            event = %event.event_type,
            "created version"
        );
        Ok(version)
    }

    pub fn create_schema_version(
        &self,
        task_id: i64,
        definition: &SchemaDefinition,
    ) -> Result<SchemaVersion, StoreError> {
        match self.create_version(task_id, &VersionPayload::Schema(definition.clone()))? {
            Version::Schema(v) => Ok(v),
            Version::Workflow(_) => Err(StoreError::Other("registry returned a workflow version".into())),
        }
    }

    pub fn create_workflow_version(
        &self,
        task_id: i64,
        workflow: &NewWorkflow,
    ) -> Result<WorkflowVersion, StoreError> {
        match self.create_version(task_id, &VersionPayload::Workflow(workflow.clone()))? {
            Version::Workflow(v) => Ok(v),
            Version::Schema(_) => Err(StoreError::Other("registry returned a schema version".into())),
        }
    }

    /// The active schema version, or `NotFound`.
    pub fn active_schema(&self, task_id: i64) -> Result<SchemaVersion, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!(
                "SELECT {SCHEMA_VERSION_COLUMNS} FROM schema_versions WHERE task_id = ? AND is_active"
            ),
            [task_id],
            schema_version_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("active schema version for task", task_id))
    }

    /// The active workflow version, or `NotFound`.
    pub fn active_workflow(&self, task_id: i64) -> Result<WorkflowVersion, StoreError> {
        let conn = self.lock()?;
        load_active_workflow(&conn, task_id)?
            .ok_or_else(|| StoreError::not_found("active workflow version for task", task_id))
    }

    pub fn schema_version(&self, task_id: i64, version: i64) -> Result<SchemaVersion, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!(
                "SELECT {SCHEMA_VERSION_COLUMNS} FROM schema_versions WHERE task_id = ? AND version = ?"
            ),
            [task_id, version],
            schema_version_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("schema version", format!("{task_id}/v{version}")))
    }

    pub fn workflow_version(
        &self,
        task_id: i64,
        version: i64,
    ) -> Result<WorkflowVersion, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!(
                "SELECT {WORKFLOW_VERSION_COLUMNS} FROM workflow_versions WHERE task_id = ? AND version = ?"
            ),
            [task_id, version],
            workflow_version_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("workflow version", format!("{task_id}/v{version}")))
    }

    pub fn schema_history(&self, task_id: i64) -> Result<Vec<SchemaVersion>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEMA_VERSION_COLUMNS} FROM schema_versions WHERE task_id = ? ORDER BY version"
        ))?;
        let rows = stmt.query_map([task_id], schema_version_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn workflow_history(&self, task_id: i64) -> Result<Vec<WorkflowVersion>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORKFLOW_VERSION_COLUMNS} FROM workflow_versions WHERE task_id = ? ORDER BY version"
        ))?;
        let rows = stmt.query_map([task_id], workflow_version_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Version number the next workflow for this task will get.
    pub fn next_workflow_version(&self, task_id: i64) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        next_version(&conn, VersionKind::Workflow, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyextract_core::{ArtifactKind, EventType, Language, SchemaField};
    use std::collections::BTreeMap;

    fn setup() -> (DuckStore, i64) {
        let store = DuckStore::open().unwrap();
        let task = store
            .create_task("reports", "", Language::En, 20, &serde_json::Value::Null)
            .unwrap();
        (store, task.id)
    }

    fn workflow(path: &str) -> NewWorkflow {
        NewWorkflow {
            artifact_path: path.into(),
            commit_ref: "abcd1234".into(),
            artifact_kind: ArtifactKind::Plan,
            model_assignments: BTreeMap::from([("title".to_string(), "small".to_string())]),
            metadata: serde_json::json!({"generated_by": "builder"}),
        }
    }

    fn schema(n: usize) -> SchemaDefinition {
        SchemaDefinition::new((0..n).map(|i| SchemaField::new(format!("f{i}"), "string")).collect())
    }

    #[test]
    fn versions_are_dense_with_one_active() {
        let (store, task) = setup();
        for n in 1..=4 {
            let v = store.create_schema_version(task, &schema(n)).unwrap();
            assert_eq!(v.version, n as i64);
            assert!(v.is_active);
        }
        let history = store.schema_history(task).unwrap();
        let numbers: Vec<i64> = history.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(history.iter().filter(|v| v.is_active).count(), 1);
        let active = store.active_schema(task).unwrap();
        assert_eq!(active.version, 4);
        assert_eq!(active.definition.fields.len(), 4);
    }

    #[test]
    fn schema_and_workflow_numbering_is_independent() {
        let (store, task) = setup();
        store.create_schema_version(task, &schema(1)).unwrap();
        store.create_schema_version(task, &schema(2)).unwrap();
        let wf = store.create_workflow_version(task, &workflow("w/1")).unwrap();
        assert_eq!(wf.version, 1);
        assert_eq!(store.next_workflow_version(task).unwrap(), 2);
        assert_eq!(wf.model_assignments["title"], "small");
    }

    #[test]
    fn tasks_do_not_share_versions() {
        let (store, a) = setup();
        let b = store
            .create_task("other", "", Language::En, 20, &serde_json::Value::Null)
            .unwrap()
            .id;
        store.create_workflow_version(a, &workflow("a/1")).unwrap();
        store.create_workflow_version(a, &workflow("a/2")).unwrap();
        let vb = store.create_workflow_version(b, &workflow("b/1")).unwrap();
        assert_eq!(vb.version, 1);
        assert_eq!(store.active_workflow(a).unwrap().artifact_path, "a/2");
        assert_eq!(store.active_workflow(b).unwrap().artifact_path, "b/1");
    }

    #[test]
    fn missing_active_version_is_not_found() {
        let (store, task) = setup();
        assert!(matches!(store.active_schema(task), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.active_workflow(task), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn version_for_unknown_task_rejected() {
        let store = DuckStore::open().unwrap();
        assert!(matches!(
            store.create_schema_version(42, &schema(1)),
            Err(StoreError::NotFound { entity: "task", .. })
        ));
    }

    #[test]
    fn version_and_event_commit_together() {
        let (store, task) = setup();
        let event = NewEvent::new(EventType::WorkflowUpdate, 0)
            .mutation(serde_json::json!({"source": "import"}));
        let v = store
            .create_version_with_event(task, &VersionPayload::Workflow(workflow("w/1")), &event)
            .unwrap();
        assert_eq!(v.number(), 1);
        let events = store.events(task).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::WorkflowUpdate);
    }

    #[test]
    fn old_versions_remain_readable() {
        let (store, task) = setup();
        store.create_workflow_version(task, &workflow("w/1")).unwrap();
        store.create_workflow_version(task, &workflow("w/2")).unwrap();
        let v1 = store.workflow_version(task, 1).unwrap();
        assert!(!v1.is_active);
        assert_eq!(v1.artifact_path, "w/1");
        assert!(matches!(
            store.workflow_version(task, 3),
            Err(StoreError::NotFound { .. })
        ));
    }
}
