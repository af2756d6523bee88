//! Evolution audit log, corner cases, and the evolving-state transitions.

use anyextract_core::{
    CornerCase, EvolutionEvent, NewCornerCase, NewEvent, NewWorkflow, Task, TaskStatus,
    WorkflowVersion,
};
use duckdb::{Connection, Row, params};
use tracing::{info, warn};

use crate::StoreError;
use crate::duck::{DuckStore, json_col, label_col, next_id, now, time_col, to_json, ts};
use crate::registry::insert_workflow_version;
use crate::tasks::{load_task, write_status};

const EVENT_COLUMNS: &str = "id, task_id, event_type, iteration, trigger_info, mutation, outcome, created_at";

const CORNER_CASE_COLUMNS: &str = "id, task_id, field_name, description, pattern, resolution, resolution_type, created_at";

fn event_from_row(row: &Row<'_>) -> duckdb::Result<EvolutionEvent> {
    Ok(EvolutionEvent {
        id: row.get(0)?,
        task_id: row.get(1)?,
        event_type: label_col(row, 2)?,
        iteration: row.get(3)?,
        trigger: json_col(row, 4)?,
        mutation: json_col(row, 5)?,
        outcome: json_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}

fn corner_case_from_row(row: &Row<'_>) -> duckdb::Result<CornerCase> {
    Ok(CornerCase {
        id: row.get(0)?,
        task_id: row.get(1)?,
        field_name: row.get(2)?,
        description: row.get(3)?,
        pattern: row.get(4)?,
        resolution: row.get(5)?,
        resolution_type: label_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}

pub(crate) fn insert_event(
    conn: &Connection,
    task_id: i64,
    event: &NewEvent,
) -> Result<EvolutionEvent, StoreError> {
    let id = next_id(conn, "seq_events")?;
    let created_at = now();
    conn.execute(
        &format!("INSERT INTO evolution_events ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
        params![
            id,
            task_id,
            event.event_type.as_str(),
            event.iteration,
            to_json(&event.trigger)?,
            to_json(&event.mutation)?,
            to_json(&event.outcome)?,
            ts(&created_at),
        ],
    )?;
    Ok(EvolutionEvent {
        id,
        task_id,
        event_type: event.event_type,
        iteration: event.iteration,
        trigger: event.trigger.clone(),
        mutation: event.mutation.clone(),
        outcome: event.outcome.clone(),
        created_at,
    })
}

impl DuckStore {
    // ── Events ──

    pub fn record_event(&self, task_id: i64, event: &NewEvent) -> Result<EvolutionEvent, StoreError> {
        let conn = self.lock()?;
        let recorded = insert_event(&conn, task_id, event)?;
        info!(task_id, event = %event.event_type, iteration = event.iteration, "recorded event");
        Ok(recorded)
    }

    /// All events of a task in the order they were recorded.
    pub fn events(&self, task_id: i64) -> Result<Vec<EvolutionEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM evolution_events WHERE task_id = ? ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Corner cases ──

    /// Persist corner cases together with the event announcing them.
    pub fn add_corner_cases(
        &self,
        task_id: i64,
        cases: &[NewCornerCase],
        event: &NewEvent,
    ) -> Result<Vec<CornerCase>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(cases.len());
        for case in cases {
            let id = next_id(&tx, "seq_corner_cases")?;
            let created_at = now();
            tx.execute(
                &format!(
                    "INSERT INTO corner_cases ({CORNER_CASE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    id,
                    task_id,
                    case.field_name,
                    case.description,
                    case.pattern,
                    case.resolution,
                    case.resolution_type.as_str(),
                    ts(&created_at),
                ],
            )?;
            stored.push(CornerCase {
                id,
                task_id,
                field_name: case.field_name.clone(),
                description: case.description.clone(),
                pattern: case.pattern.clone(),
                resolution: case.resolution.clone(),
                resolution_type: case.resolution_type,
                created_at,
            });
        }
        insert_event(&tx, task_id, event)?;
        tx.commit()?;
        info!(task_id, count = stored.len(), "recorded corner cases");
        Ok(stored)
    }

    pub fn corner_cases(&self, task_id: i64) -> Result<Vec<CornerCase>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CORNER_CASE_COLUMNS} FROM corner_cases WHERE task_id = ? ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id], corner_case_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Evolution state ──

    /// Compare-and-set `Running -> Evolving`. Fails with `Conflict` if the
    /// task is in any other state, so at most one cycle runs at a time.
    pub fn begin_evolution(&self, task_id: i64) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            params![
                TaskStatus::Evolving.as_str(),
                ts(&now()),
                task_id,
                TaskStatus::Running.as_str()
            ],
        )?;
        let task = load_task(&conn, task_id)?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "task {} is {}, evolution requires running",
                task.name, task.status
            )));
        }
        info!(task = %task.name, iteration = task.iteration, "evolution started");
        Ok(task)
    }

    /// Return an evolving task to `Running` without any mutation.
    pub fn abort_evolution(&self, task_id: i64, reason: &str) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let task = load_task(&conn, task_id)?;
        if task.status == TaskStatus::Evolving {
            write_status(&conn, task_id, TaskStatus::Running)?;
            warn!(task = %task.name, reason, "evolution aborted");
        }
        load_task(&conn, task_id)
    }

    /// Commit a completed cycle in one transaction: register the new workflow
    /// version, record the event, bump the iteration and return to `Running`.
    pub fn commit_evolution(
        &self,
        task_id: i64,
        workflow: &NewWorkflow,
        event: &NewEvent,
    ) -> Result<(WorkflowVersion, Task), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let task = load_task(&tx, task_id)?;
        if task.status != TaskStatus::Evolving {
            return Err(StoreError::Conflict(format!(
                "task {} is {}, cannot commit evolution",
                task.name, task.status
            )));
        }
        let version = insert_workflow_version(&tx, task_id, workflow)?;
        insert_event(&tx, task_id, event)?;
        tx.execute(
            "UPDATE tasks SET iteration = iteration + 1, status = ?, updated_at = ? WHERE id = ?",
            params![TaskStatus::Running.as_str(), ts(&now()), task_id],
        )?;
        let task = load_task(&tx, task_id)?;
        tx.commit()?;
        info!(
            task = %task.name,
            version = version.version,
            iteration = task.iteration,
            "evolution committed"
        );
        Ok((version, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyextract_core::{ArtifactKind, EventType, Language, ResolutionType};
    use std::collections::BTreeMap;

    fn running_task(store: &DuckStore) -> Task {
        let t = store
            .create_task("reports", "", Language::En, 20, &serde_json::Value::Null)
            .unwrap();
        store.set_task_status(t.id, TaskStatus::Running).unwrap()
    }

    fn workflow() -> NewWorkflow {
        NewWorkflow {
            artifact_path: "w/reports/extract_v2.json".into(),
            commit_ref: "0011aabb".into(),
            artifact_kind: ArtifactKind::Plan,
            model_assignments: BTreeMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn second_begin_is_rejected() {
        let store = DuckStore::open().unwrap();
        let t = running_task(&store);
        assert_eq!(store.begin_evolution(t.id).unwrap().status, TaskStatus::Evolving);
        assert!(matches!(store.begin_evolution(t.id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn begin_requires_running() {
        let store = DuckStore::open().unwrap();
        let t = store
            .create_task("boot", "", Language::En, 20, &serde_json::Value::Null)
            .unwrap();
        assert!(matches!(store.begin_evolution(t.id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn abort_restores_running_without_mutation() {
        let store = DuckStore::open().unwrap();
        let t = running_task(&store);
        store.begin_evolution(t.id).unwrap();
        let after = store.abort_evolution(t.id, "no failures").unwrap();
        assert_eq!(after.status, TaskStatus::Running);
        assert_eq!(after.iteration, t.iteration);
        assert!(store.workflow_history(t.id).unwrap().is_empty());
    }

    #[test]
    fn commit_bumps_iteration_and_records_event() {
        let store = DuckStore::open().unwrap();
        let t = running_task(&store);
        store.begin_evolution(t.id).unwrap();
        let event = NewEvent::new(EventType::WorkflowUpdate, t.iteration)
            .trigger(serde_json::json!({"failures": 3}));
        let (version, task) = store.commit_evolution(t.id, &workflow(), &event).unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(task.iteration, t.iteration + 1);
        assert_eq!(task.status, TaskStatus::Running);
        let events = store.events(t.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger["failures"], 3);
    }

    #[test]
    fn commit_outside_evolution_rolls_back() {
        let store = DuckStore::open().unwrap();
        let t = running_task(&store);
        let event = NewEvent::new(EventType::WorkflowUpdate, 0);
        assert!(matches!(
            store.commit_evolution(t.id, &workflow(), &event),
            Err(StoreError::Conflict(_))
        ));
        assert!(store.workflow_history(t.id).unwrap().is_empty());
        assert!(store.events(t.id).unwrap().is_empty());
    }

    #[test]
    fn corner_cases_persist_with_event() {
        let store = DuckStore::open().unwrap();
        let t = running_task(&store);
        let cases = vec![NewCornerCase {
            field_name: "date".into(),
            description: "Quarter-only dates".into(),
            pattern: Some(r"Q[1-4]\s*\d{4}".into()),
            resolution: "Map quarter to its last day".into(),
            resolution_type: ResolutionType::Regex,
        }];
        let event = NewEvent::new(EventType::CornerCaseAdded, 0);
        let stored = store.add_corner_cases(t.id, &cases, &event).unwrap();
        assert_eq!(stored.len(), 1);
        let loaded = store.corner_cases(t.id).unwrap();
        assert_eq!(loaded[0].pattern.as_deref(), Some(r"Q[1-4]\s*\d{4}"));
        assert_eq!(loaded[0].resolution_type, ResolutionType::Regex);
        assert_eq!(store.events(t.id).unwrap()[0].event_type, EventType::CornerCaseAdded);
    }
}
