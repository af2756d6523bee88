//! Tasks and their documents.

use anyextract_core::{Document, Language, NewDocument, Task, TaskStatus};
use duckdb::{Connection, Row, params};
use tracing::info;

use crate::StoreError;
use crate::duck::{DuckStore, json_col, label_col, next_id, now, query_opt, time_col, to_json, ts};

pub(crate) const TASK_COLUMNS: &str = "id, name, description, status, iteration, max_iteration, language, config, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, task_id, file_hash, filename, source_path, pages, page_count, parse_method, is_sample, metadata, created_at";

pub(crate) fn task_from_row(row: &Row<'_>) -> duckdb::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: label_col(row, 3)?,
        iteration: row.get(4)?,
        max_iteration: row.get(5)?,
        language: label_col(row, 6)?,
        config: json_col(row, 7)?,
        created_at: time_col(row, 8)?,
        updated_at: time_col(row, 9)?,
    })
}

fn document_from_row(row: &Row<'_>) -> duckdb::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        task_id: row.get(1)?,
        file_hash: row.get(2)?,
        filename: row.get(3)?,
        source_path: row.get(4)?,
        pages: json_col(row, 5)?,
        page_count: row.get(6)?,
        parse_method: row.get(7)?,
        is_sample: row.get(8)?,
        metadata: json_col(row, 9)?,
        created_at: time_col(row, 10)?,
    })
}

pub(crate) fn load_task(conn: &Connection, task_id: i64) -> Result<Task, StoreError> {
    query_opt(
        conn,
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
        [task_id],
        task_from_row,
    )?
    .ok_or_else(|| StoreError::not_found("task", task_id))
}

pub(crate) fn write_status(
    conn: &Connection,
    task_id: i64,
    status: TaskStatus,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?",
        params![status.as_str(), ts(&now()), task_id],
    )?;
    Ok(())
}

impl DuckStore {
    // ── Tasks ──

    /// Create a task in `Bootstrapping` at iteration 0. Names are unique.
    pub fn create_task(
        &self,
        name: &str,
        description: &str,
        language: Language,
        max_iteration: i64,
        config: &serde_json::Value,
    ) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let exists = query_opt(&conn, "SELECT id FROM tasks WHERE name = ?", [name], |r| {
            r.get::<_, i64>(0)
        })?;
        if exists.is_some() {
            return Err(StoreError::Conflict(format!("task {name:?} already exists")));
        }
        let id = next_id(&conn, "seq_tasks")?;
        let created = ts(&now());
        conn.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?)"),
            params![
                id,
                name,
                description,
                TaskStatus::Bootstrapping.as_str(),
                max_iteration,
                language.as_str(),
                to_json(config)?,
                created,
                created,
            ],
        )?;
        info!(task = name, id, "created task");
        load_task(&conn, id)
    }

    pub fn task(&self, task_id: i64) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        load_task(&conn, task_id)
    }

    pub fn task_by_name(&self, name: &str) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?"),
            [name],
            task_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("task", name))
    }

    pub fn tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))?;
        let rows = stmt.query_map([], task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move a task along a permitted lifecycle edge.
    pub fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<Task, StoreError> {
        let conn = self.lock()?;
        let task = load_task(&conn, task_id)?;
        if task.status == status {
            return Ok(task);
        }
        if !task.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "task {} cannot move from {} to {}",
                task.name, task.status, status
            )));
        }
        write_status(&conn, task_id, status)?;
        info!(task = %task.name, from = %task.status, to = %status, "task status changed");
        load_task(&conn, task_id)
    }

    // ── Documents ──

    /// Store documents for a task, skipping content already present (by hash).
    ///
    /// The first `max_samples` documents a task receives are flagged as samples.
    /// Returns only the newly stored documents.
    pub fn add_documents(
        &self,
        task_id: i64,
        docs: &[NewDocument],
        max_samples: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        load_task(&tx, task_id)?;
        let mut samples: i64 = tx.query_row(
            "SELECT count(*)::BIGINT FROM documents WHERE task_id = ? AND is_sample",
            [task_id],
            |r| r.get(0),
        )?;

        let mut ids = Vec::new();
        for doc in docs {
            let dup = query_opt(
                &tx,
                "SELECT id FROM documents WHERE task_id = ? AND file_hash = ?",
                params![task_id, doc.file_hash],
                |r| r.get::<_, i64>(0),
            )?;
            if dup.is_some() {
                continue;
            }
            let is_sample = (samples as usize) < max_samples;
            if is_sample {
                samples += 1;
            }
            let id = next_id(&tx, "seq_documents")?;
            tx.execute(
                &format!(
                    "INSERT INTO documents ({DOCUMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    id,
                    task_id,
                    doc.file_hash,
                    doc.filename,
                    doc.source_path,
                    to_json(&doc.pages)?,
                    doc.pages.len() as i64,
                    doc.parse_method,
                    is_sample,
                    to_json(&doc.metadata)?,
                    ts(&now()),
                ],
            )?;
            ids.push(id);
        }
        tx.commit()?;
        info!(task_id, added = ids.len(), skipped = docs.len() - ids.len(), "stored documents");

        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE task_id = ? AND id >= ? ORDER BY id"
        ))?;
        let first = ids.first().copied().unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![task_id, first], document_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn documents(&self, task_id: i64) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE task_id = ? ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id], document_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn sample_documents(&self, task_id: i64) -> Result<Vec<Document>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE task_id = ? AND is_sample ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id], document_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn document(&self, document_id: i64) -> Result<Document, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"),
            [document_id],
            document_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("document", document_id))
    }
}
