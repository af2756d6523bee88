//! DuckDB store for tasks, versions, extractions, judgments and the pattern library.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyextract_core::ParseEnumError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::types::Type;
use duckdb::{Connection, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::StoreError;

const SCHEMA_SQL: &str = "
CREATE SEQUENCE IF NOT EXISTS seq_tasks START 1;
CREATE SEQUENCE IF NOT EXISTS seq_documents START 1;
CREATE SEQUENCE IF NOT EXISTS seq_schema_versions START 1;
CREATE SEQUENCE IF NOT EXISTS seq_workflow_versions START 1;
CREATE SEQUENCE IF NOT EXISTS seq_extractions START 1;
CREATE SEQUENCE IF NOT EXISTS seq_judgments START 1;
CREATE SEQUENCE IF NOT EXISTS seq_feedback START 1;
CREATE SEQUENCE IF NOT EXISTS seq_events START 1;
CREATE SEQUENCE IF NOT EXISTS seq_patterns START 1;
CREATE SEQUENCE IF NOT EXISTS seq_corner_cases START 1;

CREATE TABLE IF NOT EXISTS tasks (
    id            BIGINT PRIMARY KEY,
    name          VARCHAR NOT NULL UNIQUE,
    description   VARCHAR NOT NULL,
    status        VARCHAR NOT NULL,
    iteration     BIGINT  NOT NULL,
    max_iteration BIGINT  NOT NULL,
    language      VARCHAR NOT NULL,
    config        VARCHAR NOT NULL,
    created_at    VARCHAR NOT NULL,
    updated_at    VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id            BIGINT PRIMARY KEY,
    task_id       BIGINT  NOT NULL,
    file_hash     VARCHAR NOT NULL,
    filename      VARCHAR NOT NULL,
    source_path   VARCHAR NOT NULL,
    pages         VARCHAR NOT NULL,
    page_count    BIGINT  NOT NULL,
    parse_method  VARCHAR NOT NULL,
    is_sample     BOOLEAN NOT NULL,
    metadata      VARCHAR NOT NULL,
    created_at    VARCHAR NOT NULL,
    UNIQUE (task_id, file_hash)
);

CREATE TABLE IF NOT EXISTS schema_versions (
    id            BIGINT PRIMARY KEY,
    task_id       BIGINT  NOT NULL,
    version       BIGINT  NOT NULL,
    definition    VARCHAR NOT NULL,
    is_active     BOOLEAN NOT NULL,
    created_at    VARCHAR NOT NULL,
    UNIQUE (task_id, version)
);

CREATE TABLE IF NOT EXISTS workflow_versions (
    id                BIGINT PRIMARY KEY,
    task_id           BIGINT  NOT NULL,
    version           BIGINT  NOT NULL,
    artifact_path     VARCHAR NOT NULL,
    commit_ref        VARCHAR NOT NULL,
    artifact_kind     VARCHAR NOT NULL,
    model_assignments VARCHAR NOT NULL,
    metadata          VARCHAR NOT NULL,
    is_active         BOOLEAN NOT NULL,
    created_at        VARCHAR NOT NULL,
    UNIQUE (task_id, version)
);

CREATE TABLE IF NOT EXISTS extractions (
    id                  BIGINT PRIMARY KEY,
    task_id             BIGINT  NOT NULL,
    document_id         BIGINT  NOT NULL,
    schema_version_id   BIGINT  NOT NULL,
    workflow_version_id BIGINT  NOT NULL,
    iteration           BIGINT  NOT NULL,
    fields              VARCHAR NOT NULL,
    field_confidence    VARCHAR NOT NULL,
    confidence          DOUBLE  NOT NULL,
    llm_calls           BIGINT  NOT NULL,
    tokens_used         BIGINT  NOT NULL,
    status              VARCHAR NOT NULL,
    error               VARCHAR,
    metadata            VARCHAR NOT NULL,
    created_at          VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS judgments (
    id              BIGINT PRIMARY KEY,
    extraction_id   BIGINT  NOT NULL,
    result          VARCHAR NOT NULL,
    score           DOUBLE  NOT NULL,
    field_judgments VARCHAR NOT NULL,
    reasoning       VARCHAR NOT NULL,
    used_vision     BOOLEAN NOT NULL,
    sampling_method VARCHAR NOT NULL,
    created_at      VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id              BIGINT PRIMARY KEY,
    judgment_id     BIGINT  NOT NULL,
    feedback_type   VARCHAR NOT NULL,
    field_name      VARCHAR,
    original_value  VARCHAR,
    corrected_value VARCHAR,
    comment         VARCHAR,
    created_at      VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS evolution_events (
    id           BIGINT PRIMARY KEY,
    task_id      BIGINT  NOT NULL,
    event_type   VARCHAR NOT NULL,
    iteration    BIGINT  NOT NULL,
    trigger_info VARCHAR NOT NULL,
    mutation     VARCHAR NOT NULL,
    outcome      VARCHAR NOT NULL,
    created_at   VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS shared_patterns (
    id                  BIGINT PRIMARY KEY,
    name                VARCHAR NOT NULL UNIQUE,
    category            VARCHAR NOT NULL,
    description         VARCHAR NOT NULL,
    implementation      VARCHAR NOT NULL,
    implementation_type VARCHAR NOT NULL,
    confidence          DOUBLE  NOT NULL,
    usage_count         BIGINT  NOT NULL,
    success_count       BIGINT  NOT NULL,
    created_at          VARCHAR NOT NULL,
    updated_at          VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS corner_cases (
    id              BIGINT PRIMARY KEY,
    task_id         BIGINT  NOT NULL,
    field_name      VARCHAR NOT NULL,
    description     VARCHAR NOT NULL,
    pattern         VARCHAR,
    resolution      VARCHAR NOT NULL,
    resolution_type VARCHAR NOT NULL,
    created_at      VARCHAR NOT NULL
);
";

/// DuckDB store for every persisted entity of the extraction loop.
///
/// A single connection sits behind a mutex, so every state mutation is
/// serialized. Multi-step mutations (version activation, evolution commit)
/// run inside one transaction.
///
/// Supports both in-memory (ephemeral) and persistent (file-backed) modes.
/// Use [`open`](Self::open) for in-memory and [`open_persistent`](Self::open_persistent)
/// for file-backed storage that survives across process restarts.
pub struct DuckStore {
    conn: Mutex<Connection>,
}

impl DuckStore {
    /// Open an in-memory DuckDB database with all tables created.
    pub fn open() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Other(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "opened persistent store");
        Ok(store)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ── Escape hatch ──

    /// Execute arbitrary SQL and return Arrow RecordBatches.
    pub fn query_arrow(&self, sql: &str) -> Result<Vec<RecordBatch>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }

    // ── Export ──

    /// Latest extraction per document of a task, one row each, as Arrow batches.
    pub fn export_batches(&self, task_id: i64) -> Result<Vec<RecordBatch>, StoreError> {
        self.query_arrow(&export_sql(task_id))
    }

    /// Write the latest extraction per document to a Parquet file.
    pub fn export_parquet(&self, task_id: i64, path: &Path) -> Result<usize, StoreError> {
        let target = path.display().to_string().replace('\'', "''");
        let sql = format!("COPY ({}) TO '{target}' (FORMAT PARQUET)", export_sql(task_id));
        let conn = self.lock()?;
        let rows = conn.execute(&sql, [])?;
        info!(task_id, rows, path = %path.display(), "exported extractions to parquet");
        Ok(rows)
    }
}

fn export_sql(task_id: i64) -> String {
    format!(
        "SELECT d.filename, e.document_id, e.id AS extraction_id, e.iteration, e.status,
                e.confidence, e.fields, e.field_confidence, e.error
         FROM extractions e
         JOIN documents d ON d.id = e.document_id
         WHERE e.task_id = {task_id}
         QUALIFY row_number() OVER (PARTITION BY e.document_id ORDER BY e.id DESC) = 1
         ORDER BY d.filename"
    )
}

// ── Row helpers ──

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn next_id(conn: &Connection, sequence: &str) -> Result<i64, StoreError> {
    let id: i64 = conn.query_row(&format!("SELECT nextval('{sequence}')"), [], |r| r.get(0))?;
    Ok(id)
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn opt_json(value: &Option<serde_json::Value>) -> Result<Option<String>, StoreError> {
    value.as_ref().map(to_json).transpose()
}

fn conversion(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> duckdb::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion(idx, e))
}

pub(crate) fn opt_json_col<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> duckdb::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion(idx, e)))
        .transpose()
}

pub(crate) fn label_col<T>(row: &Row<'_>, idx: usize) -> duckdb::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion(idx, e))
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> duckdb::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

/// Prefix every column in a comma-separated list with a table alias.
pub(crate) fn qualified(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run a single-row query, mapping "no rows" to `None`.
pub(crate) fn query_opt<T, P, F>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: F,
) -> Result<Option<T>, StoreError>
where
    P: duckdb::Params,
    F: FnOnce(&Row<'_>) -> duckdb::Result<T>,
{
    match conn.query_row(sql, params, f) {
        Ok(value) => Ok(Some(value)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
