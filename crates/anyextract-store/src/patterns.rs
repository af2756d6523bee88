//! Cross-task pattern library.
//!
//! Confidence is an online accuracy estimate, `success_count / usage_count`,
//! with every use weighted equally.

use anyextract_core::pattern::INITIAL_PATTERN_CONFIDENCE;
use anyextract_core::{ImplementationType, SharedPattern};
use duckdb::{Connection, Row, params};
use tracing::{debug, info};

use crate::StoreError;
use crate::duck::{DuckStore, label_col, next_id, now, query_opt, time_col, ts};

const PATTERN_COLUMNS: &str = "id, name, category, description, implementation, implementation_type, confidence, usage_count, success_count, created_at, updated_at";

/// Default floor for [`DuckStore::find_matching_patterns`].
pub const DEFAULT_MIN_PATTERN_CONFIDENCE: f64 = 0.6;

fn pattern_from_row(row: &Row<'_>) -> duckdb::Result<SharedPattern> {
    Ok(SharedPattern {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        description: row.get(3)?,
        implementation: row.get(4)?,
        implementation_type: label_col(row, 5)?,
        confidence: row.get(6)?,
        usage_count: row.get(7)?,
        success_count: row.get(8)?,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
    })
}

fn load_pattern(conn: &Connection, name: &str) -> Result<Option<SharedPattern>, StoreError> {
    query_opt(
        conn,
        &format!("SELECT {PATTERN_COLUMNS} FROM shared_patterns WHERE name = ?"),
        [name],
        pattern_from_row,
    )
}

impl DuckStore {
    /// Patterns at or above `min_confidence`, best first. `None` matches every category.
    pub fn find_matching_patterns(
        &self,
        category: Option<&str>,
        min_confidence: f64,
    ) -> Result<Vec<SharedPattern>, StoreError> {
        let conn = self.lock()?;
        let patterns = match category {
            Some(cat) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PATTERN_COLUMNS} FROM shared_patterns
                     WHERE category = ? AND confidence >= ? ORDER BY confidence DESC, name"
                ))?;
                stmt.query_map(params![cat, min_confidence], pattern_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PATTERN_COLUMNS} FROM shared_patterns
                     WHERE confidence >= ? ORDER BY confidence DESC, name"
                ))?;
                stmt.query_map([min_confidence], pattern_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(patterns)
    }

    /// Insert or overwrite a pattern by name. Re-promotion replaces the
    /// implementation but keeps identity, usage counts and confidence.
    pub fn promote_pattern(
        &self,
        name: &str,
        category: &str,
        description: &str,
        implementation: &str,
        implementation_type: ImplementationType,
    ) -> Result<SharedPattern, StoreError> {
        let conn = self.lock()?;
        let stamp = ts(&now());
        if load_pattern(&conn, name)?.is_some() {
            conn.execute(
                "UPDATE shared_patterns
                 SET category = ?, description = ?, implementation = ?, implementation_type = ?, updated_at = ?
                 WHERE name = ?",
                params![
                    category,
                    description,
                    implementation,
                    implementation_type.as_str(),
                    stamp,
                    name
                ],
            )?;
            info!(pattern = name, "re-promoted pattern");
        } else {
            let id = next_id(&conn, "seq_patterns")?;
            conn.execute(
                &format!(
                    "INSERT INTO shared_patterns ({PATTERN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)"
                ),
                params![
                    id,
                    name,
                    category,
                    description,
                    implementation,
                    implementation_type.as_str(),
                    INITIAL_PATTERN_CONFIDENCE,
                    stamp,
                    stamp
                ],
            )?;
            info!(pattern = name, category, "promoted pattern");
        }
        load_pattern(&conn, name)?.ok_or_else(|| StoreError::not_found("pattern", name))
    }

    /// Record one use of a pattern and recompute its confidence.
    pub fn update_pattern_stats(&self, name: &str, success: bool) -> Result<SharedPattern, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE shared_patterns
             SET usage_count = usage_count + 1,
                 success_count = success_count + ?,
                 confidence = (success_count + ?)::DOUBLE / (usage_count + 1),
                 updated_at = ?
             WHERE name = ?",
            params![success as i64, success as i64, ts(&now()), name],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("pattern", name));
        }
        let pattern = load_pattern(&conn, name)?.ok_or_else(|| StoreError::not_found("pattern", name))?;
        debug!(
            pattern = name,
            usage = pattern.usage_count,
            confidence = pattern.confidence,
            "pattern stats updated"
        );
        Ok(pattern)
    }

    pub fn pattern(&self, name: &str) -> Result<SharedPattern, StoreError> {
        let conn = self.lock()?;
        load_pattern(&conn, name)?.ok_or_else(|| StoreError::not_found("pattern", name))
    }

    pub fn patterns(&self) -> Result<Vec<SharedPattern>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PATTERN_COLUMNS} FROM shared_patterns ORDER BY confidence DESC, name"
        ))?;
        let rows = stmt.query_map([], pattern_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
