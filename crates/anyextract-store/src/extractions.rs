//! Extractions, observer judgments and human feedback.
//!
//! All three are append-only. The "current" extraction of a document is the
//! one with the highest id; the same rule picks an extraction's current judgment.

use anyextract_core::{
    Extraction, FeedbackRecord, Judgment, NewExtraction, NewFeedback, Verdict,
};
use duckdb::{Row, params};
use tracing::debug;

use crate::StoreError;
use crate::duck::{
    DuckStore, json_col, label_col, next_id, now, opt_json, opt_json_col, qualified, query_opt,
    time_col, to_json, ts,
};

const EXTRACTION_COLUMNS: &str = "id, task_id, document_id, schema_version_id, workflow_version_id, iteration, fields, field_confidence, confidence, llm_calls, tokens_used, status, error, metadata, created_at";
const EXTRACTION_WIDTH: usize = 15;

const JUDGMENT_COLUMNS: &str = "id, extraction_id, result, score, field_judgments, reasoning, used_vision, sampling_method, created_at";

const FEEDBACK_COLUMNS: &str = "id, judgment_id, feedback_type, field_name, original_value, corrected_value, comment, created_at";

/// Judgments reduced to the latest one per extraction.
const LATEST_JUDGMENTS: &str = "(SELECT * FROM judgments QUALIFY row_number() OVER (PARTITION BY extraction_id ORDER BY id DESC) = 1)";

fn extraction_from_row(row: &Row<'_>) -> duckdb::Result<Extraction> {
    Ok(Extraction {
        id: row.get(0)?,
        task_id: row.get(1)?,
        document_id: row.get(2)?,
        schema_version_id: row.get(3)?,
        workflow_version_id: row.get(4)?,
        iteration: row.get(5)?,
        fields: json_col(row, 6)?,
        field_confidence: json_col(row, 7)?,
        confidence: row.get(8)?,
        llm_calls: row.get(9)?,
        tokens_used: row.get(10)?,
        status: label_col(row, 11)?,
        error: row.get(12)?,
        metadata: json_col(row, 13)?,
        created_at: time_col(row, 14)?,
    })
}

fn judgment_at(row: &Row<'_>, o: usize) -> duckdb::Result<Judgment> {
    Ok(Judgment {
        id: row.get(o)?,
        extraction_id: row.get(o + 1)?,
        result: label_col(row, o + 2)?,
        score: row.get(o + 3)?,
        field_judgments: json_col(row, o + 4)?,
        reasoning: row.get(o + 5)?,
        used_vision: row.get(o + 6)?,
        sampling_method: row.get(o + 7)?,
        created_at: time_col(row, o + 8)?,
    })
}

fn judgment_from_row(row: &Row<'_>) -> duckdb::Result<Judgment> {
    judgment_at(row, 0)
}

fn pair_from_row(row: &Row<'_>) -> duckdb::Result<(Extraction, Judgment)> {
    Ok((extraction_from_row(row)?, judgment_at(row, EXTRACTION_WIDTH)?))
}

fn feedback_from_row(row: &Row<'_>) -> duckdb::Result<FeedbackRecord> {
    Ok(FeedbackRecord {
        id: row.get(0)?,
        judgment_id: row.get(1)?,
        feedback_type: label_col(row, 2)?,
        field_name: row.get(3)?,
        original_value: opt_json_col(row, 4)?,
        corrected_value: opt_json_col(row, 5)?,
        comment: row.get(6)?,
        created_at: time_col(row, 7)?,
    })
}

/// Aggregate LLM usage over a task's extractions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UsageTotals {
    pub extractions: i64,
    pub llm_calls: i64,
    pub tokens_used: i64,
}

impl DuckStore {
    // ── Extractions ──

    pub fn insert_extraction(&self, new: &NewExtraction) -> Result<Extraction, StoreError> {
        let conn = self.lock()?;
        let id = next_id(&conn, "seq_extractions")?;
        let created_at = now();
        conn.execute(
            &format!(
                "INSERT INTO extractions ({EXTRACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                id,
                new.task_id,
                new.document_id,
                new.schema_version_id,
                new.workflow_version_id,
                new.iteration,
                to_json(&new.fields)?,
                to_json(&new.field_confidence)?,
                new.confidence,
                new.llm_calls,
                new.tokens_used,
                new.status.as_str(),
                new.error,
                to_json(&new.metadata)?,
                ts(&created_at),
            ],
        )?;
        debug!(id, document_id = new.document_id, status = %new.status, "stored extraction");
        Ok(Extraction {
            id,
            task_id: new.task_id,
            document_id: new.document_id,
            schema_version_id: new.schema_version_id,
            workflow_version_id: new.workflow_version_id,
            iteration: new.iteration,
            fields: new.fields.clone(),
            field_confidence: new.field_confidence.clone(),
            confidence: new.confidence,
            llm_calls: new.llm_calls,
            tokens_used: new.tokens_used,
            status: new.status,
            error: new.error.clone(),
            metadata: new.metadata.clone(),
            created_at,
        })
    }

    pub fn extraction(&self, extraction_id: i64) -> Result<Extraction, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!("SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE id = ?"),
            [extraction_id],
            extraction_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("extraction", extraction_id))
    }

    /// The current extraction of every document of a task.
    pub fn latest_extractions(&self, task_id: i64) -> Result<Vec<Extraction>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE task_id = ?
             QUALIFY row_number() OVER (PARTITION BY document_id ORDER BY id DESC) = 1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id], extraction_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The latest extraction per document among those made at `iteration`.
    pub fn extractions_at_iteration(
        &self,
        task_id: i64,
        iteration: i64,
    ) -> Result<Vec<Extraction>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE task_id = ? AND iteration = ?
             QUALIFY row_number() OVER (PARTITION BY document_id ORDER BY id DESC) = 1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([task_id, iteration], extraction_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn usage_totals(&self, task_id: i64) -> Result<UsageTotals, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT count(*)::BIGINT, COALESCE(SUM(llm_calls), 0)::BIGINT, COALESCE(SUM(tokens_used), 0)::BIGINT
             FROM extractions WHERE task_id = ?",
            [task_id],
            |r| {
                Ok(UsageTotals {
                    extractions: r.get(0)?,
                    llm_calls: r.get(1)?,
                    tokens_used: r.get(2)?,
                })
            },
        )?)
    }

    // ── Judgments ──

    pub fn insert_judgment(
        &self,
        extraction_id: i64,
        verdict: &Verdict,
        used_vision: bool,
        sampling_method: &str,
    ) -> Result<Judgment, StoreError> {
        let conn = self.lock()?;
        let id = next_id(&conn, "seq_judgments")?;
        let created_at = now();
        conn.execute(
            &format!("INSERT INTO judgments ({JUDGMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                id,
                extraction_id,
                verdict.result.as_str(),
                verdict.score,
                to_json(&verdict.field_judgments)?,
                verdict.reasoning,
                used_vision,
                sampling_method,
                ts(&created_at),
            ],
        )?;
        Ok(Judgment {
            id,
            extraction_id,
            result: verdict.result,
            score: verdict.score,
            field_judgments: verdict.field_judgments.clone(),
            reasoning: verdict.reasoning.clone(),
            used_vision,
            sampling_method: sampling_method.to_string(),
            created_at,
        })
    }

    pub fn judgment(&self, judgment_id: i64) -> Result<Judgment, StoreError> {
        let conn = self.lock()?;
        query_opt(
            &conn,
            &format!("SELECT {JUDGMENT_COLUMNS} FROM judgments WHERE id = ?"),
            [judgment_id],
            judgment_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("judgment", judgment_id))
    }

    /// Every judgment made on extractions of `iteration`, oldest first.
    pub fn judgments_at_iteration(
        &self,
        task_id: i64,
        iteration: i64,
    ) -> Result<Vec<Judgment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM judgments j JOIN extractions e ON e.id = j.extraction_id
             WHERE e.task_id = ? AND e.iteration = ? ORDER BY j.id",
            qualified(JUDGMENT_COLUMNS, "j")
        ))?;
        let rows = stmt.query_map([task_id, iteration], judgment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn judgments(&self, task_id: i64) -> Result<Vec<Judgment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM judgments j JOIN extractions e ON e.id = j.extraction_id
             WHERE e.task_id = ? ORDER BY j.id",
            qualified(JUDGMENT_COLUMNS, "j")
        ))?;
        let rows = stmt.query_map([task_id], judgment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Current extractions of `iteration` paired with their most recent
    /// judgment, restricted to judgments that are `incorrect` or `partial`.
    pub fn failed_extractions(
        &self,
        task_id: i64,
        iteration: i64,
    ) -> Result<Vec<(Extraction, Judgment)>, StoreError> {
        self.judged_pairs(task_id, Some(iteration), true)
    }

    /// Every current extraction of a task that has been judged, with its latest judgment.
    pub fn judged_extractions(
        &self,
        task_id: i64,
    ) -> Result<Vec<(Extraction, Judgment)>, StoreError> {
        self.judged_pairs(task_id, None, false)
    }

    fn judged_pairs(
        &self,
        task_id: i64,
        iteration: Option<i64>,
        failures_only: bool,
    ) -> Result<Vec<(Extraction, Judgment)>, StoreError> {
        let conn = self.lock()?;
        let mut filter = String::from("e.task_id = ?");
        if iteration.is_some() {
            filter.push_str(" AND e.iteration = ?");
        }
        if failures_only {
            filter.push_str(" AND j.result IN ('incorrect', 'partial')");
        }
        let sql = format!(
            "WITH current AS (
                SELECT * FROM extractions WHERE task_id = ?
                QUALIFY row_number() OVER (PARTITION BY document_id, iteration ORDER BY id DESC) = 1
             )
             SELECT {}, {} FROM current e JOIN {LATEST_JUDGMENTS} j ON j.extraction_id = e.id
             WHERE {filter} ORDER BY e.id",
            qualified(EXTRACTION_COLUMNS, "e"),
            qualified(JUDGMENT_COLUMNS, "j"),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match iteration {
            Some(it) => stmt
                .query_map(params![task_id, task_id, it], pair_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![task_id, task_id], pair_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    // ── Feedback ──

    pub fn add_feedback(&self, new: &NewFeedback) -> Result<FeedbackRecord, StoreError> {
        let conn = self.lock()?;
        let exists = query_opt(&conn, "SELECT id FROM judgments WHERE id = ?", [new.judgment_id], |r| {
            r.get::<_, i64>(0)
        })?;
        if exists.is_none() {
            return Err(StoreError::not_found("judgment", new.judgment_id));
        }
        let id = next_id(&conn, "seq_feedback")?;
        let created_at = now();
        conn.execute(
            &format!("INSERT INTO feedback ({FEEDBACK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                id,
                new.judgment_id,
                new.feedback_type.as_str(),
                new.field_name,
                opt_json(&new.original_value)?,
                opt_json(&new.corrected_value)?,
                new.comment,
                ts(&created_at),
            ],
        )?;
        Ok(FeedbackRecord {
            id,
            judgment_id: new.judgment_id,
            feedback_type: new.feedback_type,
            field_name: new.field_name.clone(),
            original_value: new.original_value.clone(),
            corrected_value: new.corrected_value.clone(),
            comment: new.comment.clone(),
            created_at,
        })
    }

    pub fn feedback(&self, task_id: i64) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM feedback f
             JOIN judgments j ON j.id = f.judgment_id
             JOIN extractions e ON e.id = j.extraction_id
             WHERE e.task_id = ? ORDER BY f.id",
            qualified(FEEDBACK_COLUMNS, "f")
        ))?;
        let rows = stmt.query_map([task_id], feedback_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use anyextract_core::{
        ExtractionMetadata, ExtractionStatus, FeedbackType, FieldJudgment, JudgmentResult,
        Language, NewDocument, Page,
    };
    use serde_json::json;

    struct Fixture {
        store: DuckStore,
        task: i64,
        docs: Vec<i64>,
    }

    fn fixture(n_docs: usize) -> Fixture {
        let store = DuckStore::open().unwrap();
        let task = store
            .create_task("reports", "", Language::En, 20, &serde_json::Value::Null)
            .unwrap()
            .id;
        let new_docs: Vec<NewDocument> = (0..n_docs)
            .map(|i| NewDocument {
                file_hash: format!("hash{i}"),
                filename: format!("doc{i}.txt"),
                source_path: format!("/in/doc{i}.txt"),
                pages: vec![Page::new(1, format!("document {i}"))],
                parse_method: "text".into(),
                metadata: BTreeMap::new(),
            })
            .collect();
        let docs = store
            .add_documents(task, &new_docs, 10)
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        Fixture { store, task, docs }
    }

    fn extraction(f: &Fixture, doc: i64, iteration: i64, title: &str) -> Extraction {
        f.store
            .insert_extraction(&NewExtraction {
                task_id: f.task,
                document_id: doc,
                schema_version_id: 1,
                workflow_version_id: 1,
                iteration,
                fields: BTreeMap::from([("title".to_string(), json!(title))]),
                field_confidence: BTreeMap::from([("title".to_string(), 0.8)]),
                confidence: 0.8,
                llm_calls: 1,
                tokens_used: 120,
                status: ExtractionStatus::Completed,
                error: None,
                metadata: ExtractionMetadata::default(),
            })
            .unwrap()
    }

    fn verdict(result: JudgmentResult, score: f64) -> Verdict {
        Verdict {
            result,
            score,
            field_judgments: vec![FieldJudgment {
                field_name: "title".into(),
                result,
                score,
                reasoning: String::new(),
                expected_value: None,
            }],
            reasoning: "checked".into(),
        }
    }

    #[test]
    fn latest_extraction_per_document_wins() {
        let f = fixture(2);
        extraction(&f, f.docs[0], 0, "old");
        let newer = extraction(&f, f.docs[0], 0, "new");
        extraction(&f, f.docs[1], 0, "other");
        let latest = f.store.latest_extractions(f.task).unwrap();
        assert_eq!(latest.len(), 2);
        let first = latest.iter().find(|e| e.document_id == f.docs[0]).unwrap();
        assert_eq!(first.id, newer.id);
        assert_eq!(first.fields["title"], "new");
    }

    #[test]
    fn failed_uses_most_recent_judgment() {
        let f = fixture(3);
        let a = extraction(&f, f.docs[0], 1, "a");
        let b = extraction(&f, f.docs[1], 1, "b");
        let c = extraction(&f, f.docs[2], 1, "c");
        // a: incorrect then corrected -> not failed.
        f.store.insert_judgment(a.id, &verdict(JudgmentResult::Incorrect, 0.0), false, "full").unwrap();
        f.store.insert_judgment(a.id, &verdict(JudgmentResult::Correct, 1.0), false, "reverify").unwrap();
        // b: partial -> failed.
        f.store.insert_judgment(b.id, &verdict(JudgmentResult::Partial, 0.5), false, "full").unwrap();
        // c: missing -> not failed.
        f.store.insert_judgment(c.id, &verdict(JudgmentResult::Missing, 0.0), false, "full").unwrap();

        let failed = f.store.failed_extractions(f.task, 1).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.id, b.id);
        assert_eq!(failed[0].1.result, JudgmentResult::Partial);
        assert!(f.store.failed_extractions(f.task, 0).unwrap().is_empty());
    }

    #[test]
    fn iteration_scoping_of_judgments() {
        let f = fixture(1);
        let e0 = extraction(&f, f.docs[0], 0, "x");
        let e1 = extraction(&f, f.docs[0], 1, "y");
        f.store.insert_judgment(e0.id, &verdict(JudgmentResult::Correct, 1.0), false, "full").unwrap();
        f.store.insert_judgment(e1.id, &verdict(JudgmentResult::Incorrect, 0.1), true, "full").unwrap();
        let at1 = f.store.judgments_at_iteration(f.task, 1).unwrap();
        assert_eq!(at1.len(), 1);
        assert!(at1[0].used_vision);
        assert_eq!(f.store.judgments(f.task).unwrap().len(), 2);
        assert_eq!(f.store.extractions_at_iteration(f.task, 0).unwrap()[0].id, e0.id);
        assert_eq!(f.store.judged_extractions(f.task).unwrap().len(), 2);
    }

    #[test]
    fn usage_totals_sum_extractions() {
        let f = fixture(2);
        extraction(&f, f.docs[0], 0, "a");
        extraction(&f, f.docs[1], 0, "b");
        let totals = f.store.usage_totals(f.task).unwrap();
        assert_eq!(totals.extractions, 2);
        assert_eq!(totals.llm_calls, 2);
        assert_eq!(totals.tokens_used, 240);
    }

    #[test]
    fn feedback_requires_existing_judgment() {
        let f = fixture(1);
        let e = extraction(&f, f.docs[0], 0, "Q3 outlook");
        let j = f.store.insert_judgment(e.id, &verdict(JudgmentResult::Partial, 0.6), false, "full").unwrap();
        let fb = f
            .store
            .add_feedback(&NewFeedback {
                judgment_id: j.id,
                feedback_type: FeedbackType::Correction,
                field_name: Some("title".into()),
                original_value: Some(json!("Q3 outlook")),
                corrected_value: Some(json!("Q3 2024 outlook")),
                comment: None,
            })
            .unwrap();
        assert_eq!(f.store.feedback(f.task).unwrap()[0].id, fb.id);
        assert_eq!(
            f.store.feedback(f.task).unwrap()[0].corrected_value,
            Some(json!("Q3 2024 outlook"))
        );

        let missing = NewFeedback {
            judgment_id: 999,
            feedback_type: FeedbackType::Comment,
            field_name: None,
            original_value: None,
            corrected_value: None,
            comment: Some("?".into()),
        };
        assert!(matches!(f.store.add_feedback(&missing), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn export_picks_latest_per_document() {
        let f = fixture(2);
        extraction(&f, f.docs[0], 0, "first");
        extraction(&f, f.docs[0], 1, "second");
        extraction(&f, f.docs[1], 0, "third");
        let batches = f.store.export_batches(f.task).unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out.parquet");
        f.store.export_parquet(f.task, &out).unwrap();
        assert!(out.exists());
    }
}
