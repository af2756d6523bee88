//! Judging: sample the current iteration's extractions, ask the judge about
//! each, and feed the verdicts back into pattern statistics.

use std::collections::HashMap;

use anyextract_ai::JudgeRequest;
use anyextract_core::{
    Document, Extraction, Judgment, JudgmentResult, SchemaDefinition, Task, Verdict,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::Pipeline;
use crate::error::PipelineError;
use crate::source::page_image_data_uri;

/// Vision judging is used only on the bootstrap iteration and for small samples.
pub const VISION_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Default)]
pub struct ObserveReport {
    pub judgments: Vec<Judgment>,
    pub selected: usize,
    /// Extractions available for judging.
    pub total: usize,
    /// Selected extractions the judge could not answer for.
    pub skipped: usize,
    pub method: String,
    pub used_vision: bool,
}

/// Whether a judged field came out right. Falls back to the overall verdict
/// when the judge gave no per-field answer.
fn field_correct(verdict: &Verdict, field: &str) -> bool {
    verdict
        .field_judgments
        .iter()
        .find(|fj| fj.field_name == field)
        .map(|fj| fj.result)
        .unwrap_or(verdict.result)
        == JudgmentResult::Correct
}

impl Pipeline {
    /// Judge a sample of the extractions made at the task's current iteration.
    pub async fn observe(&self, task: &Task, force_full: bool) -> Result<ObserveReport, PipelineError> {
        let extractions = self.store.extractions_at_iteration(task.id, task.iteration)?;
        let schema = self.store.active_schema(task.id)?;
        let selection = {
            let mut rng = rand::thread_rng();
            self.settings
                .sampler()
                .select(&extractions, task.iteration, force_full, &mut rng)
        };
        let use_vision = task.iteration == 0 && selection.items.len() <= VISION_SAMPLE_LIMIT;
        let mut report = self
            .judge_batch(task, &schema.definition, &selection.items, &selection.method, use_vision)
            .await?;
        report.total = extractions.len();
        Ok(report)
    }

    /// Judge `items` unconditionally, tagging every judgment with `method`.
    pub async fn judge_batch(
        &self,
        task: &Task,
        schema: &SchemaDefinition,
        items: &[&Extraction],
        method: &str,
        use_vision: bool,
    ) -> Result<ObserveReport, PipelineError> {
        let mut documents: HashMap<i64, Document> = HashMap::new();
        for extraction in items {
            if !documents.contains_key(&extraction.document_id) {
                let doc = self.store.document(extraction.document_id)?;
                documents.insert(doc.id, doc);
            }
        }
        let documents = &documents;
        let judge = self.judge(task);
        let judge = &judge;

        let verdicts: Vec<_> = futures::stream::iter(items.iter().copied())
            .map(|extraction| async move {
                let document = documents.get(&extraction.document_id)?;
                let page_image = if use_vision {
                    document.pages.first().and_then(page_image_data_uri)
                } else {
                    None
                };
                let vision = page_image.is_some();
                let fields = extraction.fields_json();
                let text = document.full_text();
                let request = JudgeRequest {
                    schema,
                    fields: &fields,
                    document_text: &text,
                    page_image,
                };
                match judge.judge(&request).await {
                    Ok(verdict) => Some((extraction, verdict.normalized(), vision)),
                    Err(e) => {
                        warn!(
                            document = %document.filename,
                            extraction_id = extraction.id,
                            error = %e,
                            "judge failed, extraction left unjudged"
                        );
                        None
                    }
                }
            })
            .buffered(self.settings.execution.concurrency.max(1))
            .collect()
            .await;

        let mut report = ObserveReport {
            selected: items.len(),
            total: items.len(),
            method: method.to_string(),
            ..Default::default()
        };
        for outcome in verdicts {
            let Some((extraction, verdict, vision)) = outcome else {
                report.skipped += 1;
                continue;
            };
            let judgment = self.store.insert_judgment(extraction.id, &verdict, vision, method)?;
            self.record_pattern_outcomes(extraction, &verdict);
            debug!(
                extraction_id = extraction.id,
                result = %judgment.result,
                score = judgment.score,
                vision,
                "judged extraction"
            );
            report.used_vision |= vision;
            report.judgments.push(judgment);
        }

        let correct = report
            .judgments
            .iter()
            .filter(|j| j.result == JudgmentResult::Correct)
            .count();
        info!(
            task = %task.name,
            iteration = task.iteration,
            judged = report.judgments.len(),
            correct,
            skipped = report.skipped,
            method,
            "observation complete"
        );
        Ok(report)
    }

    /// Count one use per field a shared pattern produced, successful when the
    /// judge found that field correct.
    fn record_pattern_outcomes(&self, extraction: &Extraction, verdict: &Verdict) {
        for (field, trace) in &extraction.metadata.fields {
            let Some(name) = trace.pattern.as_deref() else {
                continue;
            };
            if let Err(e) = self
                .store
                .update_pattern_stats(name, field_correct(verdict, field))
            {
                warn!(pattern = name, error = %e, "could not update pattern stats");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedJudge, pipeline, seed, verdict};
    use anyextract_ai::ScriptedProvider;
    use anyextract_core::{FieldJudgment, ImplementationType};
    use std::sync::Arc;

    const PLAN: &str = r#"{"entry": "extract", "fields": {"title": {"rule": "filename", "key": "title"}}}"#;

    #[tokio::test]
    async fn bootstrap_iteration_judges_everything() {
        let dir = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 0.9));
        let p = pipeline(dir.path(), Arc::new(ScriptedProvider::constant("{}")), judge.clone());
        let (task, docs) = seed(&p, PLAN, &["title"], &[("a.txt", "1"), ("b.txt", "2"), ("c.txt", "3")]);
        p.execute(&task, &docs, None).await.unwrap();

        let report = p.observe(&task, false).await.unwrap();
        assert_eq!(report.judgments.len(), 3);
        assert_eq!(report.total, 3);
        assert_eq!(report.method, "full");
        assert!(report.judgments.iter().all(|j| j.sampling_method == "full"));
        // Text-only pages carry no image, so no vision call is made.
        assert!(!report.used_vision);
        assert_eq!(judge.vision_calls(), vec![false, false, false]);
    }

    #[tokio::test]
    async fn later_iterations_sample() {
        let dir = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedJudge::constant(JudgmentResult::Correct, 0.9));
        let p = pipeline(dir.path(), Arc::new(ScriptedProvider::constant("{}")), judge.clone());
        let docs: Vec<(String, String)> =
            (0..10).map(|i| (format!("doc{i}_a.txt"), format!("body {i}"))).collect();
        let docs: Vec<(&str, &str)> = docs.iter().map(|(f, t)| (f.as_str(), t.as_str())).collect();
        let (task, documents) = seed(&p, PLAN, &["title"], &docs);
        // Extractions are stored at the iteration of the task handed in.
        let mut task = task;
        task.iteration = 5;
        p.execute(&task, &documents, None).await.unwrap();

        let report = p.observe(&task, false).await.unwrap();
        // Every extraction here is confident (filename rule), so only the random budget is judged.
        assert_eq!(report.total, 10);
        assert_eq!(report.judgments.len(), 2);
        assert!(report.method.starts_with("priority+random"));

        let full = p.observe(&task, true).await.unwrap();
        assert_eq!(full.judgments.len(), 10);
    }

    #[tokio::test]
    async fn pattern_stats_follow_field_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedJudge::new(|_| {
            let mut v = verdict(JudgmentResult::Partial, 0.6);
            v.field_judgments = vec![FieldJudgment {
                field_name: "date".into(),
                result: JudgmentResult::Correct,
                score: 1.0,
                reasoning: String::new(),
                expected_value: None,
            }];
            v
        }));
        let p = pipeline(dir.path(), Arc::new(ScriptedProvider::constant("{}")), judge);
        p.store()
            .promote_pattern("iso_date", "report", "ISO dates", r"\d{4}-\d{2}-\d{2}", ImplementationType::Regex)
            .unwrap();
        let plan = r#"{"entry": "extract", "fields": {"date": {"rule": "pattern", "name": "iso_date"}}}"#;
        let (task, docs) = seed(&p, plan, &["date"], &[("a.txt", "Published 2024-03-01")]);
        let batch = p.execute(&task, &docs, None).await.unwrap();
        assert_eq!(batch.extractions[0].fields["date"], "2024-03-01");

        p.observe(&task, false).await.unwrap();
        let pattern = p.store().pattern("iso_date").unwrap();
        assert_eq!(pattern.usage_count, 1);
        assert_eq!(pattern.success_count, 1);
    }

    #[tokio::test]
    async fn judge_errors_skip_only_that_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let judge = Arc::new(
            ScriptedJudge::constant(JudgmentResult::Correct, 0.9)
                .failing_when(|fields| fields["code"] == "beta"),
        );
        let p = pipeline(dir.path(), Arc::new(ScriptedProvider::constant("{}")), judge);
        let plan = r#"{"entry": "extract", "fields": {"code": {"rule": "regex", "pattern": "Code:\\s*(\\w+)"}}}"#;
        let (task, docs) = seed(
            &p,
            plan,
            &["code"],
            &[("a.txt", "Code: alpha"), ("b.txt", "Code: beta"), ("c.txt", "Code: gamma")],
        );
        let batch = p.execute(&task, &docs, None).await.unwrap();
        assert_eq!(batch.extractions[1].fields["code"], "beta");

        let report = p.observe(&task, false).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.judgments.len(), 2);
        let stored = p.store().judgments(task.id).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|j| j.extraction_id != batch.extractions[1].id));
    }
}
