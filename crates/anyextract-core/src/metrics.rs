//! Quality metrics over judgments, and cost-driven model tier assignment.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::judgment::{Judgment, JudgmentResult};

/// Accuracy a smaller model tier must reach on a field before it replaces a larger one.
pub const DOWNGRADE_ACCURACY: f64 = 0.95;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldStats {
    pub correct: usize,
    pub partial: usize,
    pub incorrect: usize,
    pub missing: usize,
    pub total: usize,
    pub avg_score: f64,
    /// `correct / total`.
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub total_judgments: usize,
    pub avg_score: f64,
    pub correct: usize,
    pub partial: usize,
    pub incorrect: usize,
    pub missing: usize,
    pub field_stats: BTreeMap<String, FieldStats>,
}

impl QualityMetrics {
    pub fn from_judgments(judgments: &[Judgment]) -> Self {
        let mut m = QualityMetrics {
            total_judgments: judgments.len(),
            ..Default::default()
        };
        if judgments.is_empty() {
            return m;
        }

        let mut field_scores: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for j in judgments {
            bump(&mut m.correct, &mut m.partial, &mut m.incorrect, &mut m.missing, j.result);
            for fj in &j.field_judgments {
                let stats = m.field_stats.entry(fj.field_name.clone()).or_default();
                stats.total += 1;
                bump(
                    &mut stats.correct,
                    &mut stats.partial,
                    &mut stats.incorrect,
                    &mut stats.missing,
                    fj.result,
                );
                field_scores
                    .entry(fj.field_name.clone())
                    .or_default()
                    .push(fj.score);
            }
        }
        m.avg_score = judgments.iter().map(|j| j.score).sum::<f64>() / judgments.len() as f64;

        for (name, stats) in m.field_stats.iter_mut() {
            if let Some(scores) = field_scores.get(name)
                && !scores.is_empty()
            {
                stats.avg_score = scores.iter().sum::<f64>() / scores.len() as f64;
            }
            if stats.total > 0 {
                stats.accuracy = stats.correct as f64 / stats.total as f64;
            }
        }
        m
    }

    /// Per-field accuracy, for feeding the confidence engine's history signal.
    pub fn field_accuracy(&self) -> BTreeMap<String, f64> {
        self.field_stats
            .iter()
            .map(|(k, s)| (k.clone(), s.accuracy))
            .collect()
    }
}

fn bump(
    correct: &mut usize,
    partial: &mut usize,
    incorrect: &mut usize,
    missing: &mut usize,
    result: JudgmentResult,
) {
    match result {
        JudgmentResult::Correct => *correct += 1,
        JudgmentResult::Partial => *partial += 1,
        JudgmentResult::Incorrect => *incorrect += 1,
        JudgmentResult::Missing => *missing += 1,
    }
}

/// Judged accuracy of each field, split by the model tier that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierAccuracy {
    // field -> model -> (correct, total)
    counts: BTreeMap<String, BTreeMap<String, (usize, usize)>>,
}

impl TierAccuracy {
    pub fn record(&mut self, field: &str, model: &str, correct: bool) {
        let entry = self
            .counts
            .entry(field.to_string())
            .or_default()
            .entry(model.to_string())
            .or_default();
        entry.1 += 1;
        if correct {
            entry.0 += 1;
        }
    }

    pub fn accuracy(&self, field: &str, model: &str) -> Option<f64> {
        let (correct, total) = *self.counts.get(field)?.get(model)?;
        (total > 0).then(|| correct as f64 / total as f64)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// `field -> model -> accuracy`, for prompts and event payloads.
    pub fn to_json(&self) -> serde_json::Value {
        let map: BTreeMap<&str, BTreeMap<&str, f64>> = self
            .counts
            .iter()
            .map(|(field, models)| {
                let accs = models
                    .iter()
                    .filter(|(_, (_, total))| *total > 0)
                    .map(|(m, (c, t))| (m.as_str(), *c as f64 / *t as f64))
                    .collect();
                (field.as_str(), accs)
            })
            .collect();
        serde_json::to_value(map).unwrap_or_default()
    }
}

/// Assign each observed field the smallest tier whose accuracy reaches
/// `threshold`, falling back to the largest. `tiers` is ordered largest first.
pub fn assign_model_tiers(
    accuracy: &TierAccuracy,
    tiers: &[String],
    threshold: f64,
) -> BTreeMap<String, String> {
    let Some(largest) = tiers.first() else {
        return BTreeMap::new();
    };
    accuracy
        .fields()
        .map(|field| {
            let assigned = tiers
                .iter()
                .rev()
                .find(|tier| accuracy.accuracy(field, tier).is_some_and(|a| a >= threshold))
                .unwrap_or(largest);
            (field.to_string(), assigned.clone())
        })
        .collect()
}
