//! Decides when a running task should re-enter evolution.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::judgment::{Judgment, JudgmentResult};
use crate::task::{Task, TaskStatus};

labelled_enum! {
    pub enum TriggerReason {
        MaxIterationsReached => "max_iterations_reached",
        AlreadyEvolving => "already_evolving",
        InsufficientJudgments => "insufficient_judgments",
        QualityOk => "quality_ok",
        QualityDrop => "quality_drop",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetrics {
    pub avg_score: f64,
    pub incorrect_rate: f64,
    pub correct: usize,
    pub partial: usize,
    pub incorrect: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub fire: bool,
    pub reason: TriggerReason,
    /// Number of judgments considered.
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TriggerMetrics>,
}

impl TriggerDecision {
    fn hold(reason: TriggerReason, count: usize) -> Self {
        Self {
            fire: false,
            reason,
            count,
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionTrigger {
    /// Average judge score below this fires.
    pub quality_threshold: f64,
    /// Fraction of `incorrect` verdicts above this fires.
    pub incorrect_threshold: f64,
    pub min_judgments: usize,
}

impl Default for EvolutionTrigger {
    fn default() -> Self {
        Self {
            quality_threshold: 0.75,
            incorrect_threshold: 0.10,
            min_judgments: 3,
        }
    }
}

impl EvolutionTrigger {
    pub fn evaluate(&self, task: &Task, judgments: &[Judgment]) -> TriggerDecision {
        let count = judgments.len();
        if task.iteration >= task.max_iteration {
            info!(task = %task.name, max_iteration = task.max_iteration, "max iterations reached, no evolution");
            return TriggerDecision::hold(TriggerReason::MaxIterationsReached, count);
        }
        if task.status == TaskStatus::Evolving {
            info!(task = %task.name, "task already evolving, skipping trigger");
            return TriggerDecision::hold(TriggerReason::AlreadyEvolving, count);
        }
        if count < self.min_judgments {
            info!(task = %task.name, count, "too few judgments to evaluate trigger");
            return TriggerDecision::hold(TriggerReason::InsufficientJudgments, count);
        }

        let avg_score = judgments.iter().map(|j| j.score).sum::<f64>() / count as f64;
        let tally = |r: JudgmentResult| judgments.iter().filter(|j| j.result == r).count();
        let incorrect = tally(JudgmentResult::Incorrect);
        let metrics = TriggerMetrics {
            avg_score,
            incorrect_rate: incorrect as f64 / count as f64,
            correct: tally(JudgmentResult::Correct),
            partial: tally(JudgmentResult::Partial),
            incorrect,
            total: count,
        };

        let fire =
            metrics.avg_score < self.quality_threshold || metrics.incorrect_rate > self.incorrect_threshold;
        let reason = if fire {
            TriggerReason::QualityDrop
        } else {
            TriggerReason::QualityOk
        };
        info!(
            task = %task.name,
            avg_score = metrics.avg_score,
            incorrect_rate = metrics.incorrect_rate,
            fire,
            "evaluated evolution trigger"
        );
        TriggerDecision {
            fire,
            reason,
            count,
            metrics: Some(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Language;
    use chrono::Utc;

    fn task(status: TaskStatus, iteration: i64) -> Task {
        Task {
            id: 1,
            name: "reports".into(),
            description: String::new(),
            status,
            iteration,
            max_iteration: 20,
            language: Language::En,
            config: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn judgment(result: JudgmentResult, score: f64) -> Judgment {
        Judgment {
            id: 0,
            extraction_id: 0,
            result,
            score,
            field_judgments: Vec::new(),
            reasoning: String::new(),
            used_vision: false,
            sampling_method: "full".into(),
            created_at: Utc::now(),
        }
    }

    fn correct(n: usize, score: f64) -> Vec<Judgment> {
        (0..n).map(|_| judgment(JudgmentResult::Correct, score)).collect()
    }

    #[test]
    fn holds_at_max_iteration() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 20), &correct(5, 0.0));
        assert!(!d.fire);
        assert_eq!(d.reason, TriggerReason::MaxIterationsReached);
    }

    #[test]
    fn holds_while_evolving() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Evolving, 2), &correct(5, 0.0));
        assert!(!d.fire);
        assert_eq!(d.reason, TriggerReason::AlreadyEvolving);
    }

    #[test]
    fn holds_with_two_terrible_judgments() {
        let js = vec![
            judgment(JudgmentResult::Incorrect, 0.0),
            judgment(JudgmentResult::Incorrect, 0.0),
        ];
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 1), &js);
        assert!(!d.fire);
        assert_eq!(d.reason, TriggerReason::InsufficientJudgments);
        assert_eq!(d.count, 2);
    }

    #[test]
    fn low_average_fires() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 1), &correct(4, 0.7));
        assert!(d.fire);
        assert_eq!(d.reason, TriggerReason::QualityDrop);
    }

    #[test]
    fn ten_good_judgments_hold() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 1), &correct(10, 0.9));
        assert!(!d.fire);
        assert_eq!(d.reason, TriggerReason::QualityOk);
        let m = d.metrics.unwrap();
        assert_eq!(m.total, 10);
        assert_eq!(m.incorrect, 0);
        assert!((m.avg_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn score_at_threshold_holds() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 1), &correct(4, 0.75));
        assert!(!d.fire);
        assert_eq!(d.reason, TriggerReason::QualityOk);
    }

    #[test]
    fn incorrect_rate_fires_despite_high_average() {
        // 1 of 9 incorrect = 11% > 10%, average still 0.9.
        let mut js = correct(8, 1.0);
        js.push(judgment(JudgmentResult::Incorrect, 0.2));
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 3), &js);
        assert!(d.fire);
        let m = d.metrics.unwrap();
        assert_eq!(m.incorrect, 1);
        assert!(m.avg_score > 0.75);
    }

    #[test]
    fn incorrect_rate_at_threshold_holds() {
        // 1 of 10 = exactly 10%.
        let mut js = correct(9, 1.0);
        js.push(judgment(JudgmentResult::Incorrect, 0.5));
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 3), &js);
        assert!(!d.fire);
    }

    #[test]
    fn decision_serialises_for_event_log() {
        let d = EvolutionTrigger::default().evaluate(&task(TaskStatus::Running, 1), &correct(3, 0.1));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["reason"], "quality_drop");
        assert_eq!(json["metrics"]["total"], 3);
    }
}
