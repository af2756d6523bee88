//! Observer judgments and the human feedback attached to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

labelled_enum! {
    pub enum JudgmentResult {
        Correct => "correct",
        Partial => "partial",
        Incorrect => "incorrect",
        Missing => "missing",
    }
}

impl JudgmentResult {
    /// Results that send an extraction into the diagnosis loop.
    pub fn needs_repair(&self) -> bool {
        matches!(self, JudgmentResult::Incorrect | JudgmentResult::Partial)
    }
}

fn partial() -> JudgmentResult {
    JudgmentResult::Partial
}

fn half() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldJudgment {
    #[serde(alias = "field")]
    pub field_name: String,
    #[serde(default = "partial")]
    pub result: JudgmentResult,
    #[serde(default = "half")]
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<serde_json::Value>,
}

/// What a judge returns for one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(alias = "overall_result", default = "partial")]
    pub result: JudgmentResult,
    #[serde(alias = "overall_score", default = "half")]
    pub score: f64,
    #[serde(default)]
    pub field_judgments: Vec<FieldJudgment>,
    #[serde(default)]
    pub reasoning: String,
}

impl Verdict {
    /// Clamp scores into [0, 1]; judges occasionally answer on other scales.
    pub fn normalized(mut self) -> Self {
        self.score = self.score.clamp(0.0, 1.0);
        for fj in &mut self.field_judgments {
            fj.score = fj.score.clamp(0.0, 1.0);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub id: i64,
    pub extraction_id: i64,
    pub result: JudgmentResult,
    pub score: f64,
    pub field_judgments: Vec<FieldJudgment>,
    pub reasoning: String,
    pub used_vision: bool,
    pub sampling_method: String,
    pub created_at: DateTime<Utc>,
}

labelled_enum! {
    pub enum FeedbackType {
        Approval => "approval",
        Correction => "correction",
        Rejection => "rejection",
        Comment => "comment",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeedback {
    pub judgment_id: i64,
    pub feedback_type: FeedbackType,
    pub field_name: Option<String>,
    pub original_value: Option<serde_json::Value>,
    pub corrected_value: Option<serde_json::Value>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: i64,
    pub judgment_id: i64,
    pub feedback_type: FeedbackType,
    pub field_name: Option<String>,
    pub original_value: Option<serde_json::Value>,
    pub corrected_value: Option<serde_json::Value>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_accepts_judge_shaped_json() {
        let v: Verdict = serde_json::from_str(
            r#"{
                "result": "incorrect",
                "overall_score": 1.4,
                "field_judgments": [
                    {"field_name": "date", "result": "incorrect", "score": 0.0, "reasoning": "wrong year"},
                    {"field": "title", "result": "correct", "score": 1.0}
                ]
            }"#,
        )
        .unwrap();
        let v = v.normalized();
        assert_eq!(v.result, JudgmentResult::Incorrect);
        assert_eq!(v.score, 1.0);
        assert_eq!(v.field_judgments[1].field_name, "title");
    }

    #[test]
    fn missing_keys_default_to_partial() {
        let v: Verdict = serde_json::from_str("{}").unwrap();
        assert_eq!(v.result, JudgmentResult::Partial);
        assert_eq!(v.score, 0.5);
    }

    #[test]
    fn repair_set_is_incorrect_or_partial() {
        assert!(JudgmentResult::Incorrect.needs_repair());
        assert!(JudgmentResult::Partial.needs_repair());
        assert!(!JudgmentResult::Missing.needs_repair());
        assert!(!JudgmentResult::Correct.needs_repair());
    }
}
