//! Evolution audit events, failure diagnoses and corner cases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

labelled_enum! {
    pub enum EventType {
        Bootstrap => "bootstrap",
        SchemaUpdate => "schema_update",
        WorkflowUpdate => "workflow_update",
        ModelDowngrade => "model_downgrade",
        CornerCaseAdded => "corner_case_added",
        PatternPromoted => "pattern_promoted",
        EvolutionTriggered => "evolution_triggered",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub iteration: i64,
    pub trigger: serde_json::Value,
    pub mutation: serde_json::Value,
    pub outcome: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, iteration: i64) -> Self {
        Self {
            event_type,
            iteration,
            trigger: serde_json::Value::Null,
            mutation: serde_json::Value::Null,
            outcome: serde_json::Value::Null,
        }
    }

    pub fn trigger(mut self, trigger: serde_json::Value) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn mutation(mut self, mutation: serde_json::Value) -> Self {
        self.mutation = mutation;
        self
    }

    pub fn outcome(mut self, outcome: serde_json::Value) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Write-once audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub id: i64,
    pub task_id: i64,
    pub event_type: EventType,
    pub iteration: i64,
    pub trigger: serde_json::Value,
    pub mutation: serde_json::Value,
    pub outcome: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

labelled_enum! {
    pub enum IssueType {
        Systemic => "systemic",
        CornerCase => "corner_case",
    }
}

fn systemic() -> IssueType {
    IssueType::Systemic
}

/// Builder-model classification of a batch of failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default = "systemic")]
    pub issue_type: IssueType,
    #[serde(default)]
    pub affected_fields: Vec<String>,
    #[serde(default)]
    pub affected_percentage: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
    #[serde(default)]
    pub evidence: Vec<serde_json::Value>,
}

labelled_enum! {
    pub enum ResolutionType {
        Prompt => "prompt",
        Code => "code",
        Regex => "regex",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCornerCase {
    pub field_name: String,
    pub description: String,
    pub pattern: Option<String>,
    pub resolution: String,
    pub resolution_type: ResolutionType,
}

impl NewCornerCase {
    /// One corner case per affected field, carrying the diagnosis text and fix.
    pub fn from_diagnosis(diagnosis: &Diagnosis) -> Vec<NewCornerCase> {
        diagnosis
            .affected_fields
            .iter()
            .map(|field| NewCornerCase {
                field_name: field.clone(),
                description: diagnosis.description.clone(),
                pattern: None,
                resolution: diagnosis.suggested_fix.clone(),
                resolution_type: ResolutionType::Prompt,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CornerCase {
    pub id: i64,
    pub task_id: i64,
    pub field_name: String,
    pub description: String,
    pub pattern: Option<String>,
    pub resolution: String,
    pub resolution_type: ResolutionType,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_cases_follow_affected_fields() {
        let diagnosis: Diagnosis = serde_json::from_str(
            r#"{
                "issue_type": "corner_case",
                "affected_fields": ["date", "rating"],
                "affected_percentage": 0.2,
                "description": "Dates written as 2024年3月",
                "suggested_fix": "Normalise CJK date markers"
            }"#,
        )
        .unwrap();
        assert_eq!(diagnosis.issue_type, IssueType::CornerCase);
        let cases = NewCornerCase::from_diagnosis(&diagnosis);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].field_name, "rating");
        assert_eq!(cases[0].resolution, "Normalise CJK date markers");
    }

    #[test]
    fn diagnosis_defaults_to_systemic() {
        let d: Diagnosis = serde_json::from_str(r#"{"description": "?"}"#).unwrap();
        assert_eq!(d.issue_type, IssueType::Systemic);
        assert!(d.affected_fields.is_empty());
    }
}
