//! Per-field confidence scoring from weighted evidence signals.
//!
//! A field's score is a weighted sum of five components, clamped to `[0, 1]`:
//!
//! | component            | value                                   |
//! |----------------------|-----------------------------------------|
//! | `llm_self_confidence`| confidence reported by the artifact     |
//! | `method_prior`       | prior for the extraction method used    |
//! | `historical_accuracy`| past judged accuracy, `0.5` if unknown  |
//! | `source_clarity`     | `0.8` if the value occurs in the source, else `0.2` |
//! | `corner_case_match`  | `0.3` if a known corner case matched, else `0.7` |
//!
//! A null or absent value always scores exactly [`NULL_VALUE_CONFIDENCE`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::judgment::Judgment;
use crate::schema::SchemaDefinition;

pub const NULL_VALUE_CONFIDENCE: f64 = 0.1;
const UNKNOWN_HISTORY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub llm_self_confidence: f64,
    pub method_prior: f64,
    pub historical_accuracy: f64,
    pub source_clarity: f64,
    pub corner_case_match: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            llm_self_confidence: 0.30,
            method_prior: 0.15,
            historical_accuracy: 0.25,
            source_clarity: 0.20,
            corner_case_match: 0.10,
        }
    }
}

/// Prior confidence for each extraction method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodPriors {
    pub regex: f64,
    pub filename: f64,
    pub pattern: f64,
    pub component: f64,
    pub llm: f64,
    /// Used for methods not listed above.
    pub unknown: f64,
}

impl Default for MethodPriors {
    fn default() -> Self {
        Self {
            regex: 0.9,
            filename: 0.85,
            pattern: 0.85,
            component: 0.7,
            llm: 0.6,
            unknown: 0.7,
        }
    }
}

impl MethodPriors {
    pub fn for_method(&self, method: &str) -> f64 {
        match method {
            "regex" => self.regex,
            "filename" => self.filename,
            "pattern" => self.pattern,
            "component" => self.component,
            "llm" => self.llm,
            _ => self.unknown,
        }
    }
}

/// Evidence gathered for one field of one extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldEvidence {
    pub llm_confidence: f64,
    pub method_prior: f64,
    pub historical_accuracy: Option<f64>,
    pub source_present: bool,
    pub corner_case_matched: bool,
}

impl Default for FieldEvidence {
    fn default() -> Self {
        Self {
            llm_confidence: 0.5,
            method_prior: 0.7,
            historical_accuracy: None,
            source_present: true,
            corner_case_matched: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceReport {
    pub per_field: BTreeMap<String, f64>,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceEngine {
    pub weights: ConfidenceWeights,
    pub priors: MethodPriors,
}

impl ConfidenceEngine {
    pub fn new(weights: ConfidenceWeights, priors: MethodPriors) -> Self {
        Self { weights, priors }
    }

    /// Score a single field value.
    pub fn score_field(&self, value: Option<&serde_json::Value>, evidence: &FieldEvidence) -> f64 {
        if value.is_none_or(|v| v.is_null()) {
            return NULL_VALUE_CONFIDENCE;
        }
        let w = &self.weights;
        let total = w.llm_self_confidence * evidence.llm_confidence
            + w.method_prior * evidence.method_prior
            + w.historical_accuracy * evidence.historical_accuracy.unwrap_or(UNKNOWN_HISTORY)
            + w.source_clarity * if evidence.source_present { 0.8 } else { 0.2 }
            + w.corner_case_match * if evidence.corner_case_matched { 0.3 } else { 0.7 };
        if total.is_nan() {
            return 0.0;
        }
        total.clamp(0.0, 1.0)
    }

    /// Score every schema field of an extraction. The aggregate is the
    /// unweighted mean of the field scores, or `0.0` for an empty schema.
    pub fn score_extraction<F>(
        &self,
        fields: &BTreeMap<String, serde_json::Value>,
        schema: &SchemaDefinition,
        mut evidence: F,
    ) -> ConfidenceReport
    where
        F: FnMut(&str, Option<&serde_json::Value>) -> FieldEvidence,
    {
        let mut per_field = BTreeMap::new();
        for field in &schema.fields {
            let value = fields.get(&field.name);
            let ev = evidence(&field.name, value);
            per_field.insert(field.name.clone(), self.score_field(value, &ev));
        }
        let aggregate = if per_field.is_empty() {
            0.0
        } else {
            per_field.values().sum::<f64>() / per_field.len() as f64
        };
        ConfidenceReport {
            per_field,
            aggregate,
        }
    }
}

/// Hook for learning weights from judgments. Currently returns `current`
/// unchanged.
pub fn calibrate_weights(_judgments: &[Judgment], current: &ConfidenceWeights) -> ConfidenceWeights {
    *current
}
