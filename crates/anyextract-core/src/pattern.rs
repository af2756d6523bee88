//! Shared extraction patterns promoted across tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

labelled_enum! {
    pub enum ImplementationType {
        Code => "code",
        Regex => "regex",
        Prompt => "prompt",
    }
}

/// Confidence given to a newly promoted pattern before it has any usage.
pub const INITIAL_PATTERN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedPattern {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub description: String,
    pub implementation: String,
    pub implementation_type: ImplementationType,
    /// `success_count / usage_count`, or the initial confidence before first use.
    pub confidence: f64,
    pub usage_count: i64,
    pub success_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
