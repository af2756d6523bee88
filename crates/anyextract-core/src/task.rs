//! Tasks and the documents they own.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

labelled_enum! {
    /// Lifecycle of a task. Only the trigger and evolution paths move a task
    /// between `Running` and `Evolving`; terminal states are set externally.
    pub enum TaskStatus {
        Bootstrapping => "bootstrapping",
        Running => "running",
        Evolving => "evolving",
        Completed => "completed",
        Failed => "failed",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Allowed lifecycle edges. Terminal states are reachable from any live state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (*self, next) {
            (Bootstrapping, Running) | (Running, Evolving) | (Evolving, Running) => true,
            (from, Completed | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

labelled_enum! {
    /// Language used for prompts and model-facing instructions.
    pub enum Language {
        En => "en",
        Zh => "zh",
        Bilingual => "bilingual",
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::Bilingual
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub iteration: i64,
    pub max_iteration: i64,
    pub language: Language,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One parsed page of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub page_number: u32,
    pub text: String,
    /// Rendered page image on disk, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Page {
    pub fn new(page_number: u32, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
            image: None,
        }
    }
}

/// A source document as handed over by a document source, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub file_hash: String,
    pub filename: String,
    pub source_path: String,
    pub pages: Vec<Page>,
    pub parse_method: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub task_id: i64,
    pub file_hash: String,
    pub filename: String,
    pub source_path: String,
    pub pages: Vec<Page>,
    pub page_count: i64,
    pub parse_method: String,
    pub is_sample: bool,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// All page text joined with blank lines, in page order.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Page text prefixed with page markers, truncated to `max_chars` characters.
    pub fn content_for_prompt(&self, max_chars: usize) -> String {
        let mut out = String::new();
        for page in &self.pages {
            out.push_str(&format!("--- Page {} ---\n{}\n\n", page.page_number, page.text));
        }
        truncate_chars(&out, max_chars)
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_parse_back() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Evolving.is_terminal());
    }

    #[test]
    fn lifecycle_edges() {
        assert!(TaskStatus::Bootstrapping.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Evolving));
        assert!(TaskStatus::Evolving.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Bootstrapping.can_transition_to(TaskStatus::Evolving));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("研究报告", 2), "研究");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn prompt_content_marks_pages() {
        let doc = Document {
            id: 1,
            task_id: 1,
            file_hash: "h".into(),
            filename: "a.txt".into(),
            source_path: "/tmp/a.txt".into(),
            pages: vec![
                Page::new(1, "first"),
                Page::new(2, "second"),
            ],
            page_count: 2,
            parse_method: "text".into(),
            is_sample: true,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        let content = doc.content_for_prompt(10_000);
        assert!(content.contains("--- Page 2 ---\nsecond"));
        assert_eq!(doc.full_text(), "first\n\nsecond");
    }
}
