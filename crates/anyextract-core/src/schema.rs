//! Extraction schemas: the field list a workflow must fill.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema has no fields")]
    Empty,
    #[error("schema field at position {0} has a blank name")]
    BlankName(usize),
    #[error("duplicate schema field: {0}")]
    DuplicateField(String),
    #[error("invalid schema JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_field_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<serde_json::Value>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: false,
            description: String::new(),
            extraction_hint: None,
            examples: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

impl SchemaDefinition {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    /// Parse and validate a schema from JSON text.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let schema: SchemaDefinition = serde_json::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Field names must be non-blank and unique, and there must be at least one.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = HashSet::new();
        for (idx, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(SchemaError::BlankName(idx));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Field-level changes needed to go from `self` to `newer`.
    pub fn diff(&self, newer: &SchemaDefinition) -> SchemaDiff {
        let old: BTreeMap<&str, &SchemaField> =
            self.fields.iter().map(|f| (f.name.as_str(), f)).collect();
        let new: BTreeMap<&str, &SchemaField> =
            newer.fields.iter().map(|f| (f.name.as_str(), f)).collect();

        let added = new
            .keys()
            .filter(|k| !old.contains_key(*k))
            .map(|k| k.to_string())
            .collect();
        let removed = old
            .keys()
            .filter(|k| !new.contains_key(*k))
            .map(|k| k.to_string())
            .collect();
        let modified = old
            .iter()
            .filter_map(|(name, before)| {
                let after = new.get(name)?;
                (before != after).then(|| FieldChange {
                    name: name.to_string(),
                    before: (*before).clone(),
                    after: (*after).clone(),
                })
            })
            .collect();

        SchemaDiff {
            added,
            removed,
            modified,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub name: String,
    pub before: SchemaField,
    pub after: SchemaField,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<FieldChange>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(json: &str) -> SchemaDefinition {
        SchemaDefinition::from_json(json).unwrap()
    }

    #[test]
    fn parses_model_style_fields() {
        let s = schema(
            r#"{"fields": [
                {"name": "title", "type": "string", "required": true, "description": "Report title"},
                {"name": "rating", "extraction_hint": "Look for BUY/HOLD/SELL"}
            ]}"#,
        );
        assert_eq!(s.field_names(), vec!["title", "rating"]);
        assert_eq!(s.field("rating").unwrap().field_type, "string");
        assert!(s.field("title").unwrap().required);
    }

    #[test]
    fn rejects_duplicates_and_empty() {
        assert!(matches!(
            SchemaDefinition::from_json(r#"{"fields": []}"#),
            Err(SchemaError::Empty)
        ));
        assert!(matches!(
            SchemaDefinition::from_json(r#"{"fields": [{"name": "a"}, {"name": "a"}]}"#),
            Err(SchemaError::DuplicateField(name)) if name == "a"
        ));
        assert!(matches!(
            SchemaDefinition::from_json(r#"{"fields": [{"name": " "}]}"#),
            Err(SchemaError::BlankName(0))
        ));
    }

    #[test]
    fn diff_reports_added_removed_modified() {
        let v1 = schema(r#"{"fields": [{"name": "title"}, {"name": "date"}, {"name": "broker"}]}"#);
        let v2 = schema(
            r#"{"fields": [{"name": "title"}, {"name": "date", "type": "date"}, {"name": "rating"}]}"#,
        );
        let diff = v1.diff(&v2);
        assert_eq!(diff.added, vec!["rating"]);
        assert_eq!(diff.removed, vec!["broker"]);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].name, "date");
        assert_eq!(diff.modified[0].after.field_type, "date");
        assert!(v1.diff(&v1).is_empty());
    }
}
