#[allow(warnings)]
mod bindings;

use std::collections::BTreeMap;

use bindings::Guest;
use bindings::anyextract::extractor::{audit_log, inference};
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Fills schema fields from filename metadata where the names match and asks
/// the host model for the rest in a single call.
struct FieldExtractor;

const FILENAME_CONFIDENCE: f64 = 0.95;
const DEFAULT_LLM_CONFIDENCE: f64 = 0.5;
const MAX_TEXT_CHARS: usize = 6000;

const SYSTEM_PROMPT: &str = "\
You extract structured fields from documents.
Respond ONLY with a JSON object mapping each requested field name to its value (null when absent).
You may add \"_confidence\": {field: number between 0 and 1}.";

// ── Context ──

#[derive(Deserialize)]
struct Context {
    document: DocumentInput,
    schema: Schema,
}

#[derive(Deserialize)]
struct DocumentInput {
    filename: String,
    #[serde(default)]
    pages: Vec<PageInput>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct PageInput {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Schema {
    fields: Vec<FieldSpec>,
}

#[derive(Deserialize)]
struct FieldSpec {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default)]
    description: String,
}

fn audit(event_type: &str, detail: String) {
    audit_log::record_event(&audit_log::AuditEntry {
        event_type: event_type.to_string(),
        resource: "field-extractor".to_string(),
        detail,
    });
}

fn user_prompt(doc: &DocumentInput, fields: &[&FieldSpec]) -> String {
    let wanted: Vec<String> = fields
        .iter()
        .map(|f| {
            if f.description.is_empty() {
                format!("- {} ({})", f.name, f.field_type)
            } else {
                format!("- {} ({}): {}", f.name, f.field_type, f.description)
            }
        })
        .collect();
    let text: String = doc
        .pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .chars()
        .take(MAX_TEXT_CHARS)
        .collect();
    format!(
        "Document: {}\n\nFields:\n{}\n\nText:\n{}",
        doc.filename,
        wanted.join("\n"),
        text
    )
}

impl Guest for FieldExtractor {
    fn extract(context: String) -> Result<String, String> {
        let ctx: Context =
            serde_json::from_str(&context).map_err(|e| format!("invalid context: {e}"))?;
        audit(
            "extract-started",
            format!("{} ({} fields)", ctx.document.filename, ctx.schema.fields.len()),
        );

        let mut fields = Map::new();
        let mut confidence = Map::new();
        let mut methods = Map::new();
        let mut remaining = Vec::new();

        for spec in &ctx.schema.fields {
            match ctx.document.metadata.get(&spec.name) {
                Some(value) if !value.is_empty() => {
                    fields.insert(spec.name.clone(), json!(value));
                    confidence.insert(spec.name.clone(), json!(FILENAME_CONFIDENCE));
                    methods.insert(spec.name.clone(), json!("filename"));
                }
                _ => remaining.push(spec),
            }
        }

        if !remaining.is_empty() {
            let request = inference::GenerateRequest {
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                user_prompt: user_prompt(&ctx.document, &remaining),
                max_tokens: 1024,
                temperature: 0.0,
                field: None,
                json: true,
            };
            let response = inference::generate(&request)
                .map_err(|e| format!("inference failed: {} (code {})", e.message, e.code))?;
            audit(
                "inference-complete",
                format!("model={} tokens_used={}", response.model, response.tokens_used),
            );

            let answer: Value = serde_json::from_str(&response.text)
                .map_err(|e| format!("model answer is not JSON: {e}"))?;
            let scores = answer.get("_confidence").cloned().unwrap_or(Value::Null);
            for spec in remaining {
                let value = answer.get(&spec.name).cloned().unwrap_or(Value::Null);
                let score = scores
                    .get(&spec.name)
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_LLM_CONFIDENCE);
                fields.insert(spec.name.clone(), value);
                confidence.insert(spec.name.clone(), json!(score));
                methods.insert(spec.name.clone(), json!("llm"));
            }
        }

        let output = json!({
            "fields": fields,
            "field_confidence": confidence,
            "methods": methods,
        });
        Ok(output.to_string())
    }
}

bindings::export!(FieldExtractor with_types_in bindings);
