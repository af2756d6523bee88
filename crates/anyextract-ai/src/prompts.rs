//! Prompt templates.
//!
//! Templates are written once in English; the task language selects the
//! answer-language directive appended to each.

use anyextract_core::Language;

pub const ANALYST_SYSTEM: &str = "You are an expert document analyst.";
pub const BUILDER_SYSTEM: &str = "You are an expert at designing data extraction pipelines. \
You write extraction plans as strict JSON.";
pub const SCHEMA_SYSTEM: &str = "You are an expert at designing data extraction schemas.";
pub const REPAIR_SYSTEM: &str = "You fix extraction plans. Output the complete corrected plan as JSON only.";
pub const DIAGNOSE_SYSTEM: &str = "You are an expert at diagnosing data extraction pipeline issues.";
pub const JUDGE_SYSTEM: &str = "You are a strict but fair quality judge for data extraction.";
pub const JUDGE_VISION_SYSTEM: &str = "You are a quality judge with vision. Compare the extraction against the page image.";
pub const WORKER_SYSTEM: &str = "You extract structured data from documents. Answer with JSON only.";

/// Reference for the plan language the builder writes and the executor runs.
pub const PLAN_FORMAT: &str = r#"An extraction plan is a JSON object:
{
  "entry": "extract",
  "description": "what this plan does",
  "fields": {
    "<field_name>": <rule>
  }
}
Rules:
- {"rule": "filename", "key": "broker|title|authors|category|date"}  (zero-cost, parsed from the file name)
- {"rule": "regex", "pattern": "<Rust regex>", "capture": 1}  (searched over all page text; capture defaults to 1, or 0 if the pattern has no groups)
- {"rule": "pattern", "name": "<shared pattern name>"}  (apply a shared pattern from the library)
- {"rule": "llm", "group": "<group name>", "instruction": "<how to find this field>", "max_chars": 6000}
Every rule except "llm" may carry a "fallback" rule used when it yields nothing.
"llm" rules with the same "group" are answered by a single model call; group related fields to save cost.
Prefer filename and regex rules; use llm only for fields that need understanding.
Fields missing from "fields" are extracted as null."#;

pub fn language_directive(language: Language) -> &'static str {
    match language {
        Language::En => "Write all free-text values in English.",
        Language::Zh => "请用中文撰写所有自由文本内容（JSON 键名保持英文）。",
        Language::Bilingual => {
            "Documents may be in English or Chinese (中文). Keep values in the document's own language; \
             JSON keys stay in English."
        }
    }
}

fn finish(language: Language, body: String) -> String {
    format!("{body}\n\n{}", language_directive(language))
}

pub fn analyze_documents(language: Language, num_samples: usize, doc_contents: &str) -> String {
    finish(
        language,
        format!(
            r#"Analyze these sample documents and determine:
1. What type of documents these are
2. The language and structure
3. Key sections and their purposes
4. What fields could be extracted

Document content (from {num_samples} sample documents):
{doc_contents}

Respond in JSON format:
{{
    "document_type": "...",
    "language": "...",
    "structure_description": "...",
    "key_sections": ["..."],
    "suggested_fields": [
        {{"name": "field_name", "type": "string|number|date|list|text|boolean", "description": "...", "required": true, "extraction_hint": "..."}}
    ],
    "complexity": "low|medium|high",
    "notes": ["..."]
}}"#
        ),
    )
}

pub fn propose_schema(
    language: Language,
    task_description: &str,
    analysis: &str,
    shared_patterns: &str,
) -> String {
    finish(
        language,
        format!(
            r#"Based on the document analysis, propose a final extraction schema.

User's task description: {task_description}

Document analysis:
{analysis}

Shared patterns that proved reliable on other tasks (reuse their field names where they fit):
{shared_patterns}

Requirements:
- Include all fields that match the user's extraction goal
- Each field must have a clear type and extraction hint
- Mark fields as required only if they appear in >80% of documents
- Field names should be snake_case

Respond in JSON format:
{{
    "fields": [
        {{"name": "...", "type": "string|number|date|list|text|boolean", "description": "...", "required": true, "extraction_hint": "..."}}
    ],
    "description": "Schema description"
}}"#
        ),
    )
}

pub fn generate_workflow(
    language: Language,
    schema: &str,
    sample_content: &str,
    analysis: &str,
) -> String {
    finish(
        language,
        format!(
            r#"Write an extraction plan for these documents.

Schema:
{schema}

Sample document content (for understanding the format):
{sample_content}

Document analysis:
{analysis}

{PLAN_FORMAT}

Output ONLY the plan JSON, no markdown fences."#
        ),
    )
}

pub fn modify_workflow(
    language: Language,
    current_plan: &str,
    diagnosis: &str,
    schema: &str,
    sample_failures: &str,
    corner_cases: &str,
) -> String {
    finish(
        language,
        format!(
            r#"Modify the existing extraction plan to fix the diagnosed issues.

Current plan:
{current_plan}

Diagnosis:
{diagnosis}

Schema:
{schema}

Sample failures:
{sample_failures}

Corner cases to handle:
{corner_cases}

{PLAN_FORMAT}

Output the COMPLETE updated plan. Keep "entry": "extract".
Address the diagnosed issues while preserving rules that work.
Output ONLY the plan JSON, no markdown fences."#
        ),
    )
}

/// Follow-up turn after the builder produced an invalid artifact.
pub fn repair(error: &str) -> String {
    format!(
        "The plan is invalid: {error}\nFix it and output the COMPLETE plan. JSON only, no markdown."
    )
}

pub fn diagnose(
    language: Language,
    failed_extractions: &str,
    judgments: &str,
    schema: &str,
    workflow_source: &str,
) -> String {
    finish(
        language,
        format!(
            r#"Analyze the observer judgments to diagnose extraction issues.

Failed/partial extractions:
{failed_extractions}

Observer judgments:
{judgments}

Current schema:
{schema}

Current extraction plan:
{workflow_source}

Determine:
1. Is this a systemic issue (>10% of docs affected) or corner cases?
2. Which fields are most affected?
3. What is the root cause?
4. How should it be fixed?

Respond in JSON:
{{
    "issue_type": "systemic|corner_case",
    "affected_fields": ["..."],
    "affected_percentage": 0.0,
    "description": "...",
    "suggested_fix": "...",
    "evidence": ["..."]
}}"#
        ),
    )
}

const VERDICT_FORMAT: &str = r#"Respond in JSON:
{
    "result": "correct|partial|incorrect",
    "score": 0.0,
    "field_judgments": [
        {"field_name": "...", "result": "correct|partial|incorrect|missing", "score": 0.0, "reasoning": "...", "expected_value": null}
    ],
    "reasoning": "Overall assessment"
}
Scores range from 0.0 to 1.0."#;

pub fn judge(language: Language, document_content: &str, schema: &str, extraction: &str) -> String {
    finish(
        language,
        format!(
            r#"Evaluate these data extraction results.

Original document content:
{document_content}

Extraction schema:
{schema}

Extraction result:
{extraction}

For each field, evaluate:
1. Is the extracted value correct? (correct/partial/incorrect/missing)
2. Score from 0.0 to 1.0
3. Brief reasoning, and the expected value when it is wrong

{VERDICT_FORMAT}"#
        ),
    )
}

pub fn judge_vision(language: Language, schema: &str, extraction: &str) -> String {
    finish(
        language,
        format!(
            r#"Compare the extraction result against the attached page image.

Extraction result:
{extraction}

Schema:
{schema}

Verify each extracted field against what you see on the page.

{VERDICT_FORMAT}"#
        ),
    )
}

pub fn extract_fields(language: Language, fields_description: &str, document_content: &str) -> String {
    finish(
        language,
        format!(
            r#"Extract the following fields from this document content.

Fields to extract:
{fields_description}

Document content:
{document_content}

Respond in JSON format with field names as keys.
For fields you cannot find, use null.
For list-type fields, return a JSON array.
Also include "_confidence": an object mapping each field name to your confidence from 0.0 to 1.0."#
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_follows_language() {
        let en = judge(Language::En, "doc", "{}", "{}");
        let zh = judge(Language::Zh, "doc", "{}", "{}");
        assert!(en.ends_with(language_directive(Language::En)));
        assert!(zh.contains("中文"));
    }

    #[test]
    fn generation_prompts_embed_plan_format() {
        let p = generate_workflow(Language::En, "{}", "text", "{}");
        assert!(p.contains("\"entry\": \"extract\""));
        let m = modify_workflow(Language::Bilingual, "{}", "{}", "{}", "[]", "[]");
        assert!(m.contains("fallback"));
    }

    #[test]
    fn literal_braces_survive_formatting() {
        let p = diagnose(Language::En, "[]", "[]", "{}", "plan");
        assert!(p.contains("\"issue_type\": \"systemic|corner_case\""));
    }
}
