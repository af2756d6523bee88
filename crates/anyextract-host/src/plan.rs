//! Extraction plans: the JSON artifact the builder model writes.
//!
//! A plan maps each schema field to a rule. Deterministic rules (`filename`,
//! `regex`, `pattern`) run first; `llm` rules are batched so every group
//! costs one model call. A rule that finds nothing tries its `fallback`.

use std::collections::{BTreeMap, HashMap};

use anyextract_ai::{
    ArtifactValidator, ChatMessage, ChatRequest, chat_json, is_parse_error, prompts,
};
use anyextract_core::{FieldTrace, ImplementationType};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ArtifactError;
use crate::strategy::{ExtractionContext, ExtractionStrategy, StrategyOutput, is_present};

pub const ENTRY_POINT: &str = "extract";
/// Document characters shown to an `llm` rule unless it sets `max_chars`.
pub const DEFAULT_LLM_CHARS: usize = 6000;
/// Self-confidence reported for values produced by a deterministic rule.
pub const RULE_MATCH_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub entry: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    Filename {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Box<Rule>>,
    },
    Regex {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capture: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Box<Rule>>,
    },
    Pattern {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Box<Rule>>,
    },
    Llm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chars: Option<usize>,
    },
}

impl Rule {
    fn fallback(&self) -> Option<&Rule> {
        match self {
            Rule::Filename { fallback, .. }
            | Rule::Regex { fallback, .. }
            | Rule::Pattern { fallback, .. } => fallback.as_deref(),
            Rule::Llm { .. } => None,
        }
    }

    /// This rule followed by its fallback chain.
    fn chain(&self) -> impl Iterator<Item = &Rule> {
        std::iter::successors(Some(self), |r| r.fallback())
    }
}

impl Plan {
    pub fn parse(source: &str) -> Result<Plan, ArtifactError> {
        let plan: Plan =
            serde_json::from_str(source).map_err(|e| ArtifactError::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Entry point present, every regex compiles, no zero-width LLM budgets.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.entry != ENTRY_POINT {
            return Err(ArtifactError::InvalidPlan(format!(
                "entry must be {ENTRY_POINT:?}, got {:?}",
                self.entry
            )));
        }
        for (field, rule) in &self.fields {
            for step in rule.chain() {
                match step {
                    Rule::Regex { pattern, .. } => {
                        Regex::new(pattern).map_err(|e| {
                            ArtifactError::InvalidPlan(format!("field {field}: bad regex: {e}"))
                        })?;
                    }
                    Rule::Llm {
                        max_chars: Some(0), ..
                    } => {
                        return Err(ArtifactError::InvalidPlan(format!(
                            "field {field}: max_chars must be positive"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Validates builder output as a plan before it is committed.
pub struct PlanValidator;

impl ArtifactValidator for PlanValidator {
    fn validate(&self, source: &str) -> Result<(), String> {
        Plan::parse(source).map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Match `re` against `text` and return the chosen group, trimmed.
///
/// Without an explicit `capture`, group 1 is used when the pattern has one,
/// otherwise the whole match.
pub fn capture_text(re: &Regex, capture: Option<usize>, text: &str) -> Option<String> {
    let group = capture.unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });
    let caps = re.captures(text)?;
    let value = caps.get(group)?.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

struct Ask {
    group: String,
    instruction: Option<String>,
    max_chars: usize,
    pattern: Option<String>,
}

enum Resolved {
    Value(Value, FieldTrace),
    Ask(Ask),
    Missing,
}

fn trace(method: &str, pattern: Option<&str>) -> FieldTrace {
    FieldTrace {
        method: method.to_string(),
        model: None,
        pattern: pattern.map(str::to_string),
    }
}

/// A parsed plan with its regexes compiled, ready to run.
pub struct PlanStrategy {
    plan: Plan,
    regexes: HashMap<String, Regex>,
}

impl PlanStrategy {
    pub fn new(plan: Plan) -> Result<Self, ArtifactError> {
        plan.validate()?;
        let mut regexes = HashMap::new();
        for rule in plan.fields.values() {
            for step in rule.chain() {
                if let Rule::Regex { pattern, .. } = step
                    && !regexes.contains_key(pattern)
                {
                    let re = Regex::new(pattern).map_err(|e| ArtifactError::InvalidPlan(e.to_string()))?;
                    regexes.insert(pattern.clone(), re);
                }
            }
        }
        Ok(Self { plan, regexes })
    }

    pub fn from_source(source: &str) -> Result<Self, ArtifactError> {
        Self::new(Plan::parse(source)?)
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    fn resolve(&self, field: &str, rule: &Rule, ctx: &ExtractionContext<'_>, text: &str) -> Resolved {
        for step in rule.chain() {
            let found = match step {
                Rule::Filename { key, .. } => ctx
                    .document
                    .metadata
                    .get(key)
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| Resolved::Value(Value::String(v.clone()), trace("filename", None))),
                Rule::Regex { pattern, capture, .. } => self
                    .regexes
                    .get(pattern)
                    .and_then(|re| capture_text(re, *capture, text))
                    .map(|v| Resolved::Value(Value::String(v), trace("regex", None))),
                Rule::Pattern { name, .. } => self.apply_pattern(field, name, ctx, text),
                Rule::Llm {
                    group,
                    instruction,
                    max_chars,
                } => Some(Resolved::Ask(Ask {
                    group: group.clone().unwrap_or_else(|| field.to_string()),
                    instruction: instruction.clone(),
                    max_chars: max_chars.unwrap_or(DEFAULT_LLM_CHARS),
                    pattern: None,
                })),
            };
            if let Some(found) = found {
                return found;
            }
        }
        Resolved::Missing
    }

    fn apply_pattern(
        &self,
        field: &str,
        name: &str,
        ctx: &ExtractionContext<'_>,
        text: &str,
    ) -> Option<Resolved> {
        let Some(pattern) = ctx.pattern(name) else {
            debug!(field, pattern = name, "shared pattern not available");
            return None;
        };
        match pattern.implementation_type {
            ImplementationType::Regex => {
                let re = match Regex::new(&pattern.implementation) {
                    Ok(re) => re,
                    Err(e) => {
                        warn!(pattern = name, error = %e, "shared pattern regex does not compile");
                        return None;
                    }
                };
                capture_text(&re, None, text)
                    .map(|v| Resolved::Value(Value::String(v), trace("pattern", Some(name))))
            }
            ImplementationType::Prompt => Some(Resolved::Ask(Ask {
                group: field.to_string(),
                instruction: Some(pattern.implementation.clone()),
                max_chars: DEFAULT_LLM_CHARS,
                pattern: Some(name.to_string()),
            })),
            ImplementationType::Code => {
                debug!(field, pattern = name, "code patterns run only inside components");
                None
            }
        }
    }

    fn describe_field(ctx: &ExtractionContext<'_>, field: &str, ask: &Ask) -> String {
        let mut line = match ctx.schema.field(field) {
            Some(f) => {
                let required = if f.required { ", required" } else { "" };
                let mut line = format!("- {} ({}{required}): {}", f.name, f.field_type, f.description);
                if let Some(hint) = &f.extraction_hint {
                    line.push_str(&format!("\n  Hint: {hint}"));
                }
                line
            }
            None => format!("- {field}"),
        };
        if let Some(instruction) = &ask.instruction {
            line.push_str(&format!("\n  Instruction: {instruction}"));
        }
        for case in ctx.corner_cases_for(field) {
            line.push_str(&format!(
                "\n  Known corner case: {} Resolution: {}",
                case.description, case.resolution
            ));
        }
        line
    }

    async fn ask_group(
        &self,
        ctx: &ExtractionContext<'_>,
        group: &str,
        asks: &[(String, Ask)],
        out: &mut StrategyOutput,
    ) -> Result<(), ArtifactError> {
        let fields: Vec<&str> = asks.iter().map(|(f, _)| f.as_str()).collect();
        let model = ctx.model_for_fields(&fields).to_string();
        let max_chars = asks
            .iter()
            .map(|(_, a)| a.max_chars)
            .max()
            .unwrap_or(DEFAULT_LLM_CHARS);
        let description = asks
            .iter()
            .map(|(f, a)| Self::describe_field(ctx, f, a))
            .collect::<Vec<_>>()
            .join("\n");

        let request = ChatRequest::new(
            &model,
            vec![
                ChatMessage::system(prompts::WORKER_SYSTEM),
                ChatMessage::user(prompts::extract_fields(
                    ctx.language,
                    &description,
                    &ctx.document.content_for_prompt(max_chars),
                )),
            ],
        )
        .temperature(0.1);
        let (parsed, response) = chat_json(ctx.provider.as_ref(), request).await?;
        out.usage.add(&response);
        if is_parse_error(&parsed) {
            warn!(
                document = %ctx.document.filename,
                group,
                "worker answer is not JSON, fields left empty"
            );
        }
        debug!(document = %ctx.document.filename, group, %model, fields = ?fields, "llm group answered");

        let confidences = parsed.get("_confidence");
        for (field, ask) in asks {
            let value = parsed
                .get(field)
                .filter(|v| is_present(v))
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(c) = confidences.and_then(|c| c.get(field)).and_then(Value::as_f64) {
                out.field_confidence.insert(field.clone(), c.clamp(0.0, 1.0));
            }
            out.fields.insert(field.clone(), value);
            out.traces.insert(
                field.clone(),
                FieldTrace {
                    method: if ask.pattern.is_some() { "pattern" } else { "llm" }.to_string(),
                    model: Some(model.clone()),
                    pattern: ask.pattern.clone(),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ExtractionStrategy for PlanStrategy {
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<StrategyOutput, ArtifactError> {
        let text = ctx.document.full_text();
        let mut out = StrategyOutput::default();
        let mut groups: BTreeMap<String, Vec<(String, Ask)>> = BTreeMap::new();

        for field in &ctx.schema.fields {
            let resolved = match self.plan.fields.get(&field.name) {
                Some(rule) => self.resolve(&field.name, rule, ctx, &text),
                None => Resolved::Missing,
            };
            match resolved {
                Resolved::Value(value, trace) => {
                    out.field_confidence
                        .insert(field.name.clone(), RULE_MATCH_CONFIDENCE);
                    out.fields.insert(field.name.clone(), value);
                    out.traces.insert(field.name.clone(), trace);
                }
                Resolved::Ask(ask) => groups
                    .entry(ask.group.clone())
                    .or_default()
                    .push((field.name.clone(), ask)),
                Resolved::Missing => {
                    out.fields.insert(field.name.clone(), Value::Null);
                }
            }
        }

        for (group, asks) in &groups {
            self.ask_group(ctx, group, asks, &mut out).await?;
        }
        Ok(out)
    }
}
