//! Terminal rendering for tasks, versions, the evolution log and exported
//! extractions.
//!
//! Record cards render each row of an exported RecordBatch vertically, with
//! JSON columns (`fields`, `field_confidence`) expanded one key per line.

use anyextract_core::{
    EvolutionEvent, QualityMetrics, SchemaDiff, SchemaVersion, SharedPattern, Task,
    WorkflowVersion,
};
use anyextract_host::{BatchReport, CycleOutcome, EvolutionReport, ObserveReport, RunReport};
use anyextract_store::UsageTotals;
use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use serde_json::Value;

const MAX_JSON_ITEMS: usize = 20;
const MAX_VALUE_CHARS: usize = 80;

/// Columns expanded as JSON objects on record cards.
const JSON_COLUMNS: &[&str] = &["fields", "field_confidence"];

// ── Tasks ──

pub fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    println!("{:<24} {:<14} {:>9} {:<10} {}", "TASK", "STATUS", "ITERATION", "LANGUAGE", "UPDATED");
    for task in tasks {
        println!(
            "{:<24} {:<14} {:>4}/{:<4} {:<10} {}",
            task.name,
            task.status,
            task.iteration,
            task.max_iteration,
            task.language,
            task.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

/// Everything `status <task>` shows beyond the task row itself.
pub struct TaskSummary {
    pub documents: usize,
    pub schema: Option<SchemaVersion>,
    pub workflow: Option<WorkflowVersion>,
    pub metrics: QualityMetrics,
    pub usage: UsageTotals,
}

pub fn print_task_card(task: &Task, summary: &TaskSummary) {
    println!("=== {} ===", task.name);
    if !task.description.is_empty() {
        println!("{}", task.description);
    }
    println!();

    println!("Task");
    row("status", task.status);
    row("iteration", format!("{}/{}", task.iteration, task.max_iteration));
    row("language", task.language);
    row("documents", summary.documents);
    row("created", task.created_at.format("%Y-%m-%d %H:%M"));
    println!();

    println!("Versions");
    match &summary.schema {
        Some(s) => row("schema", format!("v{} ({} fields)", s.version, s.definition.fields.len())),
        None => row("schema", "-"),
    }
    match &summary.workflow {
        Some(w) => {
            row("workflow", format!("v{} {} {}", w.version, w.artifact_kind, short_ref(&w.commit_ref)));
            for (field, model) in &w.model_assignments {
                row(&format!("  {field}"), model);
            }
        }
        None => row("workflow", "-"),
    }
    println!();

    let m = &summary.metrics;
    if m.total_judgments > 0 {
        println!("Quality");
        row("judgments", m.total_judgments);
        row("avg score", format!("{:.3}", m.avg_score));
        row(
            "verdicts",
            format!(
                "{} correct, {} partial, {} incorrect, {} missing",
                m.correct, m.partial, m.incorrect, m.missing
            ),
        );
        println!();
        print_field_stats(m);
    }

    println!("Cost");
    row("extractions", summary.usage.extractions);
    row("llm calls", summary.usage.llm_calls);
    row("tokens", summary.usage.tokens_used);
}

fn print_field_stats(metrics: &QualityMetrics) {
    if metrics.field_stats.is_empty() {
        return;
    }
    println!("Fields");
    println!("  {:<26} {:>8} {:>9} {:>6}", "field", "accuracy", "avg score", "n");
    for (name, stats) in &metrics.field_stats {
        println!(
            "  {:<26} {:>8.3} {:>9.3} {:>6}",
            name, stats.accuracy, stats.avg_score, stats.total
        );
    }
    println!();
}

// ── Versions ──

pub fn print_schema_history(versions: &[SchemaVersion]) {
    for v in versions {
        println!(
            "{} v{:<4} {} fields  {}",
            if v.is_active { "*" } else { " " },
            v.version,
            v.definition.fields.len(),
            v.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

pub fn print_workflow_history(versions: &[WorkflowVersion]) {
    for v in versions {
        let tiers = if v.model_assignments.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = v
                .model_assignments
                .iter()
                .map(|(f, m)| format!("{f}={m}"))
                .collect();
            format!("  [{}]", pairs.join(", "))
        };
        println!(
            "{} v{:<4} {:<9} {}  {}  {}{}",
            if v.is_active { "*" } else { " " },
            v.version,
            v.artifact_kind,
            short_ref(&v.commit_ref),
            v.created_at.format("%Y-%m-%d %H:%M"),
            v.artifact_path,
            tiers,
        );
    }
}

pub fn print_schema_diff(from: i64, to: i64, diff: &SchemaDiff) {
    println!("schema v{from} -> v{to}");
    if diff.is_empty() {
        println!("  (no changes)");
        return;
    }
    for name in &diff.added {
        println!("  + {name}");
    }
    for name in &diff.removed {
        println!("  - {name}");
    }
    for change in &diff.modified {
        println!(
            "  ~ {} ({} -> {})",
            change.name, change.before.field_type, change.after.field_type
        );
    }
}

// ── Evolution log ──

pub fn print_events(events: &[EvolutionEvent]) {
    if events.is_empty() {
        println!("No events.");
        return;
    }
    for event in events {
        println!(
            "#{:<5} it {:<3} {:<20} {}",
            event.id,
            event.iteration,
            event.event_type,
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
        for (label, value) in [
            ("trigger", &event.trigger),
            ("mutation", &event.mutation),
            ("outcome", &event.outcome),
        ] {
            if !value.is_null() && value != &Value::Object(Default::default()) {
                println!("    {:<9} {}", label, truncate(&value.to_string(), 120));
            }
        }
    }
}

// ── Pipeline reports ──

pub fn print_batch(batch: &BatchReport) {
    println!(
        "Extracted {} documents: {} completed, {} failed ({} LLM calls, {} tokens)",
        batch.extractions.len(),
        batch.completed,
        batch.failed,
        batch.usage.calls,
        batch.usage.tokens,
    );
}

pub fn print_observation(report: &ObserveReport) {
    let correct = report
        .judgments
        .iter()
        .filter(|j| j.result == anyextract_core::JudgmentResult::Correct)
        .count();
    println!(
        "Judged {} of {} extractions ({}): {} correct{}{}",
        report.judgments.len(),
        report.total,
        report.method,
        correct,
        if report.skipped > 0 {
            format!(", {} skipped", report.skipped)
        } else {
            String::new()
        },
        if report.used_vision { ", with vision" } else { "" },
    );
}

pub fn print_cycle(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::NoFailures => println!("No incorrect or partial extractions; nothing to evolve."),
        CycleOutcome::Evolved(report) => print_evolution(report),
    }
}

fn print_evolution(report: &EvolutionReport) {
    let d = &report.diagnosis;
    println!(
        "Evolved workflow v{} -> v{} ({}), now at iteration {}",
        report.from_version,
        report.to_version,
        short_ref(&report.commit_ref),
        report.iteration,
    );
    row("failures", report.failures);
    row("issue", d.issue_type);
    row("affected fields", d.affected_fields.join(", "));
    row("affected", format!("{:.0}%", d.affected_percentage * 100.0));
    row("description", &d.description);
    row("fix", &d.suggested_fix);
    if report.corner_cases_added > 0 {
        row("corner cases", report.corner_cases_added);
    }
    row("builder calls", format!("{} ({} tokens)", report.usage.calls, report.usage.tokens));
    print_batch(&report.reexecuted);
    print_observation(&report.reverified);
}

pub fn print_run(report: &RunReport) {
    if report.ingested > 0 {
        println!("Ingested {} new documents", report.ingested);
    }
    print_batch(&report.batch);
    if let Some(observation) = &report.observation {
        print_observation(observation);
    }
    if let Some(decision) = &report.decision {
        match &decision.metrics {
            Some(m) => println!(
                "Trigger: {} (avg score {:.3}, incorrect rate {:.3}, n={})",
                decision.reason, m.avg_score, m.incorrect_rate, decision.count
            ),
            None => println!("Trigger: {} (n={})", decision.reason, decision.count),
        }
    }
    if let Some(cycle) = &report.cycle {
        print_cycle(cycle);
    }
    println!("Task {} is {} at iteration {}", report.task.name, report.task.status, report.task.iteration);
}

// ── Patterns ──

pub fn print_patterns(patterns: &[SharedPattern]) {
    if patterns.is_empty() {
        println!("No patterns.");
        return;
    }
    println!(
        "{:<24} {:<16} {:<7} {:>10} {:>7}  {}",
        "PATTERN", "CATEGORY", "TYPE", "CONFIDENCE", "USES", "DESCRIPTION"
    );
    for p in patterns {
        println!(
            "{:<24} {:<16} {:<7} {:>10.3} {:>3}/{:<3}  {}",
            p.name,
            p.category,
            p.implementation_type,
            p.confidence,
            p.success_count,
            p.usage_count,
            truncate(&p.description, 60),
        );
    }
}

// ── Record cards ──

/// Print every row of `batches` as a vertical card, titled by `filename`.
pub fn print_record_cards(batches: &[RecordBatch]) -> anyhow::Result<()> {
    let options = FormatOptions::default().with_null("");
    for batch in batches {
        let schema = batch.schema();
        let formatters = batch
            .columns()
            .iter()
            .map(|col| ArrayFormatter::try_new(col.as_ref(), &options))
            .collect::<Result<Vec<_>, _>>()?;

        for row_idx in 0..batch.num_rows() {
            let title = schema
                .index_of("filename")
                .ok()
                .map(|i| formatters[i].value(row_idx).to_string())
                .unwrap_or_default();
            println!("=== {title} ===");

            for (i, field) in schema.fields().iter().enumerate() {
                let name = field.name().as_str();
                if name == "filename" || batch.column(i).is_null(row_idx) {
                    continue;
                }
                let text = formatters[i].value(row_idx).to_string();
                if JSON_COLUMNS.contains(&name)
                    && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text)
                {
                    print_json_object(name, &map);
                } else {
                    row(name, text);
                }
            }
            println!();
        }
    }
    Ok(())
}

fn print_json_object(name: &str, map: &serde_json::Map<String, Value>) {
    if map.is_empty() {
        return;
    }
    println!("  {name}:");
    for (key, value) in map.iter().take(MAX_JSON_ITEMS) {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) if n.is_f64() => format!("{:.3}", n.as_f64().unwrap_or_default()),
            other => other.to_string(),
        };
        println!("    {:<24} {}", key, truncate(&text, MAX_VALUE_CHARS));
    }
    if map.len() > MAX_JSON_ITEMS {
        println!("    ... and {} more", map.len() - MAX_JSON_ITEMS);
    }
}

// ── Helpers ──

fn row(label: &str, value: impl std::fmt::Display) {
    println!("  {:<26} {}", label, value);
}

fn short_ref(commit_ref: &str) -> &str {
    commit_ref.get(..12).unwrap_or(commit_ref)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}
