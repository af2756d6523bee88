//! anyextract CLI: bootstrap extraction tasks, run them, and drive the
//! judge/evolve loop from the shell.

mod display;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyextract_ai::OpenAiClient;
use anyextract_core::{
    FeedbackType, Language, NewFeedback, QualityMetrics, SchemaDefinition, Settings, Task,
    TaskStatus,
};
use anyextract_host::{Pipeline, sanitize_task_name};
use anyextract_store::DuckStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(Parser)]
#[command(name = "anyextract")]
#[command(about = "Self-improving document extraction", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ./anyextract.toml when present)
    #[arg(long, global = true, env = "AE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task: analyze sample documents, propose a schema, write workflow v1
    New {
        name: String,
        /// Directory (or single file) of input documents
        #[arg(short, long)]
        input: PathBuf,
        /// What should be extracted, in plain words
        #[arg(short, long, default_value = "")]
        description: String,
        /// Prompt language (en, zh, bilingual)
        #[arg(short, long)]
        language: Option<Language>,
    },
    /// Extract every document, judge a sample, optionally evolve
    Run {
        task: String,
        /// Ingest new documents from this path first
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Run a diagnosis and mutation cycle when the trigger fires
        #[arg(long)]
        evolve: bool,
        /// Skip judging
        #[arg(long, conflicts_with = "evolve")]
        no_observe: bool,
    },
    /// Judge the current iteration's extractions
    Observe {
        task: String,
        /// Judge every extraction instead of a sample
        #[arg(long)]
        full: bool,
    },
    /// Run one diagnosis and mutation cycle now
    Evolve { task: String },
    /// List tasks, or show one task's quality and cost
    Status { task: Option<String> },
    /// Evolution event log of a task
    History { task: String },
    /// Schema versions
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Workflow versions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Move fields to smaller model tiers where they have proven accurate
    Optimize { task: String },
    /// Shared pattern library
    Patterns {
        #[command(subcommand)]
        command: PatternCommands,
    },
    /// Human feedback on judgments
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommands,
    },
    /// Export the latest extraction per document
    Export {
        task: String,
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Output file (json/parquet); defaults under paths.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Task lifecycle
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Print a schema version (the active one by default)
    Show {
        task: String,
        version: Option<i64>,
    },
    History { task: String },
    /// Fields added, removed and modified between two versions
    Diff { task: String, from: i64, to: i64 },
    /// Register a schema file as the new active version
    Set { task: String, file: PathBuf },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Print a workflow artifact (the active one by default)
    Show {
        task: String,
        version: Option<i64>,
    },
    History { task: String },
    /// Unified diff between two workflow versions
    Diff { task: String, from: i64, to: i64 },
    /// Register a plan (.json) or component (.wasm/.wat) as the new active version
    Import { task: String, file: PathBuf },
}

#[derive(Subcommand)]
enum PatternCommands {
    List {
        #[arg(short, long)]
        category: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        min_confidence: f64,
    },
    /// Publish the task's active plan, or a regex, as a shared pattern
    Promote {
        task: String,
        name: String,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        regex: Option<String>,
    },
}

#[derive(Subcommand)]
enum FeedbackCommands {
    Add {
        judgment: i64,
        /// approval, correction, rejection or comment
        #[arg(short = 't', long = "type")]
        feedback_type: FeedbackType,
        #[arg(short, long)]
        field: Option<String>,
        /// Value as extracted (JSON, or plain text)
        #[arg(long)]
        original: Option<String>,
        /// Expected value (JSON, or plain text)
        #[arg(long)]
        corrected: Option<String>,
        #[arg(short, long)]
        comment: Option<String>,
    },
    List { task: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Mark a task completed or failed
    Close {
        task: String,
        #[arg(short, long, default_value = "completed")]
        status: TaskStatus,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Parquet,
    /// Pretty-printed Arrow table
    Table,
    /// One vertical card per document
    Cards,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let pipeline = open_pipeline(settings)?;

    match cli.command {
        Commands::New {
            name,
            input,
            description,
            language,
        } => {
            let report = pipeline
                .bootstrap(&name, &description, &input, language)
                .await
                .with_context(|| format!("bootstrapping task {name}"))?;
            println!(
                "Created task {} from {} documents ({} samples)",
                report.task.name, report.documents, report.samples
            );
            println!(
                "Document type: {} ({} complexity)",
                report.analysis.document_type, report.analysis.complexity
            );
            println!("Schema v1: {}", report.schema.field_names().join(", "));
            println!(
                "Workflow v{} committed as {} ({} LLM calls, {} tokens)",
                report.workflow_version, report.commit_ref, report.usage.calls, report.usage.tokens
            );
        }

        Commands::Run {
            task,
            input,
            evolve,
            no_observe,
        } => {
            let report = pipeline
                .run(&task, input.as_deref(), !no_observe, evolve)
                .await
                .with_context(|| format!("running task {task}"))?;
            display::print_run(&report);
        }

        Commands::Observe { task, full } => {
            let task = pipeline.running_task(&task)?;
            let report = pipeline.observe(&task, full).await?;
            display::print_observation(&report);
        }

        Commands::Evolve { task } => {
            let task = pipeline.store().task_by_name(&task)?;
            let outcome = pipeline
                .evolve(task.id)
                .await
                .with_context(|| format!("evolving task {}", task.name))?;
            display::print_cycle(&outcome);
        }

        Commands::Status { task: None } => {
            display::print_tasks(&pipeline.store().tasks()?);
        }

        Commands::Status { task: Some(name) } => {
            let store = pipeline.store();
            let task = store.task_by_name(&name)?;
            let judgments = store.judgments(task.id)?;
            let summary = display::TaskSummary {
                documents: store.documents(task.id)?.len(),
                schema: store.active_schema(task.id).ok(),
                workflow: store.active_workflow(task.id).ok(),
                metrics: QualityMetrics::from_judgments(&judgments),
                usage: store.usage_totals(task.id)?,
            };
            display::print_task_card(&task, &summary);
        }

        Commands::History { task } => {
            let task = pipeline.store().task_by_name(&task)?;
            display::print_events(&pipeline.store().events(task.id)?);
        }

        Commands::Schema { command } => schema_command(&pipeline, command)?,
        Commands::Workflow { command } => workflow_command(&pipeline, command).await?,

        Commands::Optimize { task } => {
            let task = pipeline.store().task_by_name(&task)?;
            match pipeline.optimize(&task)? {
                Some(version) => {
                    println!("Workflow v{} with new model assignments:", version.version);
                    for (field, model) in &version.model_assignments {
                        println!("  {:<26} {}", field, model);
                    }
                }
                None => println!("Model assignments unchanged."),
            }
        }

        Commands::Patterns { command } => match command {
            PatternCommands::List {
                category,
                min_confidence,
            } => {
                let patterns = pipeline
                    .store()
                    .find_matching_patterns(category.as_deref(), min_confidence)?;
                display::print_patterns(&patterns);
            }
            PatternCommands::Promote {
                task,
                name,
                category,
                description,
                regex,
            } => {
                let task = pipeline.store().task_by_name(&task)?;
                let pattern = pipeline.promote_pattern(
                    &task,
                    &name,
                    category.as_deref(),
                    &description,
                    regex.as_deref(),
                )?;
                println!(
                    "Promoted {} pattern {} in category {}",
                    pattern.implementation_type, pattern.name, pattern.category
                );
            }
        },

        Commands::Feedback { command } => match command {
            FeedbackCommands::Add {
                judgment,
                feedback_type,
                field,
                original,
                corrected,
                comment,
            } => {
                let record = pipeline.store().add_feedback(&NewFeedback {
                    judgment_id: judgment,
                    feedback_type,
                    field_name: field,
                    original_value: original.as_deref().map(json_or_text),
                    corrected_value: corrected.as_deref().map(json_or_text),
                    comment,
                })?;
                println!("Recorded {} feedback #{} on judgment {}", record.feedback_type, record.id, judgment);
            }
            FeedbackCommands::List { task } => {
                let task = pipeline.store().task_by_name(&task)?;
                for f in pipeline.store().feedback(task.id)? {
                    println!(
                        "#{:<5} judgment {:<6} {:<10} {:<16} {} -> {}  {}",
                        f.id,
                        f.judgment_id,
                        f.feedback_type,
                        f.field_name.as_deref().unwrap_or("-"),
                        f.original_value.map(|v| v.to_string()).unwrap_or_default(),
                        f.corrected_value.map(|v| v.to_string()).unwrap_or_default(),
                        f.comment.unwrap_or_default(),
                    );
                }
            }
        },

        Commands::Export {
            task,
            format,
            output,
        } => {
            let task = pipeline.store().task_by_name(&task)?;
            export(&pipeline, &task, format, output)?;
        }

        Commands::Task {
            command: TaskCommands::Close { task, status },
        } => {
            let task = pipeline.close_task(&task, status)?;
            println!("Task {} is now {}", task.name, task.status);
        }
    }

    Ok(())
}

fn open_pipeline(settings: Settings) -> Result<Pipeline> {
    let database = &settings.paths.database;
    if let Some(parent) = database.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = DuckStore::open_persistent(database)
        .with_context(|| format!("opening database {}", database.display()))?;
    let provider = OpenAiClient::new(
        &settings.provider.base_url,
        settings.provider.api_key.clone(),
        Duration::from_secs(settings.provider.timeout_secs),
    )
    .context("creating model client")?;
    info!(
        database = %database.display(),
        workflows = %settings.paths.workflows_dir.display(),
        provider = %settings.provider.base_url,
        "opened pipeline"
    );
    Ok(Pipeline::new(store, settings, Arc::new(provider)))
}

/// Parse a command-line value as JSON, falling back to a plain string.
fn json_or_text(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

fn schema_command(pipeline: &Pipeline, command: SchemaCommands) -> Result<()> {
    let store = pipeline.store();
    match command {
        SchemaCommands::Show { task, version } => {
            let task = store.task_by_name(&task)?;
            let schema = match version {
                Some(v) => store.schema_version(task.id, v)?,
                None => store.active_schema(task.id)?,
            };
            println!("# {} schema v{}", task.name, schema.version);
            println!("{}", serde_json::to_string_pretty(&schema.definition)?);
        }
        SchemaCommands::History { task } => {
            let task = store.task_by_name(&task)?;
            display::print_schema_history(&store.schema_history(task.id)?);
        }
        SchemaCommands::Diff { task, from, to } => {
            let task = store.task_by_name(&task)?;
            let older = store.schema_version(task.id, from)?;
            let newer = store.schema_version(task.id, to)?;
            display::print_schema_diff(from, to, &older.definition.diff(&newer.definition));
        }
        SchemaCommands::Set { task, file } => {
            let task = store.task_by_name(&task)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let definition = SchemaDefinition::from_json(&text)
                .with_context(|| format!("parsing schema {}", file.display()))?;
            let version = pipeline.set_schema(&task, &definition)?;
            println!("Schema v{} is now active for {}", version.version, task.name);
        }
    }
    Ok(())
}

async fn workflow_command(pipeline: &Pipeline, command: WorkflowCommands) -> Result<()> {
    let store = pipeline.store();
    match command {
        WorkflowCommands::Show { task, version } => {
            let task = store.task_by_name(&task)?;
            let workflow = match version {
                Some(v) => store.workflow_version(task.id, v)?,
                None => store.active_workflow(task.id)?,
            };
            let bytes = pipeline.code().read_path(&workflow.artifact_path)?;
            println!(
                "# {} workflow v{} ({}, {})",
                task.name, workflow.version, workflow.artifact_kind, workflow.commit_ref
            );
            match std::str::from_utf8(&bytes) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("<binary component, {} bytes>", bytes.len()),
            }
        }
        WorkflowCommands::History { task } => {
            let task = store.task_by_name(&task)?;
            display::print_workflow_history(&store.workflow_history(task.id)?);
        }
        WorkflowCommands::Diff { task, from, to } => {
            let task = store.task_by_name(&task)?;
            let diff = pipeline
                .code()
                .diff(&sanitize_task_name(&task.name), from, to)?;
            if diff.is_empty() {
                println!("v{from} and v{to} are identical");
            } else {
                print!("{diff}");
            }
        }
        WorkflowCommands::Import { task, file } => {
            let task = store.task_by_name(&task)?;
            let version = pipeline
                .import_workflow(&task, &file)
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            println!(
                "Workflow v{} ({}) is now active for {}",
                version.version, version.artifact_kind, task.name
            );
        }
    }
    Ok(())
}

fn export(
    pipeline: &Pipeline,
    task: &Task,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let store = pipeline.store();
    let default_output = |ext: &str| {
        pipeline
            .settings()
            .paths
            .output_dir
            .join(format!("{}.{ext}", sanitize_task_name(&task.name)))
    };
    match format {
        ExportFormat::Json => {
            let path = output.unwrap_or_else(|| default_output("json"));
            let documents = store.documents(task.id)?;
            let rows: Vec<serde_json::Value> = store
                .latest_extractions(task.id)?
                .into_iter()
                .map(|e| {
                    let filename = documents
                        .iter()
                        .find(|d| d.id == e.document_id)
                        .map(|d| d.filename.clone())
                        .unwrap_or_default();
                    serde_json::json!({
                        "filename": filename,
                        "document_id": e.document_id,
                        "extraction_id": e.id,
                        "iteration": e.iteration,
                        "status": e.status,
                        "confidence": e.confidence,
                        "fields": e.fields,
                        "field_confidence": e.field_confidence,
                        "error": e.error,
                    })
                })
                .collect();
            create_parent(&path)?;
            let file = std::fs::File::create(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &rows)?;
            info!(task = %task.name, rows = rows.len(), path = %path.display(), "exported json");
            println!("Exported {} extractions to {}", rows.len(), path.display());
        }
        ExportFormat::Parquet => {
            let path = output.unwrap_or_else(|| default_output("parquet"));
            create_parent(&path)?;
            let rows = store.export_parquet(task.id, &path)?;
            info!(task = %task.name, rows, path = %path.display(), "exported parquet");
            println!("Exported {rows} extractions to {}", path.display());
        }
        ExportFormat::Table => {
            let batches = store.export_batches(task.id)?;
            arrow::util::pretty::print_batches(&batches)?;
        }
        ExportFormat::Cards => {
            let batches = store.export_batches(task.id)?;
            display::print_record_cards(&batches)?;
        }
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from(["anyextract", "run", "reports", "--evolve"]).unwrap();
        match cli.command {
            Commands::Run {
                task,
                evolve,
                no_observe,
                input,
            } => {
                assert_eq!(task, "reports");
                assert!(evolve);
                assert!(!no_observe);
                assert!(input.is_none());
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["anyextract", "run", "r", "--evolve", "--no-observe"]).is_err());
    }

    #[test]
    fn enums_parse_from_labels() {
        let cli = Cli::try_parse_from([
            "anyextract", "feedback", "add", "7", "--type", "correction", "--corrected", "BUY",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Feedback {
                command: FeedbackCommands::Add {
                    feedback_type: FeedbackType::Correction,
                    ..
                }
            }
        ));
        let cli = Cli::try_parse_from(["anyextract", "new", "r", "-i", "in", "-l", "zh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::New {
                language: Some(Language::Zh),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["anyextract", "task", "close", "r", "-s", "paused"]).is_err());
    }

    #[test]
    fn export_paths_get_their_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("nested").join("reports.json");
        create_parent(&path).unwrap();
        assert!(dir.path().join("out").join("nested").is_dir());
        // Bare file names need no directory.
        create_parent(Path::new("reports.json")).unwrap();
    }

    #[test]
    fn feedback_values_fall_back_to_text() {
        assert_eq!(json_or_text("42"), serde_json::json!(42));
        assert_eq!(json_or_text("BUY"), serde_json::json!("BUY"));
        assert_eq!(json_or_text(r#"{"a": 1}"#), serde_json::json!({"a": 1}));
    }
}
