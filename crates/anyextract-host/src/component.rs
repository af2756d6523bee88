//! Wasmtime runtime for component workflow artifacts.
//!
//! A component exports `extract(context) -> result<string, string>` and may
//! call back into the host for model inference and audit logging. Every
//! invocation gets a fresh store with a fuel budget and an epoch deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyextract_ai::{ChatMessage, ChatProvider, ChatRequest, InferenceError as ProviderError, Usage};
use anyextract_core::FieldTrace;
use anyextract_core::config::ExecutionSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wasmtime::component::{Component, HasSelf, Linker, ResourceTable};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig, Store};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder, WasiCtxView, WasiView};

use crate::error::ArtifactError;
use crate::strategy::{ExtractionContext, ExtractionStrategy, StrategyOutput, pick_model};

wasmtime::component::bindgen!({
    world: "extractor",
    path: "../../wit",
    imports: { default: async },
    exports: { default: async },
});

use anyextract::extractor::{audit_log, inference};

/// Audit entry reported by a guest, stamped by the host.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: String,
    pub resource: String,
    pub detail: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.event_type, self.resource, self.detail)
    }
}

/// Result of one component invocation.
pub struct RunResult {
    pub output: Result<String, String>,
    pub audit_entries: Vec<AuditRecord>,
    pub usage: Usage,
    pub fuel_consumed: u64,
}

/// Per-invocation state held in the wasmtime [`Store`].
pub struct HostState {
    provider: Arc<dyn ChatProvider>,
    model_assignments: BTreeMap<String, String>,
    worker_tiers: Vec<String>,
    default_model: String,
    document: String,
    usage: Usage,
    audit_entries: Vec<AuditRecord>,
    wasi_ctx: WasiCtx,
    table: ResourceTable,
}

impl HostState {
    fn new(ctx: &ExtractionContext<'_>) -> Self {
        let wasi_ctx = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build();
        Self {
            provider: ctx.provider.clone(),
            model_assignments: ctx.model_assignments.clone(),
            worker_tiers: ctx.worker_tiers.to_vec(),
            default_model: ctx.default_model.to_string(),
            document: ctx.document.filename.clone(),
            usage: Usage::default(),
            audit_entries: Vec::new(),
            wasi_ctx,
            table: ResourceTable::new(),
        }
    }
}

impl WasiView for HostState {
    fn ctx(&mut self) -> WasiCtxView<'_> {
        WasiCtxView {
            ctx: &mut self.wasi_ctx,
            table: &mut self.table,
        }
    }
}

impl audit_log::Host for HostState {
    async fn record_event(&mut self, entry: audit_log::AuditEntry) {
        let record = AuditRecord {
            event_type: entry.event_type,
            resource: entry.resource,
            detail: entry.detail,
            timestamp: chrono::Utc::now(),
        };
        info!(
            document = %self.document,
            event_type = %record.event_type,
            resource = %record.resource,
            detail = %record.detail,
            "component audit event"
        );
        self.audit_entries.push(record);
    }
}

impl inference::Host for HostState {
    async fn generate(
        &mut self,
        request: inference::GenerateRequest,
    ) -> Result<inference::GenerateResponse, inference::InferenceError> {
        let model = pick_model(
            &self.model_assignments,
            &self.worker_tiers,
            &self.default_model,
            request.field.as_deref(),
        )
        .to_string();
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(request.user_prompt));
        let mut chat = ChatRequest::new(&model, messages)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens);
        if request.json {
            chat = chat.json();
        }

        match self.provider.chat(&chat).await {
            Ok(response) => {
                self.usage.add(&response);
                debug!(document = %self.document, %model, tokens = response.total_tokens, "component inference");
                Ok(inference::GenerateResponse {
                    text: response.content,
                    tokens_used: u32::try_from(response.total_tokens).unwrap_or(u32::MAX),
                    model,
                })
            }
            Err(e) => {
                warn!(document = %self.document, %model, error = %e, "component inference failed");
                let code = match &e {
                    ProviderError::Server { status, .. } => u32::from(*status),
                    _ => 0,
                };
                Err(inference::InferenceError {
                    message: e.to_string(),
                    code,
                })
            }
        }
    }
}

/// Shared engine, linker and epoch ticker for component artifacts.
///
/// Must be created inside a Tokio runtime; the ticker advances the engine
/// epoch once per second until the runtime is dropped.
pub struct ComponentRuntime {
    engine: Engine,
    linker: Linker<HostState>,
    fuel: u64,
    deadline_ticks: u64,
    ticker: JoinHandle<()>,
}

/// Engine configured for sandboxed extraction.
///
/// - Pooling allocator with pre-allocated instance slots
/// - Fuel metering for deterministic execution budgets
/// - Epoch interruption for wall-clock timeouts
pub fn create_engine() -> Result<Engine, ArtifactError> {
    let mut pool = PoolingAllocationConfig::new();
    pool.total_component_instances(16);
    pool.total_memories(32);
    pool.max_memory_size(64 * 1024 * 1024); // 64 MiB per instance

    let mut config = Config::new();
    config.async_support(true);
    config.wasm_component_model(true);
    config.consume_fuel(true);
    config.epoch_interruption(true);
    config.allocation_strategy(InstanceAllocationStrategy::Pooling(pool));

    Engine::new(&config).map_err(ArtifactError::component)
}

fn create_linker(engine: &Engine) -> Result<Linker<HostState>, ArtifactError> {
    let mut linker = Linker::new(engine);
    Extractor::add_to_linker::<HostState, HasSelf<HostState>>(&mut linker, |state| state)
        .map_err(ArtifactError::component)?;
    // WASI p2 interfaces required by the wasip1 adapter
    wasmtime_wasi::p2::add_to_linker_async(&mut linker).map_err(ArtifactError::component)?;
    Ok(linker)
}

impl ComponentRuntime {
    pub fn new(settings: &ExecutionSettings) -> Result<Self, ArtifactError> {
        let engine = create_engine()?;
        let linker = create_linker(&engine)?;
        let epoch_engine = engine.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                epoch_engine.increment_epoch();
            }
        });
        Ok(Self {
            engine,
            linker,
            fuel: settings.fuel,
            deadline_ticks: settings.deadline_secs.max(1),
            ticker,
        })
    }

    /// Compile a component from binary or WAT bytes.
    pub fn compile(&self, bytes: &[u8]) -> Result<Component, ArtifactError> {
        Component::new(&self.engine, bytes).map_err(ArtifactError::component)
    }

    pub async fn run(
        &self,
        component: &Component,
        ctx: &ExtractionContext<'_>,
    ) -> Result<RunResult, ArtifactError> {
        let input = serde_json::to_string(&ctx.to_json())?;
        let mut store = Store::new(&self.engine, HostState::new(ctx));
        store.set_fuel(self.fuel).map_err(ArtifactError::component)?;
        store.set_epoch_deadline(self.deadline_ticks);

        let instance = Extractor::instantiate_async(&mut store, component, &self.linker)
            .await
            .map_err(ArtifactError::component)?;
        let output = instance
            .call_extract(&mut store, &input)
            .await
            .map_err(ArtifactError::component)?;

        let fuel_consumed = self
            .fuel
            .saturating_sub(store.get_fuel().map_err(ArtifactError::component)?);
        let state = store.into_data();
        Ok(RunResult {
            output,
            audit_entries: state.audit_entries,
            usage: state.usage,
            fuel_consumed,
        })
    }
}

impl Drop for ComponentRuntime {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// JSON a component returns from `extract`.
#[derive(Debug, Default, Deserialize)]
struct ComponentOutput {
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    #[serde(default, alias = "field_confidences")]
    field_confidence: BTreeMap<String, f64>,
    /// Field name to extraction method, for confidence priors.
    #[serde(default)]
    methods: BTreeMap<String, String>,
}

/// A compiled component bound to the runtime that executes it.
pub struct ComponentStrategy {
    runtime: Arc<ComponentRuntime>,
    component: Component,
}

impl ComponentStrategy {
    pub fn new(runtime: Arc<ComponentRuntime>, bytes: &[u8]) -> Result<Self, ArtifactError> {
        let component = runtime.compile(bytes)?;
        Ok(Self { runtime, component })
    }
}

#[async_trait]
impl ExtractionStrategy for ComponentStrategy {
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<StrategyOutput, ArtifactError> {
        let run = self.runtime.run(&self.component, ctx).await?;
        let text = run.output.map_err(ArtifactError::Guest)?;
        let output: ComponentOutput =
            serde_json::from_str(&text).map_err(|e| ArtifactError::Output(e.to_string()))?;

        let traces = output
            .fields
            .keys()
            .map(|field| {
                let method = output
                    .methods
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| "component".to_string());
                (
                    field.clone(),
                    FieldTrace {
                        method,
                        model: None,
                        pattern: None,
                    },
                )
            })
            .collect();
        Ok(StrategyOutput {
            fields: output.fields,
            field_confidence: output
                .field_confidence
                .into_iter()
                .map(|(k, v)| (k, v.clamp(0.0, 1.0)))
                .collect(),
            traces,
            usage: run.usage,
            audit: run.audit_entries.iter().map(ToString::to_string).collect(),
            fuel_consumed: Some(run.fuel_consumed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{document, schema, task};
    use anyextract_ai::ScriptedProvider;
    use anyextract_core::Language;
    use std::path::PathBuf;

    fn field_extractor_wasm() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../guests/field-extractor/target/wasm32-wasip1/release/field_extractor.wasm")
    }

    #[test]
    fn component_output_accepts_either_confidence_key() {
        let out: ComponentOutput = serde_json::from_str(
            r#"{"fields": {"title": "Q3"}, "field_confidences": {"title": 0.7}}"#,
        )
        .unwrap();
        assert_eq!(out.field_confidence["title"], 0.7);
        assert!(out.methods.is_empty());
    }

    #[tokio::test]
    async fn rejects_bytes_that_are_not_a_component() {
        let runtime = ComponentRuntime::new(&ExecutionSettings::default()).unwrap();
        let err = runtime.compile(b"not wasm").err().unwrap();
        assert!(matches!(err, ArtifactError::Component(_)));
        // A core module is not a component.
        assert!(runtime.compile(b"(module)").is_err());
    }

    #[tokio::test]
    #[ignore = "needs guests/field-extractor built: cargo component build --release"]
    async fn field_extractor_runs_with_fuel_and_audit() {
        let runtime = Arc::new(ComponentRuntime::new(&ExecutionSettings::default()).unwrap());
        let bytes = std::fs::read(field_extractor_wasm()).unwrap();
        let strategy = ComponentStrategy::new(runtime, &bytes).unwrap();

        let provider = Arc::new(ScriptedProvider::constant(r#"{"summary": "Solid quarter"}"#));
        let task = task();
        let doc = document(
            "Acme：Q3 Outlook_Jane_Macro_20241001.txt",
            &["Rating: BUY\nRevenue grew."],
        );
        let schema = schema(&["title", "date", "summary"]);
        let assignments = BTreeMap::new();
        let ctx = ExtractionContext {
            task: &task,
            document: &doc,
            schema: &schema,
            corner_cases: &[],
            patterns: &[],
            model_assignments: &assignments,
            worker_tiers: &[],
            default_model: "worker",
            language: Language::En,
            provider: provider.clone(),
        };
        let out = strategy.extract(&ctx).await.unwrap();
        assert_eq!(out.fields["title"], serde_json::json!("Q3 Outlook"));
        assert_eq!(out.traces["title"].method, "filename");
        assert_eq!(out.usage.calls, 1);
        assert!(out.fuel_consumed.unwrap() > 0);
        assert!(!out.audit.is_empty());
    }
}
