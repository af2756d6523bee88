//! Process-wide settings, layered from defaults, a TOML file, and `AE_` environment variables.
//!
//! Nested keys use `__` in the environment: `AE_PROVIDER__API_KEY`,
//! `AE_EXECUTION__CONCURRENCY`.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::confidence::{ConfidenceEngine, ConfidenceWeights, MethodPriors};
use crate::sampling::{DEFAULT_PRIORITY_CONFIDENCE, SamplingController};
use crate::task::Language;
use crate::trigger::EvolutionTrigger;

pub const DEFAULT_CONFIG_FILE: &str = "anyextract.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// OpenAI-compatible endpoint, without the `/chat/completions` suffix.
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".into(),
            api_key: String::new(),
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub worker: String,
    pub builder: String,
    pub observer: String,
    pub observer_vision: String,
    /// Worker models ordered largest to smallest.
    pub worker_tiers: Vec<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            worker: "Qwen/Qwen3-VL-235B-A22B-Instruct".into(),
            builder: "Pro/zai-org/GLM-5".into(),
            observer: "Pro/moonshotai/Kimi-K2.5".into(),
            observer_vision: "Qwen/Qwen3-VL-235B-A22B-Instruct".into(),
            worker_tiers: vec![
                "Qwen/Qwen3-VL-235B-A22B-Instruct".into(),
                "Qwen/Qwen3-32B".into(),
                "Qwen/Qwen3-14B".into(),
                "Qwen/Qwen3-8B".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub database: PathBuf,
    pub workflows_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/anyextract.duckdb"),
            workflows_dir: PathBuf::from("workflows"),
            output_dir: PathBuf::from("data/output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    pub max_iterations: i64,
    pub quality_threshold: f64,
    pub incorrect_threshold: f64,
    pub min_judgments: usize,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        let t = EvolutionTrigger::default();
        Self {
            max_iterations: 20,
            quality_threshold: t.quality_threshold,
            incorrect_threshold: t.incorrect_threshold,
            min_judgments: t.min_judgments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub priority_confidence: f64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            priority_confidence: DEFAULT_PRIORITY_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceSettings {
    pub weights: ConfidenceWeights,
    pub method_priors: MethodPriors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Documents extracted or judged in parallel.
    pub concurrency: usize,
    /// Fuel budget per component invocation.
    pub fuel: u64,
    /// Wall-clock limit per component invocation.
    pub deadline_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fuel: 10_000_000_000,
            deadline_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Documents flagged as samples and shown to the builder at bootstrap.
    pub max_samples: usize,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self { max_samples: 10 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub models: ModelSettings,
    pub paths: PathSettings,
    pub language: Language,
    pub evolution: EvolutionSettings,
    pub sampling: SamplingSettings,
    pub confidence: ConfidenceSettings,
    pub execution: ExecutionSettings,
    pub bootstrap: BootstrapSettings,
}

impl Settings {
    /// Defaults, then `config_path` (or `anyextract.toml` if present), then `AE_*` env.
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let file = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("AE_").split("__"))
    }

    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(config_path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.concurrency == 0 {
            return Err(ConfigError::Invalid("execution.concurrency must be at least 1".into()));
        }
        for (name, value) in [
            ("evolution.quality_threshold", self.evolution.quality_threshold),
            ("evolution.incorrect_threshold", self.evolution.incorrect_threshold),
            ("sampling.priority_confidence", self.sampling.priority_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.evolution.max_iterations < 0 {
            return Err(ConfigError::Invalid("evolution.max_iterations must not be negative".into()));
        }
        Ok(())
    }

    pub fn trigger(&self) -> EvolutionTrigger {
        EvolutionTrigger {
            quality_threshold: self.evolution.quality_threshold,
            incorrect_threshold: self.evolution.incorrect_threshold,
            min_judgments: self.evolution.min_judgments,
        }
    }

    pub fn sampler(&self) -> SamplingController {
        SamplingController::new(self.sampling.priority_confidence)
    }

    pub fn confidence_engine(&self) -> ConfidenceEngine {
        ConfidenceEngine::new(self.confidence.weights, self.confidence.method_priors)
    }

    /// Model for a field when the workflow has no assignment for it.
    pub fn default_worker_model(&self) -> &str {
        self.models
            .worker_tiers
            .first()
            .map(String::as_str)
            .unwrap_or(&self.models.worker)
    }
}
