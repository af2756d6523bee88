use anyextract_ai::{BuildError, InferenceError};
use anyextract_store::StoreError;
use thiserror::Error;

/// Loading or running a workflow artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid extraction plan: {0}")]
    InvalidPlan(String),

    #[error("component error: {0}")]
    Component(String),

    #[error("component returned an error: {0}")]
    Guest(String),

    #[error("component output is not valid: {0}")]
    Output(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArtifactError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ArtifactError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a wasmtime error with its full cause chain.
    pub(crate) fn component(err: wasmtime::Error) -> Self {
        ArtifactError::Component(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no documents found in {0}")]
    NoDocuments(String),

    #[error("task name {0:?} has no usable characters")]
    InvalidTaskName(String),

    #[error("task {task} is {status}: {reason}")]
    TaskState {
        task: String,
        status: anyextract_core::TaskStatus,
        reason: &'static str,
    },

    #[error("unsupported artifact {0}: expected .json, .wasm or .wat")]
    UnsupportedArtifact(String),

    #[error("invalid pattern {name}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error(transparent)]
    Schema(#[from] anyextract_core::SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}
