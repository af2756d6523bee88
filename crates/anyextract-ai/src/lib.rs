//! Model-facing layer: chat providers, prompt templates, the LLM judge and
//! the builder that writes and repairs extraction artifacts.

mod builder;
mod judge;
mod json;
pub mod prompts;
mod provider;

pub use builder::{
    ArtifactValidator, BuildError, Builder, DIAGNOSIS_FAILURES, DIAGNOSIS_SOURCE_CHARS,
    DocumentAnalysis, FailureReport, GeneratedArtifact, REPAIR_FAILURES,
};
pub use judge::{JUDGE_CONTEXT_CHARS, Judge, JudgeRequest, LlmJudge};
pub use json::{is_parse_error, parse_json_response, strip_code_fences};
pub use provider::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ContentPart, ImageUrl, InferenceError,
    MessageContent, OpenAiClient, ResponseFormat, Role, ScriptedProvider, Usage, chat_json,
};
