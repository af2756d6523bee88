//! LLM-as-judge.

use std::sync::Arc;

use anyextract_core::{Language, SchemaDefinition, Verdict};
use async_trait::async_trait;
use tracing::debug;

use crate::json::is_parse_error;
use crate::prompts;
use crate::provider::{ChatMessage, ChatProvider, ChatRequest, InferenceError, chat_json};

/// Characters of document text shown to a text-only judge.
pub const JUDGE_CONTEXT_CHARS: usize = 4000;

/// Everything a judge needs to evaluate one extraction.
pub struct JudgeRequest<'a> {
    pub schema: &'a SchemaDefinition,
    pub fields: &'a serde_json::Value,
    pub document_text: &'a str,
    /// Rendered page as a `data:` URI. When present the vision model is used.
    pub page_image: Option<String>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, InferenceError>;
}

pub struct LlmJudge {
    provider: Arc<dyn ChatProvider>,
    model: String,
    vision_model: String,
    language: Language,
}

impl LlmJudge {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        vision_model: impl Into<String>,
        language: Language,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            vision_model: vision_model.into(),
            language,
        }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Verdict, InferenceError> {
        let schema = serde_json::to_string_pretty(request.schema)?;
        let extraction = serde_json::to_string_pretty(request.fields)?;

        let chat = match &request.page_image {
            Some(image) => ChatRequest::new(
                &self.vision_model,
                vec![
                    ChatMessage::system(prompts::JUDGE_VISION_SYSTEM),
                    ChatMessage::user_with_images(
                        prompts::judge_vision(self.language, &schema, &extraction),
                        std::slice::from_ref(image),
                    ),
                ],
            ),
            None => {
                let text = anyextract_core::task::truncate_chars(request.document_text, JUDGE_CONTEXT_CHARS);
                ChatRequest::new(
                    &self.model,
                    vec![
                        ChatMessage::system(prompts::JUDGE_SYSTEM),
                        ChatMessage::user(prompts::judge(self.language, &text, &schema, &extraction)),
                    ],
                )
            }
        }
        .temperature(0.1);

        let (parsed, response) = chat_json(self.provider.as_ref(), chat).await?;
        if is_parse_error(&parsed) {
            return Err(InferenceError::Malformed(format!(
                "judge answer is not JSON: {}",
                anyextract_core::task::truncate_chars(&response.content, 200)
            )));
        }
        let verdict: Verdict = serde_json::from_value(parsed)?;
        debug!(
            result = %verdict.result,
            score = verdict.score,
            vision = request.page_image.is_some(),
            "verdict"
        );
        Ok(verdict.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use anyextract_core::{JudgmentResult, SchemaField};
    use serde_json::json;

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new(vec![SchemaField::new("title", "string")])
    }

    #[tokio::test]
    async fn parses_and_clamps_verdict() {
        let provider = Arc::new(ScriptedProvider::constant(
            r#"{"overall_result": "partial", "overall_score": 1.4,
                "field_judgments": [{"field_name": "title", "result": "incorrect", "score": -0.2, "reasoning": "typo"}],
                "reasoning": "close"}"#,
        ));
        let judge = LlmJudge::new(provider.clone(), "judge", "vision", Language::En);
        let fields = json!({"title": "Q3 outlok"});
        let schema = schema();
        let v = judge
            .judge(&JudgeRequest {
                schema: &schema,
                fields: &fields,
                document_text: "Q3 outlook",
                page_image: None,
            })
            .await
            .unwrap();
        assert_eq!(v.result, JudgmentResult::Partial);
        assert_eq!(v.score, 1.0);
        assert_eq!(v.field_judgments[0].score, 0.0);
        assert_eq!(provider.requests()[0].model, "judge");
    }

    #[tokio::test]
    async fn page_image_switches_to_vision_model() {
        let provider = Arc::new(ScriptedProvider::constant(r#"{"result": "correct", "score": 0.9}"#));
        let judge = LlmJudge::new(provider.clone(), "judge", "vision", Language::Zh);
        let fields = json!({});
        let schema = schema();
        let v = judge
            .judge(&JudgeRequest {
                schema: &schema,
                fields: &fields,
                document_text: "",
                page_image: Some("data:image/png;base64,AAAA".into()),
            })
            .await
            .unwrap();
        assert_eq!(v.result, JudgmentResult::Correct);
        assert_eq!(provider.requests()[0].model, "vision");
    }

    #[tokio::test]
    async fn non_json_answer_is_an_error() {
        let provider = Arc::new(ScriptedProvider::constant("I think it is fine."));
        let judge = LlmJudge::new(provider, "judge", "vision", Language::En);
        let fields = json!({});
        let schema = schema();
        let err = judge
            .judge(&JudgeRequest {
                schema: &schema,
                fields: &fields,
                document_text: "text",
                page_image: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }
}
