// LLM job executor: turns a job payload into a chat completion on the
// provider the worker selected.

use crate::llm::provider::{adapter_for, LLMAdapter};
use crate::llm::providers::{ProviderCatalog, ProviderId, ProviderProfile};
use crate::queue::jobs::{Job, JobData};
use crate::queue::workers::JobExecutor;
use crate::types::{AppError, AppResult, LLMMessage, LLMRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const QUICK_SYSTEM_PROMPT: &str =
    "You are a concise assistant. Answer the question directly using the provided context when present.";
const SUMMARY_SYSTEM_PROMPT: &str =
    "You summarize documents faithfully. Keep key facts, figures and conclusions; do not invent details.";
const BATCH_SYSTEM_PROMPT: &str =
    "You summarize collections of documents. Give a short summary per document, then an overall synthesis.";

#[derive(Default)]
pub struct LlmJobExecutor {
    adapters: HashMap<ProviderId, Arc<dyn LLMAdapter>>,
}

impl LlmJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// One adapter per provider in the catalog.
    pub fn from_catalog(catalog: &ProviderCatalog, timeout: Duration) -> AppResult<Self> {
        let mut executor = Self::new();
        for profile in catalog.profiles() {
            executor = executor.with_adapter(profile.id, adapter_for(profile, timeout)?);
        }
        Ok(executor)
    }

    pub fn with_adapter(mut self, provider: ProviderId, adapter: Arc<dyn LLMAdapter>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    fn build_request(job: &Job, provider: &ProviderProfile) -> LLMRequest {
        let messages = match &job.data {
            JobData::Quick(p) => {
                let user = match &p.context {
                    Some(context) => format!("Context:\n{}\n\nQuestion:\n{}", context, p.prompt),
                    None => p.prompt.clone(),
                };
                vec![LLMMessage::system(QUICK_SYSTEM_PROMPT), LLMMessage::user(user)]
            }
            JobData::SingleSummary(p) => {
                let mut user = String::new();
                if let Some(instructions) = &p.instructions {
                    user.push_str(&format!("Instructions: {}\n\n", instructions));
                }
                user.push_str(&format!("Document: {}\n\n{}", p.document.name, p.document.text));
                vec![LLMMessage::system(SUMMARY_SYSTEM_PROMPT), LLMMessage::user(user)]
            }
            JobData::BatchSummary(p) => {
                let mut user = String::new();
                if let Some(instructions) = &p.instructions {
                    user.push_str(&format!("Instructions: {}\n\n", instructions));
                }
                for (i, document) in p.documents.iter().enumerate() {
                    user.push_str(&format!(
                        "--- Document {}: {} ---\n{}\n\n",
                        i + 1,
                        document.name,
                        document.text
                    ));
                }
                vec![LLMMessage::system(BATCH_SYSTEM_PROMPT), LLMMessage::user(user)]
            }
        };

        LLMRequest {
            model: provider.model.clone(),
            messages,
            max_tokens: Some(job.job_type().output_budget()),
            temperature: Some(0.3),
        }
    }
}

#[async_trait]
impl JobExecutor for LlmJobExecutor {
    async fn execute(&self, job: &Job, provider: &ProviderProfile) -> AppResult<serde_json::Value> {
        let adapter = self
            .adapters
            .get(&provider.id)
            .ok_or_else(|| AppError::NotFound(format!("no adapter for provider {}", provider.id)))?;

        let request = Self::build_request(job, provider);
        debug!("Sending {} job {} to {}", job.job_type(), job.id, provider.id);
        let response = adapter.create_chat_completion(&request).await?;

        Ok(serde_json::json!({
            "content": response.content,
            "provider": provider.id,
            "model": provider.model,
            "finishReason": response.finish_reason,
            "usage": response.usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::jobs::{BatchSummaryPayload, Document, QuickPayload};
    use crate::types::{LLMResponse, TokenUsage};
    use std::sync::Mutex;

    /// Captures the last request and replies with a fixed answer.
    #[derive(Default)]
    struct CapturingAdapter {
        last: Mutex<Option<LLMRequest>>,
    }

    #[async_trait]
    impl LLMAdapter for CapturingAdapter {
        async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
            *self.last.lock().unwrap() = Some(request.clone());
            Ok(LLMResponse {
                content: "summary".to_string(),
                finish_reason: "stop".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                    total_tokens: 12,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_execute_uses_selected_provider_model() {
        let adapter = Arc::new(CapturingAdapter::default());
        let executor = LlmJobExecutor::new().with_adapter(ProviderId::Google, adapter.clone());
        let provider = ProviderProfile::default_for(ProviderId::Google);

        let job = Job::new(
            JobData::BatchSummary(BatchSummaryPayload {
                documents: vec![
                    Document { name: "a.txt".to_string(), text: "alpha".to_string() },
                    Document { name: "b.txt".to_string(), text: "beta".to_string() },
                ],
                instructions: Some("bullet points".to_string()),
            }),
            "c",
        );

        let result = executor.execute(&job, &provider).await.unwrap();
        assert_eq!(result["content"], "summary");
        assert_eq!(result["provider"], "google");
        assert_eq!(result["usage"]["totalTokens"], 12);

        let request = adapter.last.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, provider.model);
        assert_eq!(request.max_tokens, Some(2048));
        let user = &request.messages[1].content;
        assert!(user.contains("Document 2: b.txt"));
        assert!(user.starts_with("Instructions: bullet points"));
    }

    #[tokio::test]
    async fn test_execute_without_adapter_fails() {
        let executor = LlmJobExecutor::new();
        let job = Job::new(
            JobData::Quick(QuickPayload { prompt: "hi".to_string(), context: None }),
            "c",
        );

        let err = executor
            .execute(&job, &ProviderProfile::default_for(ProviderId::Groq))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_from_catalog_requires_keys() {
        let catalog = ProviderCatalog::new([ProviderProfile::default_for(ProviderId::Glm)]);
        assert!(LlmJobExecutor::from_catalog(&catalog, Duration::from_secs(1)).is_err());

        let mut glm = ProviderProfile::default_for(ProviderId::Glm);
        glm.api_key = Some("key".to_string());
        let executor =
            LlmJobExecutor::from_catalog(&ProviderCatalog::new([glm]), Duration::from_secs(1)).unwrap();
        assert!(executor.adapters.contains_key(&ProviderId::Glm));
    }
}
