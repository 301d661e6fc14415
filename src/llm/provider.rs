use crate::llm::openai::OpenAICompatibleAdapter;
use crate::llm::providers::ProviderProfile;
use crate::types::{AppError, AppResult, LLMRequest, LLMResponse};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

/// Build the adapter for a provider profile. The profile must carry an API key.
pub fn adapter_for(profile: &ProviderProfile, timeout: Duration) -> AppResult<Arc<dyn LLMAdapter>> {
    let api_key = profile.api_key.as_deref().ok_or_else(|| {
        AppError::InvalidRequest(format!("{} has no API key configured", profile.id))
    })?;

    let adapter = OpenAICompatibleAdapter::new(
        profile.id.as_str(),
        profile.base_url.as_str(),
        api_key,
        timeout,
    )?;
    Ok(Arc::new(adapter))
}
