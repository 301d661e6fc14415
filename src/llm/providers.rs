//! Provider policy table
//!
//! One place that knows, per external provider, where to send requests, which
//! model to use and what quota it grants, plus the ordered fallback list for
//! every job type. Both the submit path and the worker read from it.

use crate::queue::jobs::JobType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Groq,
    Google,
    OpenRouter,
    Glm,
}

impl ProviderId {
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Groq,
        ProviderId::Google,
        ProviderId::OpenRouter,
        ProviderId::Glm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Groq => "groq",
            ProviderId::Google => "google",
            ProviderId::OpenRouter => "openrouter",
            ProviderId::Glm => "glm",
        }
    }

    /// Prefix of the environment variables configuring this provider
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderId::Groq => "GROQ",
            ProviderId::Google => "GOOGLE",
            ProviderId::OpenRouter => "OPENROUTER",
            ProviderId::Glm => "GLM",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown provider: {}", s))
    }
}

#[derive(Clone)]
pub struct ProviderProfile {
    pub id: ProviderId,
    pub base_url: String,
    pub model: String,
    /// Requests per minute
    pub rpm_limit: u64,
    /// Tokens per minute
    pub tpm_limit: u64,
    pub api_key: Option<String>,
}

impl fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("rpm_limit", &self.rpm_limit)
            .field("tpm_limit", &self.tpm_limit)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ProviderProfile {
    /// Free-tier defaults for each provider (OpenAI-compatible endpoints).
    pub fn default_for(id: ProviderId) -> Self {
        let (base_url, model, rpm_limit, tpm_limit) = match id {
            ProviderId::Groq => (
                "https://api.groq.com/openai/v1",
                "llama-3.3-70b-versatile",
                30,
                12_000,
            ),
            ProviderId::Google => (
                "https://generativelanguage.googleapis.com/v1beta/openai",
                "gemini-2.0-flash",
                15,
                1_000_000,
            ),
            ProviderId::OpenRouter => (
                "https://openrouter.ai/api/v1",
                "meta-llama/llama-3.3-70b-instruct:free",
                20,
                200_000,
            ),
            ProviderId::Glm => ("https://api.z.ai/api/paas/v4", "glm-4.7-flash", 10, 100_000),
        };

        Self {
            id,
            base_url: base_url.to_string(),
            model: model.to_string(),
            rpm_limit,
            tpm_limit,
            api_key: None,
        }
    }

    pub fn with_limits(mut self, rpm_limit: u64, tpm_limit: u64) -> Self {
        self.rpm_limit = rpm_limit;
        self.tpm_limit = tpm_limit;
        self
    }
}

/// Ordered provider preference for a job type.
pub fn default_fallbacks(job_type: JobType) -> Vec<ProviderId> {
    match job_type {
        // Latency first
        JobType::Quick => vec![
            ProviderId::Groq,
            ProviderId::Google,
            ProviderId::OpenRouter,
            ProviderId::Glm,
        ],
        JobType::SingleSummary => vec![
            ProviderId::Google,
            ProviderId::Groq,
            ProviderId::OpenRouter,
            ProviderId::Glm,
        ],
        // Large contexts, Groq's token quota is the smallest
        JobType::BatchSummary => vec![
            ProviderId::Google,
            ProviderId::OpenRouter,
            ProviderId::Glm,
            ProviderId::Groq,
        ],
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    profiles: HashMap<ProviderId, ProviderProfile>,
    fallbacks: HashMap<JobType, Vec<ProviderId>>,
}

impl ProviderCatalog {
    /// Register the given profiles with the default fallback lists.
    pub fn new(profiles: impl IntoIterator<Item = ProviderProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id, p)).collect(),
            fallbacks: JobType::ALL
                .into_iter()
                .map(|t| (t, default_fallbacks(t)))
                .collect(),
        }
    }

    /// Keep only the profiles that have an API key.
    pub fn from_configured(profiles: &[ProviderProfile]) -> Self {
        Self::new(profiles.iter().filter(|p| p.api_key.is_some()).cloned())
    }

    pub fn profile(&self, id: ProviderId) -> Option<&ProviderProfile> {
        self.profiles.get(&id)
    }

    /// Profiles in a stable order
    pub fn profiles(&self) -> Vec<&ProviderProfile> {
        ProviderId::ALL
            .iter()
            .filter_map(|id| self.profiles.get(id))
            .collect()
    }

    /// Registered providers for a job type, in preference order.
    pub fn candidates(&self, job_type: JobType) -> Vec<&ProviderProfile> {
        self.fallbacks
            .get(&job_type)
            .map(|order| order.iter().filter_map(|id| self.profiles.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn supports(&self, job_type: JobType) -> bool {
        !self.candidates(job_type).is_empty()
    }
}
