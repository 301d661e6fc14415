// LLM abstraction layer: provider table, adapters and the job executor

pub mod executor;
pub mod openai;
pub mod provider;
pub mod providers;

pub use executor::LlmJobExecutor;
pub use provider::*;
pub use providers::{ProviderCatalog, ProviderId, ProviderProfile};
