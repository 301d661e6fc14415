// Store key layout

use uuid::Uuid;

pub const DEFAULT_KEY_PREFIX: &str = "oxq";

#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, id: &Uuid) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn status(&self, id: &Uuid) -> String {
        format!("{}:status:{}", self.prefix, id)
    }

    /// Sorted set ordering waiting jobs of one type
    pub fn priority_index(&self, job_type: &str) -> String {
        format!("{}:queue:{}:priority", self.prefix, job_type)
    }

    /// Plain list kept for consumers that predate the sorted index
    pub fn legacy_index(&self, job_type: &str) -> String {
        format!("{}:queue:{}", self.prefix, job_type)
    }

    /// Pub/sub channel announcing new work to dispatchers
    pub fn wake_channel(&self) -> String {
        format!("{}:wake", self.prefix)
    }

    pub fn request_window(&self, provider: &str) -> String {
        format!("{}:ratelimit:{}:requests", self.prefix, provider)
    }

    pub fn token_counter(&self, provider: &str) -> String {
        format!("{}:ratelimit:{}:tokens", self.prefix, provider)
    }
}
