use crate::llm::providers::{ProviderId, ProviderProfile};
use crate::store::keys::DEFAULT_KEY_PREFIX;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub llm: LLMConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub op_timeout_ms: u64,
    pub connect_retries: u32,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub job_ttl_secs: u64,
    pub max_jobs_per_run: usize,
    pub sweep_interval_secs: u64,
    pub cleanup_every_sweeps: u32,
    pub stream_poll_ms: u64,
    /// Run the dispatcher inside the HTTP server process
    pub embedded_worker: bool,
}

#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub providers: Vec<ProviderProfile>,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Default)]
pub struct AdminConfig {
    pub token: Option<String>,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
                cors_allowed_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                key_prefix: DEFAULT_KEY_PREFIX.to_string(),
                op_timeout_ms: 2_000,
                connect_retries: 3,
            },
            queue: QueueConfig {
                job_ttl_secs: 24 * 60 * 60,
                max_jobs_per_run: 5,
                sweep_interval_secs: 60,
                cleanup_every_sweeps: 10,
                stream_poll_ms: 1_000,
                embedded_worker: true,
            },
            llm: LLMConfig {
                providers: ProviderId::ALL.map(ProviderProfile::default_for).to_vec(),
                request_timeout_secs: 60,
            },
            admin: AdminConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        Ok(Self {
            server: ServerConfig {
                port: env_or("PORT", defaults.server.port)?,
                host: env::var("HOST").unwrap_or(defaults.server.host),
                cors_allowed_origins: match env::var("ALLOWED_ORIGINS") {
                    Ok(origins) => origins
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    Err(_) => defaults.server.cors_allowed_origins,
                },
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or(defaults.redis.url),
                key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or(defaults.redis.key_prefix),
                op_timeout_ms: env_or("REDIS_OP_TIMEOUT_MS", defaults.redis.op_timeout_ms)?,
                connect_retries: env_or("REDIS_CONNECT_RETRIES", defaults.redis.connect_retries)?,
            },
            queue: QueueConfig {
                job_ttl_secs: env_or("JOB_TTL_SECS", defaults.queue.job_ttl_secs)?,
                max_jobs_per_run: env_or("MAX_JOBS_PER_RUN", defaults.queue.max_jobs_per_run)?,
                sweep_interval_secs: env_or(
                    "SWEEP_INTERVAL_SECS",
                    defaults.queue.sweep_interval_secs,
                )?,
                cleanup_every_sweeps: env_or(
                    "CLEANUP_EVERY_SWEEPS",
                    defaults.queue.cleanup_every_sweeps,
                )?,
                stream_poll_ms: env_or("STREAM_POLL_MS", defaults.queue.stream_poll_ms)?,
                embedded_worker: env_or("EMBEDDED_WORKER", defaults.queue.embedded_worker)?,
            },
            llm: LLMConfig {
                providers: ProviderId::ALL
                    .into_iter()
                    .map(provider_from_env)
                    .collect::<Result<Vec<_>>>()?,
                request_timeout_secs: env_or(
                    "LLM_TIMEOUT_SECS",
                    defaults.llm.request_timeout_secs,
                )?,
            },
            admin: AdminConfig {
                token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            },
        })
    }
}

impl QueueConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }
}

/// Read `{PREFIX}_API_KEY`, `{PREFIX}_MODEL`, `{PREFIX}_RPM` and `{PREFIX}_TPM`.
fn provider_from_env(id: ProviderId) -> Result<ProviderProfile> {
    let defaults = ProviderProfile::default_for(id);
    let prefix = id.env_prefix();

    Ok(ProviderProfile {
        api_key: env::var(format!("{}_API_KEY", prefix))
            .ok()
            .filter(|k| !k.is_empty()),
        model: env::var(format!("{}_MODEL", prefix)).unwrap_or(defaults.model),
        rpm_limit: env_or(&format!("{}_RPM", prefix), defaults.rpm_limit)?,
        tpm_limit: env_or(&format!("{}_TPM", prefix), defaults.tpm_limit)?,
        ..defaults
    })
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_queue_policy() {
        let config = Config::default();
        assert_eq!(config.queue.max_jobs_per_run, 5);
        assert_eq!(config.queue.job_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.llm.providers.len(), 4);
        assert!(config.llm.providers.iter().all(|p| p.api_key.is_none()));
    }

    #[test]
    fn test_env_or_parses_and_reports_bad_values() {
        std::env::set_var("OXQ_TEST_PORT", "8080");
        assert_eq!(env_or("OXQ_TEST_PORT", 1u16).unwrap(), 8080);

        std::env::set_var("OXQ_TEST_BAD", "eighty");
        let err = env_or("OXQ_TEST_BAD", 1u16).unwrap_err();
        assert!(err.to_string().contains("OXQ_TEST_BAD"));

        assert_eq!(env_or("OXQ_TEST_UNSET", 7u32).unwrap(), 7);
    }

    #[test]
    fn test_admin_token_is_redacted() {
        let admin = AdminConfig {
            token: Some("hunter2".to_string()),
        };
        assert!(!format!("{:?}", admin).contains("hunter2"));
    }
}
