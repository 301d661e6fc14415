// Job definitions for the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// Job types and priorities
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Quick,
    SingleSummary,
    BatchSummary,
}

impl JobType {
    /// Round-robin order used by the dispatcher
    pub const ALL: [JobType; 3] = [JobType::Quick, JobType::SingleSummary, JobType::BatchSummary];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Quick => "quick",
            JobType::SingleSummary => "single-summary",
            JobType::BatchSummary => "batch-summary",
        }
    }

    /// Priority class: higher is dequeued first.
    pub fn priority(&self) -> i64 {
        match self {
            JobType::Quick => 10,
            JobType::SingleSummary => 5,
            JobType::BatchSummary => 1,
        }
    }

    /// Completion budget reserved on top of the prompt when estimating tokens
    pub fn output_budget(&self) -> u32 {
        match self {
            JobType::Quick => 512,
            JobType::SingleSummary => 1024,
            JobType::BatchSummary => 2048,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type: {}", s))
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Document {
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    #[validate(length(min = 1, max = 200_000))]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuickPayload {
    #[validate(length(min = 1, max = 8_000))]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 50_000))]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SingleSummaryPayload {
    #[validate(nested)]
    pub document: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2_000))]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchSummaryPayload {
    #[validate(length(min = 1, max = 20), nested)]
    pub documents: Vec<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 2_000))]
    pub instructions: Option<String>,
}

/// Job payload, discriminated by job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum JobData {
    Quick(QuickPayload),
    SingleSummary(SingleSummaryPayload),
    BatchSummary(BatchSummaryPayload),
}

impl JobData {
    pub fn job_type(&self) -> JobType {
        match self {
            JobData::Quick(_) => JobType::Quick,
            JobData::SingleSummary(_) => JobType::SingleSummary,
            JobData::BatchSummary(_) => JobType::BatchSummary,
        }
    }

    pub fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            JobData::Quick(p) => p.validate(),
            JobData::SingleSummary(p) => p.validate(),
            JobData::BatchSummary(p) => p.validate(),
        }
    }

    /// Rough token estimate (4 characters per token) plus the completion budget.
    pub fn estimated_tokens(&self) -> u64 {
        fn count(text: &str) -> usize {
            text.chars().count()
        }
        fn count_opt(text: &Option<String>) -> usize {
            text.as_deref().map_or(0, count)
        }

        let chars = match self {
            JobData::Quick(p) => count(&p.prompt) + count_opt(&p.context),
            JobData::SingleSummary(p) => count(&p.document.text) + count_opt(&p.instructions),
            JobData::BatchSummary(p) => {
                p.documents.iter().map(|d| count(&d.text)).sum::<usize>()
                    + count_opt(&p.instructions)
            }
        };
        (chars as u64).div_ceil(4) + self.job_type().output_budget() as u64
    }
}

// =============================================================================
// Job
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub data: JobData,
    pub created_at: DateTime<Utc>,
    pub client_id: String,
}

impl Job {
    pub fn new(data: JobData, client_id: impl Into<String>) -> Self {
        Self::with_created_at(data, client_id, Utc::now())
    }

    pub fn with_created_at(
        data: JobData,
        client_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
            created_at,
            client_id: client_id.into(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.data.job_type()
    }
}

// =============================================================================
// Status records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Status record as returned to callers. Clients must check `status`
/// before reading `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider that served the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// 1-based queue position, only filled while queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

impl StatusRecord {
    pub fn queued(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type(),
            status: JobStatus::Queued,
            created_at: job.created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            provider: None,
            position: None,
        }
    }
}

/// Partial update merged over a status record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl StatusUpdate {
    pub fn processing(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value, provider: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(Utc::now()),
            result: Some(result),
            provider: Some(provider.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(prompt: &str) -> JobData {
        JobData::Quick(QuickPayload {
            prompt: prompt.to_string(),
            context: None,
        })
    }

    #[test]
    fn test_job_data_wire_format() {
        let json = serde_json::json!({
            "type": "single-summary",
            "payload": {
                "document": { "name": "notes.txt", "text": "hello" }
            }
        });

        let data: JobData = serde_json::from_value(json).unwrap();
        assert_eq!(data.job_type(), JobType::SingleSummary);
        assert_eq!(data.job_type().priority(), 5);
    }

    #[test]
    fn test_job_type_parsing() {
        assert_eq!("batch-summary".parse::<JobType>().unwrap(), JobType::BatchSummary);
        assert!("chat".parse::<JobType>().is_err());
    }

    #[test]
    fn test_estimated_tokens_include_output_budget() {
        // 40 chars -> 10 tokens, plus the quick budget
        assert_eq!(quick(&"a".repeat(40)).estimated_tokens(), 10 + 512);
    }

    #[test]
    fn test_estimated_tokens_count_characters_not_bytes() {
        // 40 characters, 120 bytes in UTF-8
        let text = "日".repeat(40);
        assert_eq!(text.len(), 120);
        assert_eq!(quick(&text).estimated_tokens(), 10 + 512);
    }

    #[test]
    fn test_validation_rejects_empty_batch() {
        let data = JobData::BatchSummary(BatchSummaryPayload {
            documents: vec![],
            instructions: None,
        });
        assert!(data.validate().is_err());
        assert!(quick("hi").validate().is_ok());
        assert!(quick("").validate().is_err());
    }

    #[test]
    fn test_status_update_omits_unset_fields() {
        let update = StatusUpdate::processing(Utc::now());
        let value = serde_json::to_value(&update).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 2);
        assert_eq!(object["status"], "processing");
        assert!(object.contains_key("startedAt"));
    }
}
