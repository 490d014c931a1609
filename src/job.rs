use crate::error::{Error, Result};
use crate::processor::ProcessError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, collections::HashMap, fmt, str::FromStr};

/// Job-specific data, opaque to the queue. Processors decode it into their own types.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Selects the processor that runs a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    SaveGeneration,
    SaveEpisode,
    SaveProject,
    CleanupCache,
    /// Any job type not known to this crate
    Custom(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            JobType::SaveGeneration => "SAVE_GENERATION",
            JobType::SaveEpisode => "SAVE_EPISODE",
            JobType::SaveProject => "SAVE_PROJECT",
            JobType::CleanupCache => "CLEANUP_CACHE",
            JobType::Custom(name) => name,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        match value {
            "SAVE_GENERATION" => JobType::SaveGeneration,
            "SAVE_EPISODE" => JobType::SaveEpisode,
            "SAVE_PROJECT" => JobType::SaveProject,
            "CLEANUP_CACHE" => JobType::CleanupCache,
            other => JobType::Custom(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        JobType::from(value.as_str())
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle state of a job.
///
/// `Pending -> Processing -> {Completed | Failed}`, then `Failed -> {Pending | Dead}`.
/// `Completed` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "DEAD" => Ok(JobStatus::Dead),
            other => Err(Error::CorruptRecord(format!("unknown job status '{}'", other))),
        }
    }
}

/// The durable unit of work tracked by the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: JobType,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        id: String,
        job_type: JobType,
        payload: Payload,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id,
            job_type,
            payload,
            created_at: Utc::now(),
            scheduled_at,
            attempt: 0,
            max_attempts,
            status: JobStatus::Pending,
            last_error: None,
            last_attempt_at: None,
            completed_at: None,
        }
    }

    /// Decode the payload into the job's own type
    pub fn decode_payload<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = serde_json::to_value(&self.payload)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Flatten the record into hash fields for the job store
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("job_type".to_string(), self.job_type.to_string()),
            ("payload".to_string(), serde_json::to_string(&self.payload)?),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("scheduled_at".to_string(), self.scheduled_at.to_rfc3339()),
            ("attempt".to_string(), self.attempt.to_string()),
            ("max_attempts".to_string(), self.max_attempts.to_string()),
            ("status".to_string(), self.status.to_string()),
        ];

        // Optional fields are written as empty strings so a later write clears them.
        fields.push((
            "last_error".to_string(),
            self.last_error.clone().unwrap_or_default(),
        ));
        fields.push((
            "last_attempt_at".to_string(),
            self.last_attempt_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        ));
        fields.push((
            "completed_at".to_string(),
            self.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ));

        Ok(fields)
    }

    /// Rebuild a record from the hash fields written by [`JobRecord::to_fields`]
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let payload: Payload = serde_json::from_str(required(fields, "payload")?)
            .map_err(|e| Error::CorruptRecord(format!("payload: {}", e)))?;

        Ok(Self {
            id: required(fields, "id")?.to_string(),
            job_type: JobType::from(required(fields, "job_type")?),
            payload,
            created_at: timestamp(required(fields, "created_at")?, "created_at")?,
            scheduled_at: timestamp(required(fields, "scheduled_at")?, "scheduled_at")?,
            attempt: number(fields, "attempt")?,
            max_attempts: number(fields, "max_attempts")?,
            status: required(fields, "status")?.parse()?,
            last_error: optional(fields, "last_error").map(str::to_string),
            last_attempt_at: optional(fields, "last_attempt_at")
                .map(|raw| timestamp(raw, "last_attempt_at"))
                .transpose()?,
            completed_at: optional(fields, "completed_at")
                .map(|raw| timestamp(raw, "completed_at"))
                .transpose()?,
        })
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::CorruptRecord(format!("missing field '{}'", name)))
}

fn optional<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn number(fields: &HashMap<String, String>, name: &str) -> Result<u32> {
    required(fields, name)?
        .parse()
        .map_err(|e| Error::CorruptRecord(format!("{}: {}", name, e)))
}

fn timestamp(raw: &str, name: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("{}: {}", name, e)))
}

/// Encode a serializable value as a job payload. The value must serialize to a JSON object.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(Error::Config(format!(
            "job payload must serialize to an object, got {}",
            other
        ))),
    }
}

/// A strongly typed job whose payload is one serializable struct.
///
/// Pair it with [`crate::processor::TypedProcessor`] to register it.
#[async_trait]
pub trait TypedJob: Serialize + DeserializeOwned + Send + Sync + fmt::Debug {
    /// The job type this payload is enqueued under
    fn job_type() -> JobType;

    /// Perform the side effect. Return `Err(ProcessError::Retryable)` to retry later.
    async fn process(&self) -> std::result::Result<(), ProcessError>;
}
