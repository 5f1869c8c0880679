use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Identifier of an item targeted by a bulk operation (job id or serial)
pub type ItemId = String;

// Lenient wire helpers: a malformed optional field degrades to None
// instead of rejecting the whole record.

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Like `lenient_string`, but absent or null values become an empty string
fn lenient_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => parse_timestamp(&s),
        _ => None,
    })
}

/// Parse an RFC 3339 timestamp, accepting naive timestamps as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Status Models
// ============================================================================

/// JobStatus represents the lifecycle state of a job definition
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "serde_json::Value", into = "String")]
pub enum JobStatus {
    Draft,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    #[default]
    Unknown,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Draft => write!(f, "draft"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(JobStatus::Draft),
            "scheduled" | "pending" | "queued" => Ok(JobStatus::Scheduled),
            "running" | "in_progress" => Ok(JobStatus::Running),
            "completed" | "success" | "succeeded" => Ok(JobStatus::Completed),
            "failed" | "error" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" | "terminated" => Ok(JobStatus::Cancelled),
            "paused" => Ok(JobStatus::Paused),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(JobStatus::Unknown)
    }
}

impl From<serde_json::Value> for JobStatus {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => s.into(),
            _ => JobStatus::Unknown,
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.to_string()
    }
}

/// RunStatus represents the state of an execution or a single action result
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "serde_json::Value", into = "String")]
pub enum RunStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    #[default]
    Unknown,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Scheduled => write!(f, "scheduled"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" | "pending" | "queued" => Ok(RunStatus::Scheduled),
            "running" | "in_progress" => Ok(RunStatus::Running),
            "completed" | "success" | "succeeded" => Ok(RunStatus::Completed),
            "failed" | "error" | "timeout" => Ok(RunStatus::Failed),
            "cancelled" | "canceled" | "terminated" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(RunStatus::Unknown)
    }
}

impl From<serde_json::Value> for RunStatus {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => s.into(),
            _ => RunStatus::Unknown,
        }
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.to_string()
    }
}

impl From<RunStatus> for JobStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Scheduled => JobStatus::Scheduled,
            RunStatus::Running => JobStatus::Running,
            RunStatus::Completed => JobStatus::Completed,
            RunStatus::Failed => JobStatus::Failed,
            RunStatus::Cancelled => JobStatus::Cancelled,
            RunStatus::Unknown => JobStatus::Unknown,
        }
    }
}

// ============================================================================
// Job Models
// ============================================================================

/// Job is a user-defined unit of automation executed against one or more targets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub serial: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution: Option<ExecutionSummary>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Identifier used by the safety endpoints: the serial when known, else the id
    pub fn identifier(&self) -> ItemId {
        self.serial.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// True when `item` names this job by serial or by numeric id
    pub fn matches_item(&self, item: &str) -> bool {
        self.serial.as_deref() == Some(item) || self.id.to_string() == item
    }

    /// Only running jobs can be force-terminated
    pub fn is_terminable(&self) -> bool {
        self.status == JobStatus::Running
    }
}

/// Summary of the latest execution embedded in a job listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    #[serde(default)]
    pub execution_number: u64,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Execution Models
// ============================================================================

/// Execution is one run of a job; it exclusively owns its branches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub job_id: i64,
    pub execution_number: u64,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub stats: ExecutionStats,
}

impl Execution {
    /// Derived serial in the `{job_id}_{execution_number}` form
    pub fn execution_serial(&self) -> String {
        format!("{}_{}", self.job_id, self.execution_number)
    }
}

/// Branch is the sub-run of an execution against a single target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    /// Empty when the server omitted it; re-keyed on normalization
    #[serde(default, deserialize_with = "lenient_key")]
    pub branch_serial: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionResult>,
    #[serde(default)]
    pub stats: BranchStats,
}

/// Per-branch counters; `completed + failed + running <= total` always holds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
}

/// Per-execution counters summed over branches
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub branches: usize,
    pub actions: BranchStats,
}

/// ActionResult is one executable step within a branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    #[serde(default)]
    pub id: i64,
    /// Back-reference to the owning branch, never an ownership edge
    #[serde(default, deserialize_with = "lenient_key")]
    pub branch_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action_order: Option<String>,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub command_executed: Option<String>,
    #[serde(default)]
    pub result_output: Option<String>,
    #[serde(default)]
    pub result_error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
}

/// Flat wire record returned by the action-results endpoint.
///
/// Each concept has one canonical field name. Older server builds used
/// other names; they are accepted as aliases here and nowhere else.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionResultWire {
    #[serde(default)]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub branch_serial: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub branch_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub target_id: Option<String>,
    #[serde(default, alias = "target", alias = "hostname")]
    pub target_name: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default, alias = "order", deserialize_with = "lenient_string")]
    pub action_order: Option<String>,
    #[serde(default, alias = "name")]
    pub action_name: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, alias = "command", alias = "cmd", alias = "script")]
    pub command_executed: Option<String>,
    #[serde(default, alias = "output", alias = "stdout")]
    pub result_output: Option<String>,
    #[serde(default, alias = "error", alias = "stderr")]
    pub result_error: Option<String>,
    #[serde(default, alias = "duration_ms")]
    pub execution_time_ms: Option<i64>,
}

// ============================================================================
// Remote Response Models
// ============================================================================

/// Body returned by the safety endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteOutcome {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default, alias = "message")]
    pub detail: Option<String>,
}

/// Body returned by the safety health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub health_status: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.health_status.eq_ignore_ascii_case("healthy")
    }
}
