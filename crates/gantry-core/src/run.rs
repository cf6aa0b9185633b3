//! Run and execution types.

use crate::condition::OutputValue;
use crate::error::{ConditionResolutionError, ConsolidationConflictError, JobExecutionError};
use crate::ids::{JobKey, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Blocked,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Skipped | StageStatus::Succeeded | StageStatus::Failed
        )
    }

    /// Whether a dependency edge onto a stage in this state is satisfied.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }
}

/// Why a stage ended up skipped or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageReason {
    ConditionFalse,
    DependencyFailed { dependency: String },
    ConditionUnresolved { error: ConditionResolutionError },
    ConsolidationConflict { error: ConsolidationConflictError },
    JobsFailed { jobs: Vec<JobKey> },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// Failed, but the job is marked `continue_on_error`.
    SucceededWithIssues,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether the job lets its stage succeed.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::SucceededWithIssues)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub key: JobKey,
    pub job: String,
    pub instance: Option<String>,
    pub status: JobStatus,
    pub error: Option<JobExecutionError>,
    pub steps: Vec<StepReport>,
    /// `task.name` to value.
    pub outputs: BTreeMap<String, OutputValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub display_name: Option<String>,
    pub status: StageStatus,
    pub reason: Option<StageReason>,
    pub jobs: Vec<JobReport>,
    /// Consolidated inputs handed to the stage's jobs.
    pub inputs: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StageReport {
    pub fn pending(name: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            name: name.into(),
            display_name,
            status: StageStatus::Pending,
            reason: None,
            jobs: vec![],
            inputs: vec![],
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn job(&self, key: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.key.as_str() == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPublication {
    pub name: String,
    pub producer: JobKey,
    pub stage: String,
    pub always: bool,
    pub files: usize,
    #[serde(flatten)]
    pub outcome: PublishOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub stage: String,
    pub job: JobKey,
    pub task: String,
    pub name: String,
    pub value: OutputValue,
}

/// Audit record of a finished run, produced whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    pub artifacts: Vec<ArtifactPublication>,
    pub outputs: Vec<OutputRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
