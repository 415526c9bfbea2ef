//! CD workflows and their stage runners.
//!
//! A [`CdWorkflow`] is one deployment instance of an artifact on a pipeline.
//! Each of its stages (pre, deploy, post) executes at most once as a
//! [`CdWorkflowRunner`], whose status follows the state machine in
//! [`RunnerStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ArtifactId, PipelineId, ReservationId, RunnerId, WorkflowId};

/// Message used whenever a runner loses to a newer deployment of the same pipeline.
pub const NEW_DEPLOYMENT_INITIATED: &str = "new deployment initiated";

/// Message used when the pipeline disappears under an in-flight release.
pub const PIPELINE_DELETED: &str = "CD pipeline has been deleted";

/// Lifecycle of a workflow row created by the bulk trigger path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Accepted,
    Enqueued,
    DroppedStale,
    DequeueError,
    TriggerError,
    WfStarted,
    QueError,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Accepted => "accepted",
            WorkflowStatus::Enqueued => "enqueued",
            WorkflowStatus::DroppedStale => "dropped_stale",
            WorkflowStatus::DequeueError => "dequeue_error",
            WorkflowStatus::TriggerError => "trigger_error",
            WorkflowStatus::WfStarted => "wf_started",
            WorkflowStatus::QueError => "que_error",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "accepted" => WorkflowStatus::Accepted,
            "enqueued" => WorkflowStatus::Enqueued,
            "dropped_stale" => WorkflowStatus::DroppedStale,
            "dequeue_error" => WorkflowStatus::DequeueError,
            "trigger_error" => WorkflowStatus::TriggerError,
            "wf_started" => WorkflowStatus::WfStarted,
            "que_error" => WorkflowStatus::QueError,
            other => return Err(format!("unknown workflow status: {other}")),
        })
    }
}

/// A deployment instance grouping its pre/deploy/post runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdWorkflow {
    pub id: WorkflowId,
    pub pipeline_id: PipelineId,
    pub ci_artifact_id: ArtifactId,
    pub workflow_status: Option<WorkflowStatus>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    Pre,
    Deploy,
    Post,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Pre => "PRE",
            WorkflowType::Deploy => "DEPLOY",
            WorkflowType::Post => "POST",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "PRE" => Ok(WorkflowType::Pre),
            "DEPLOY" => Ok(WorkflowType::Deploy),
            "POST" => Ok(WorkflowType::Post),
            other => Err(crate::Error::InvalidInput(format!(
                "invalid CdWorkflowType {other} for the trigger request"
            ))),
        }
    }
}

/// Who executes a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorType {
    /// An Argo workflow in the target or the default namespace.
    #[serde(rename = "AWF")]
    ArgoWorkflow,
    /// Executed in-process (deploy runners) or as a plain Kubernetes job.
    #[serde(rename = "SYSTEM")]
    System,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::ArgoWorkflow => "AWF",
            ExecutorType::System => "SYSTEM",
        }
    }
}

impl std::str::FromStr for ExecutorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AWF" => Ok(ExecutorType::ArgoWorkflow),
            "SYSTEM" => Ok(ExecutorType::System),
            other => Err(format!("unknown executor type: {other}")),
        }
    }
}

/// Runner status.
///
/// `Initiated -> Queued -> Starting -> InProgress -> terminal`. Forward jumps
/// are allowed, backwards moves are not, and terminal statuses are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerStatus {
    Initiated,
    Queued,
    Starting,
    #[serde(rename = "Progressing")]
    InProgress,
    Succeeded,
    Failed,
    Aborted,
    Cancelled,
}

impl RunnerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Succeeded
                | RunnerStatus::Failed
                | RunnerStatus::Aborted
                | RunnerStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RunnerStatus::Initiated => 0,
            RunnerStatus::Queued => 1,
            RunnerStatus::Starting => 2,
            RunnerStatus::InProgress => 3,
            _ => 4,
        }
    }

    /// Whether a runner in this status may be moved to `next`.
    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Initiated => "Initiated",
            RunnerStatus::Queued => "Queued",
            RunnerStatus::Starting => "Starting",
            RunnerStatus::InProgress => "Progressing",
            RunnerStatus::Succeeded => "Succeeded",
            RunnerStatus::Failed => "Failed",
            RunnerStatus::Aborted => "Aborted",
            RunnerStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Initiated" => RunnerStatus::Initiated,
            "Queued" => RunnerStatus::Queued,
            "Starting" => RunnerStatus::Starting,
            "Progressing" | "Running" => RunnerStatus::InProgress,
            "Succeeded" | "Healthy" => RunnerStatus::Succeeded,
            "Failed" | "Error" | "Degraded" => RunnerStatus::Failed,
            "Aborted" => RunnerStatus::Aborted,
            "Cancelled" => RunnerStatus::Cancelled,
            other => return Err(format!("unknown runner status: {other}")),
        })
    }
}

/// One execution of one stage of a [`CdWorkflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdWorkflowRunner {
    pub id: RunnerId,
    pub workflow_id: WorkflowId,
    pub pipeline_id: PipelineId,
    pub workflow_type: WorkflowType,
    pub executor_type: ExecutorType,
    /// Executor-side name of the submitted workflow.
    pub name: String,
    pub status: RunnerStatus,
    pub message: String,
    pub pod_status: Option<String>,
    pub pod_name: Option<String>,
    pub triggered_by: i64,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub namespace: String,
    pub log_location: Option<String>,
    pub image_path_reservation_ids: Vec<ReservationId>,
    /// For post stages, the deploy runner this stage follows.
    pub ref_runner_id: Option<RunnerId>,
    /// Message id of the event that created this runner.
    pub reference_id: Option<String>,
}

/// Attributes for inserting a runner row.
#[derive(Debug, Clone)]
pub struct NewRunner {
    pub workflow_id: WorkflowId,
    pub pipeline_id: PipelineId,
    pub workflow_type: WorkflowType,
    pub executor_type: ExecutorType,
    pub name: String,
    pub status: RunnerStatus,
    pub triggered_by: i64,
    pub started_on: DateTime<Utc>,
    pub namespace: String,
    pub log_location: Option<String>,
    pub ref_runner_id: Option<RunnerId>,
    pub reference_id: Option<String>,
}

impl NewRunner {
    /// A deploy runner, always executed by the system.
    pub fn deploy(
        workflow_id: WorkflowId,
        pipeline_id: PipelineId,
        name: impl Into<String>,
        namespace: impl Into<String>,
        triggered_by: i64,
        reference_id: Option<String>,
    ) -> Self {
        Self {
            workflow_id,
            pipeline_id,
            workflow_type: WorkflowType::Deploy,
            executor_type: ExecutorType::System,
            name: name.into(),
            status: RunnerStatus::Initiated,
            triggered_by,
            started_on: Utc::now(),
            namespace: namespace.into(),
            log_location: None,
            ref_runner_id: None,
            reference_id,
        }
    }
}
