//! Deployment status timeline.
//!
//! Each runner has an append-only, time-ordered log of state transitions.
//! Once an entry with a terminal status exists, nothing more is appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunnerId;
use crate::workflow::{NEW_DEPLOYMENT_INITIATED, RunnerStatus};

pub const DESCRIPTION_DEPLOYMENT_INITIATED: &str = "Deployment initiated successfully.";
pub const DESCRIPTION_REQUEST_VALIDATED: &str = "Deployment trigger request validated.";
pub const DESCRIPTION_DEPLOYMENT_TRIGGERED: &str = "Deployment triggered successfully.";
pub const DESCRIPTION_VULNERABLE_IMAGE: &str = "Deployment failed: Vulnerability policy violated.";
pub const DESCRIPTION_DEPLOYMENT_SUPERSEDED: &str =
    "Deployment superseded: new deployment initiated.";
pub const DESCRIPTION_GIT_COMMIT: &str = "Git commit done successfully.";
pub const DESCRIPTION_ARGOCD_SYNC_INITIATED: &str = "Argocd sync initiated.";
pub const DESCRIPTION_ARGOCD_SYNC_COMPLETED: &str = "Argocd sync completed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineStatus {
    DeploymentInitiated,
    DeploymentRequestValidated,
    DeploymentTriggered,
    GitCommit,
    GitCommitFailed,
    ArgocdSyncInitiated,
    ArgocdSyncCompleted,
    KubectlApplyStarted,
    KubectlApplySynced,
    AppHealthy,
    AppDegraded,
    DeploymentFailed,
    DeploymentSuperseded,
    DeploymentAborted,
    DeploymentCancelled,
    FetchTimedOut,
    UnableToFetchStatus,
}

impl TimelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TimelineStatus::AppHealthy
                | TimelineStatus::DeploymentFailed
                | TimelineStatus::DeploymentSuperseded
                | TimelineStatus::DeploymentAborted
                | TimelineStatus::DeploymentCancelled
                | TimelineStatus::FetchTimedOut
                | TimelineStatus::UnableToFetchStatus
        )
    }

    /// The terminal entry matching a runner that ended in `status` with `message`.
    ///
    /// Returns `None` for non-terminal runner statuses.
    pub fn for_terminal_runner(status: RunnerStatus, message: &str) -> Option<Self> {
        match status {
            RunnerStatus::Succeeded => Some(TimelineStatus::AppHealthy),
            RunnerStatus::Failed if message == NEW_DEPLOYMENT_INITIATED => {
                Some(TimelineStatus::DeploymentSuperseded)
            }
            RunnerStatus::Failed => Some(TimelineStatus::DeploymentFailed),
            RunnerStatus::Aborted => Some(TimelineStatus::DeploymentAborted),
            RunnerStatus::Cancelled => Some(TimelineStatus::DeploymentCancelled),
            _ => None,
        }
    }

    /// The runner status a terminal timeline entry corresponds to.
    pub fn runner_status(&self) -> Option<RunnerStatus> {
        match self {
            TimelineStatus::AppHealthy => Some(RunnerStatus::Succeeded),
            TimelineStatus::DeploymentFailed
            | TimelineStatus::DeploymentSuperseded
            | TimelineStatus::FetchTimedOut
            | TimelineStatus::UnableToFetchStatus => Some(RunnerStatus::Failed),
            TimelineStatus::DeploymentAborted => Some(RunnerStatus::Aborted),
            TimelineStatus::DeploymentCancelled => Some(RunnerStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineStatus::DeploymentInitiated => "DEPLOYMENT_INITIATED",
            TimelineStatus::DeploymentRequestValidated => "DEPLOYMENT_REQUEST_VALIDATED",
            TimelineStatus::DeploymentTriggered => "DEPLOYMENT_TRIGGERED",
            TimelineStatus::GitCommit => "GIT_COMMIT",
            TimelineStatus::GitCommitFailed => "GIT_COMMIT_FAILED",
            TimelineStatus::ArgocdSyncInitiated => "ARGOCD_SYNC_INITIATED",
            TimelineStatus::ArgocdSyncCompleted => "ARGOCD_SYNC_COMPLETED",
            TimelineStatus::KubectlApplyStarted => "KUBECTL_APPLY_STARTED",
            TimelineStatus::KubectlApplySynced => "KUBECTL_APPLY_SYNCED",
            TimelineStatus::AppHealthy => "HEALTHY",
            TimelineStatus::AppDegraded => "DEGRADED",
            TimelineStatus::DeploymentFailed => "FAILED",
            TimelineStatus::DeploymentSuperseded => "DEPLOYMENT_SUPERSEDED",
            TimelineStatus::DeploymentAborted => "ABORTED",
            TimelineStatus::DeploymentCancelled => "CANCELLED",
            TimelineStatus::FetchTimedOut => "TIMED_OUT",
            TimelineStatus::UnableToFetchStatus => "UNABLE_TO_FETCH_STATUS",
        }
    }
}

impl std::fmt::Display for TimelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TimelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DEPLOYMENT_INITIATED" => TimelineStatus::DeploymentInitiated,
            "DEPLOYMENT_REQUEST_VALIDATED" => TimelineStatus::DeploymentRequestValidated,
            "DEPLOYMENT_TRIGGERED" => TimelineStatus::DeploymentTriggered,
            "GIT_COMMIT" => TimelineStatus::GitCommit,
            "GIT_COMMIT_FAILED" => TimelineStatus::GitCommitFailed,
            "ARGOCD_SYNC_INITIATED" => TimelineStatus::ArgocdSyncInitiated,
            "ARGOCD_SYNC_COMPLETED" => TimelineStatus::ArgocdSyncCompleted,
            "KUBECTL_APPLY_STARTED" => TimelineStatus::KubectlApplyStarted,
            "KUBECTL_APPLY_SYNCED" => TimelineStatus::KubectlApplySynced,
            "HEALTHY" => TimelineStatus::AppHealthy,
            "DEGRADED" => TimelineStatus::AppDegraded,
            "FAILED" => TimelineStatus::DeploymentFailed,
            "DEPLOYMENT_SUPERSEDED" => TimelineStatus::DeploymentSuperseded,
            "ABORTED" => TimelineStatus::DeploymentAborted,
            "CANCELLED" => TimelineStatus::DeploymentCancelled,
            "TIMED_OUT" => TimelineStatus::FetchTimedOut,
            "UNABLE_TO_FETCH_STATUS" => TimelineStatus::UnableToFetchStatus,
            other => return Err(format!("unknown timeline status: {other}")),
        })
    }
}

/// One timeline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub runner_id: RunnerId,
    pub status: TimelineStatus,
    pub status_detail: String,
    pub status_time: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(runner_id: RunnerId, status: TimelineStatus, detail: impl Into<String>) -> Self {
        Self {
            runner_id,
            status,
            status_detail: crate::error::truncate_message(&detail.into()),
            status_time: Utc::now(),
        }
    }
}

/// What an existing timeline says about a release that is about to be shipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseProgress {
    /// A terminal entry or `DEPLOYMENT_TRIGGERED` exists: nothing left to do.
    pub already_done: bool,
    pub request_validated: bool,
    pub git_committed: bool,
    pub sync_completed: bool,
}

impl ReleaseProgress {
    pub fn from_entries(entries: &[TimelineEntry]) -> Self {
        let mut progress = Self::default();
        for entry in entries {
            match entry.status {
                s if s.is_terminal() => progress.already_done = true,
                TimelineStatus::DeploymentTriggered => progress.already_done = true,
                TimelineStatus::DeploymentRequestValidated => progress.request_validated = true,
                TimelineStatus::GitCommit | TimelineStatus::ArgocdSyncInitiated => {
                    progress.git_committed = true
                }
                TimelineStatus::ArgocdSyncCompleted => progress.sync_completed = true,
                _ => {}
            }
        }
        progress
    }
}
