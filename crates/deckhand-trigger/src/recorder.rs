//! Status and timeline recorder.
//!
//! The only writer of runner status and timeline rows. Terminal statuses are
//! sinks: writing over one is a logged no-op, and every terminal write carries
//! its terminal timeline entry in the same transaction.

use chrono::Utc;
use deckhand_core::error::truncate_message;
use deckhand_core::executor::WorkflowStatusEvent;
use deckhand_core::release::DeploymentOutcome;
use deckhand_core::timeline::{
    DESCRIPTION_DEPLOYMENT_SUPERSEDED, DESCRIPTION_VULNERABLE_IMAGE, TimelineEntry, TimelineStatus,
};
use deckhand_core::workflow::{CdWorkflowRunner, NEW_DEPLOYMENT_INITIATED, RunnerStatus};
use deckhand_core::{Result, RunnerId};
use deckhand_db::{StatusRepo, StatusUpdate, WorkflowRepo};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deps::Collaborators;

pub struct StatusRecorder {
    workflows: Arc<dyn WorkflowRepo>,
    statuses: Arc<dyn StatusRepo>,
}

impl StatusRecorder {
    pub fn new(workflows: Arc<dyn WorkflowRepo>, statuses: Arc<dyn StatusRepo>) -> Self {
        Self {
            workflows,
            statuses,
        }
    }

    pub fn from_collaborators(deps: &Collaborators) -> Self {
        Self::new(deps.workflows.clone(), deps.statuses.clone())
    }

    /// Build the write that moves `runner` to `status`, or `None` when the
    /// state machine forbids it.
    fn transition(
        runner: &CdWorkflowRunner,
        status: RunnerStatus,
        message: &str,
        detail: Option<&str>,
    ) -> Option<StatusUpdate> {
        if runner.status.is_terminal() {
            warn!(
                runner_id = %runner.id,
                current = %runner.status,
                requested = %status,
                "Runner already terminal, ignoring status write"
            );
            return None;
        }
        if !runner.status.can_transition_to(status) {
            debug!(
                runner_id = %runner.id,
                current = %runner.status,
                requested = %status,
                "Ignoring backwards status write"
            );
            return None;
        }

        let mut next = runner.clone();
        next.status = status;
        next.message = truncate_message(message);
        let timeline = if status.is_terminal() {
            next.finished_on = Some(Utc::now());
            TimelineStatus::for_terminal_runner(status, message).map(|entry| {
                let detail = match (detail, entry) {
                    (Some(detail), _) => detail.to_string(),
                    (None, TimelineStatus::DeploymentSuperseded) => {
                        DESCRIPTION_DEPLOYMENT_SUPERSEDED.to_string()
                    }
                    (None, _) => message.to_string(),
                };
                TimelineEntry::new(runner.id, entry, detail)
            })
        } else {
            None
        };
        Some(StatusUpdate {
            runner: next,
            timeline,
        })
    }

    async fn write(&self, update: StatusUpdate) -> Result<bool> {
        let applied = self.statuses.save_statuses(std::slice::from_ref(&update)).await?;
        Ok(applied.first().copied().unwrap_or(false))
    }

    /// Move a runner to `status`. Terminal statuses get their timeline entry
    /// with `message` as detail. Returns whether anything was written.
    pub async fn set_runner_status(
        &self,
        runner_id: RunnerId,
        status: RunnerStatus,
        message: &str,
    ) -> Result<bool> {
        self.finish(runner_id, status, message, None).await
    }

    /// Like [`set_runner_status`](Self::set_runner_status) with an explicit
    /// timeline detail for the terminal entry.
    pub async fn finish(
        &self,
        runner_id: RunnerId,
        status: RunnerStatus,
        message: &str,
        detail: Option<&str>,
    ) -> Result<bool> {
        let runner = self.workflows.get_runner(runner_id).await?;
        let Some(update) = Self::transition(&runner, status, message, detail) else {
            return Ok(false);
        };
        let written = self.write(update).await?;
        if written {
            info!(runner_id = %runner_id, status = %status, "Runner status updated");
        }
        Ok(written)
    }

    /// Terminate a runner with a deployment outcome.
    pub async fn record_outcome(
        &self,
        runner_id: RunnerId,
        outcome: &DeploymentOutcome,
    ) -> Result<bool> {
        if let DeploymentOutcome::SupersededBy(Some(by)) = outcome {
            info!(runner_id = %runner_id, superseded_by = %by, "Runner superseded");
        }
        self.finish(runner_id, outcome.runner_status(), &outcome.message(), None)
            .await
    }

    /// Fail a runner whose image digest matched a blocked CVE.
    pub async fn fail_vulnerable(&self, runner_id: RunnerId, image_digest: &str) -> Result<bool> {
        self.finish(
            runner_id,
            RunnerStatus::Failed,
            &format!("found vulnerability for image digest {image_digest}"),
            Some(DESCRIPTION_VULNERABLE_IMAGE),
        )
        .await
    }

    pub async fn append_timeline(
        &self,
        runner_id: RunnerId,
        status: TimelineStatus,
        detail: &str,
    ) -> Result<bool> {
        let written = self
            .statuses
            .append_timeline(&TimelineEntry::new(runner_id, status, detail))
            .await?;
        if !written {
            debug!(runner_id = %runner_id, status = %status, "Timeline closed, entry dropped");
        }
        Ok(written)
    }

    pub async fn timelines(&self, runner_id: RunnerId) -> Result<Vec<TimelineEntry>> {
        Ok(self.statuses.timelines(runner_id).await?)
    }

    /// Move a deploy runner to `Starting`, failing every older non-terminal
    /// deploy runner of the same pipeline in the same transaction.
    ///
    /// Returns the ids of the superseded runners. Fails with `Cancelled` when
    /// the runner itself is already terminal.
    pub async fn start_deploy(&self, runner_id: RunnerId) -> Result<Vec<RunnerId>> {
        let runner = self.workflows.get_runner(runner_id).await?;
        let older = self
            .workflows
            .non_terminal_deploy_runners(runner.pipeline_id, runner.id)
            .await?;

        let mut updates: Vec<StatusUpdate> = older
            .iter()
            .filter_map(|r| {
                Self::transition(r, RunnerStatus::Failed, NEW_DEPLOYMENT_INITIATED, None)
            })
            .collect();
        let superseded: Vec<RunnerId> = updates.iter().map(|u| u.runner.id).collect();
        match Self::transition(&runner, RunnerStatus::Starting, "", None) {
            Some(update) => updates.push(update),
            None if runner.status.is_terminal() => {
                return Err(deckhand_core::Error::Cancelled(format!(
                    "runner {} is already {}",
                    runner.id, runner.status
                )));
            }
            None => {}
        }

        let applied = self.statuses.save_statuses(&updates).await?;
        let superseded: Vec<RunnerId> = superseded
            .into_iter()
            .zip(applied)
            .filter_map(|(id, written)| written.then_some(id))
            .collect();
        for id in &superseded {
            info!(runner_id = %id, superseded_by = %runner.id, "Superseded older deploy runner");
        }
        Ok(superseded)
    }

    /// Fail every non-terminal deploy runner older than `runner_id`.
    pub async fn supersede_older(&self, runner_id: RunnerId) -> Result<Vec<RunnerId>> {
        let runner = self.workflows.get_runner(runner_id).await?;
        let older = self
            .workflows
            .non_terminal_deploy_runners(runner.pipeline_id, runner.id)
            .await?;
        let updates: Vec<StatusUpdate> = older
            .iter()
            .filter_map(|r| {
                Self::transition(r, RunnerStatus::Failed, NEW_DEPLOYMENT_INITIATED, None)
            })
            .collect();
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<RunnerId> = updates.iter().map(|u| u.runner.id).collect();
        let applied = self.statuses.save_statuses(&updates).await?;
        Ok(ids
            .into_iter()
            .zip(applied)
            .filter_map(|(id, written)| written.then_some(id))
            .collect())
    }

    /// Reduce an executor status event onto its runner.
    ///
    /// The node built from `template_name` supplies pod name, pod status and
    /// message; the workflow phase supplies the status. Returns the updated
    /// runner when something changed, `None` for unknown workflows and no-op
    /// events.
    pub async fn apply_workflow_event(
        &self,
        event: &WorkflowStatusEvent,
        template_name: &str,
    ) -> Result<Option<CdWorkflowRunner>> {
        let Some(runner) = self.workflows.find_runner_by_name(&event.name).await? else {
            debug!(workflow = %event.name, "Status event for unknown workflow");
            return Ok(None);
        };
        let (pod_name, node) = event.pod_node(template_name)?;

        let status = event.phase.runner_status();
        let pod_status = node.phase.as_str();
        let message = if node.message.is_empty() {
            event.message.as_str()
        } else {
            node.message.as_str()
        };

        let changed = runner.status != status
            || runner.pod_status.as_deref() != Some(pod_status)
            || runner.message != truncate_message(message)
            || (event.finished_at.is_some() && runner.finished_on != event.finished_at);
        if !changed {
            return Ok(None);
        }

        let mut base = runner.clone();
        base.pod_name = Some(pod_name.to_string());
        base.pod_status = Some(pod_status.to_string());
        let Some(mut update) = Self::transition(&base, status, message, None) else {
            return Ok(None);
        };
        if event.finished_at.is_some() {
            update.runner.finished_on = event.finished_at;
        }
        let next = update.runner.clone();
        if self.write(update).await? {
            debug!(runner_id = %next.id, status = %next.status, pod = pod_name, "Applied workflow event");
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }
}
