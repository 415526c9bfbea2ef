//! Async release coordinator.
//!
//! Serialises releases per pipeline: starting a release cancels an older one
//! in flight for the same pipeline, a release older than the one in flight
//! never starts, and redelivered async-deploy messages are
//! dropped while their runner is being processed. Every release ends in one
//! [`DeploymentOutcome`] written through the recorder.

use chrono::{DateTime, Utc};
use deckhand_core::deployer::{AppHealth, HelmAppIdentifier, HelmReleaseState, ReleaseStatus};
use deckhand_core::events::{AsyncCdDeployEvent, publish_json, topics};
use deckhand_core::pipeline::{DeploymentAppType, Pipeline};
use deckhand_core::release::{DeploymentOutcome, ValuesOverrideRequest};
use deckhand_core::workflow::{
    CdWorkflowRunner, NEW_DEPLOYMENT_INITIATED, PIPELINE_DELETED, RunnerStatus, WorkflowType,
};
use deckhand_core::{Error, PipelineId, Result, RunnerId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::deps::Collaborators;
use crate::recorder::StatusRecorder;
use crate::release::{ReleaseEngine, ReleaseReport};

/// Why a release context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer release of the same pipeline started.
    Superseded(RunnerId),
    PipelineDeleted,
    /// The process is stopping; the runner is left for recovery.
    Shutdown,
}

impl CancelReason {
    fn outcome(&self) -> Option<DeploymentOutcome> {
        match self {
            CancelReason::Superseded(_) => {
                Some(DeploymentOutcome::Canceled(NEW_DEPLOYMENT_INITIATED.to_string()))
            }
            CancelReason::PipelineDeleted => {
                Some(DeploymentOutcome::Canceled(PIPELINE_DELETED.to_string()))
            }
            CancelReason::Shutdown => None,
        }
    }
}

struct ReleaseContext {
    runner_id: RunnerId,
    cancel: watch::Sender<Option<CancelReason>>,
}

enum Registration {
    Active(watch::Receiver<Option<CancelReason>>),
    /// A newer runner of the pipeline is already releasing.
    Superseded(RunnerId),
}

enum Attempt {
    Finished(Result<ReleaseReport>),
    TimedOut,
    Cancelled(CancelReason),
}

/// Map a Helm release status onto a terminal outcome, if it is one.
///
/// A deployed release only counts when it was deployed after `started_on`;
/// an older deployment belongs to a previous release.
pub fn outcome_from_release(
    status: &ReleaseStatus,
    started_on: DateTime<Utc>,
) -> Option<DeploymentOutcome> {
    match status.state {
        HelmReleaseState::Deployed => {
            let fresh = status.last_deployed.is_some_and(|t| t > started_on);
            let healthy = status.app_health == Some(AppHealth::Healthy);
            (fresh && healthy).then_some(DeploymentOutcome::Succeeded)
        }
        HelmReleaseState::Superseded => Some(DeploymentOutcome::SupersededBy(None)),
        HelmReleaseState::Failed => Some(DeploymentOutcome::FailedWith(status.description.clone())),
        _ => None,
    }
}

fn helm_app(pipeline: &Pipeline) -> HelmAppIdentifier {
    HelmAppIdentifier {
        cluster_id: pipeline.cluster_id,
        namespace: pipeline.namespace.clone(),
        release_name: pipeline.app_release_name(),
    }
}

async fn cancelled(rx: &mut watch::Receiver<Option<CancelReason>>) -> CancelReason {
    loop {
        if let Some(reason) = *rx.borrow_and_update() {
            return reason;
        }
        if rx.changed().await.is_err() {
            // context dropped without a cancel
            std::future::pending::<()>().await;
        }
    }
}

pub struct ReleaseCoordinator {
    deps: Collaborators,
    engine: ReleaseEngine,
    recorder: StatusRecorder,
    contexts: Mutex<HashMap<PipelineId, ReleaseContext>>,
    in_flight: Mutex<HashSet<RunnerId>>,
}

/// Holds a runner id in the in-flight set until dropped.
pub struct InFlightClaim<'a> {
    coordinator: &'a ReleaseCoordinator,
    runner_id: RunnerId,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.coordinator.in_flight.lock() {
            set.remove(&self.runner_id);
        }
    }
}

struct ContextGuard<'a> {
    coordinator: &'a ReleaseCoordinator,
    pipeline_id: PipelineId,
    runner_id: RunnerId,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut contexts) = self.coordinator.contexts.lock() {
            if contexts
                .get(&self.pipeline_id)
                .is_some_and(|c| c.runner_id == self.runner_id)
            {
                contexts.remove(&self.pipeline_id);
            }
        }
    }
}

impl ReleaseCoordinator {
    pub fn new(deps: &Collaborators) -> Self {
        Self {
            deps: deps.clone(),
            engine: ReleaseEngine::new(deps),
            recorder: StatusRecorder::from_collaborators(deps),
            contexts: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a runner for processing; `None` when it is already in flight.
    pub fn claim(&self, runner_id: RunnerId) -> Option<InFlightClaim<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(runner_id) {
            return None;
        }
        Some(InFlightClaim {
            coordinator: self,
            runner_id,
        })
    }

    /// Runner currently releasing for the pipeline.
    pub fn in_flight_runner(&self, pipeline_id: PipelineId) -> Option<RunnerId> {
        let contexts = self.contexts.lock().ok()?;
        contexts.get(&pipeline_id).map(|c| c.runner_id)
    }

    /// Install a context for `runner_id`, cancelling the pipeline's previous
    /// one when it belongs to an older runner.
    ///
    /// A newer runner already in flight keeps its context and the incoming
    /// runner gets [`Registration::Superseded`].
    fn register(&self, pipeline_id: PipelineId, runner_id: RunnerId) -> Result<Registration> {
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| Error::Internal("release context map poisoned".to_string()))?;
        if let Some(current) = contexts.get(&pipeline_id) {
            if current.runner_id > runner_id {
                return Ok(Registration::Superseded(current.runner_id));
            }
        }

        let (tx, rx) = watch::channel(None);
        if let Some(previous) = contexts.insert(
            pipeline_id,
            ReleaseContext {
                runner_id,
                cancel: tx,
            },
        ) {
            if previous.runner_id != runner_id {
                info!(
                    pipeline_id = %pipeline_id,
                    cancelled = %previous.runner_id,
                    by = %runner_id,
                    "Cancelling in-flight release"
                );
                let _ = previous
                    .cancel
                    .send(Some(CancelReason::Superseded(runner_id)));
            }
        }
        Ok(Registration::Active(rx))
    }

    /// Run one release to a terminal outcome or `InProgress`.
    ///
    /// Returns the release counter when the release shipped. On failure the
    /// runner has already been terminated with the matching outcome.
    pub async fn execute(&self, request: &ValuesOverrideRequest) -> Result<Option<i64>> {
        let runner_id = request.wfr_id.ok_or_else(|| {
            Error::InvalidInput("values override request has no runner".to_string())
        })?;
        let runner = self.deps.workflows.get_runner(runner_id).await?;
        let pipeline_id = runner.pipeline_id;

        let mut cancel_rx = match self.register(pipeline_id, runner_id)? {
            Registration::Active(rx) => rx,
            Registration::Superseded(newer) => {
                info!(runner_id = %runner_id, newer = %newer, "Newer release in flight, not starting");
                self.recorder
                    .record_outcome(runner_id, &DeploymentOutcome::SupersededBy(Some(newer)))
                    .await?;
                return Err(Error::Cancelled(format!(
                    "runner {runner_id} superseded by in-flight runner {newer}"
                )));
            }
        };
        let _context = ContextGuard {
            coordinator: self,
            pipeline_id,
            runner_id,
        };
        self.recorder.start_deploy(runner_id).await?;

        let limit = self.deps.config.chart_install_timeout;
        let attempt = tokio::select! {
            result = tokio::time::timeout(limit, self.engine.release(request)) => match result {
                Ok(result) => Attempt::Finished(result),
                Err(_) => Attempt::TimedOut,
            },
            reason = cancelled(&mut cancel_rx) => Attempt::Cancelled(reason),
        };

        match attempt {
            Attempt::Finished(Ok(report)) => {
                if let ReleaseReport::Shipped { .. } = report {
                    if let Err(e) = self.recorder.supersede_older(runner_id).await {
                        warn!(runner_id = %runner_id, error = %e, "Failed to supersede older runners");
                    }
                }
                Ok(report.release_counter())
            }
            Attempt::Finished(Err(Error::DeadlineExceeded(_))) | Attempt::TimedOut => {
                self.finish_timed_out(&runner).await
            }
            Attempt::Finished(Err(Error::Cancelled(reason))) => {
                self.recorder
                    .record_outcome(
                        runner_id,
                        &DeploymentOutcome::Canceled(NEW_DEPLOYMENT_INITIATED.to_string()),
                    )
                    .await?;
                Err(Error::Cancelled(reason))
            }
            Attempt::Finished(Err(e)) => {
                if matches!(e, Error::Connection(_)) {
                    warn!(runner_id = %runner_id, error = %e, "Executor unreachable before apply");
                } else {
                    error!(runner_id = %runner_id, error = %e, "Release failed");
                }
                self.recorder
                    .record_outcome(runner_id, &DeploymentOutcome::FailedWith(e.runner_message()))
                    .await?;
                Err(e)
            }
            Attempt::Cancelled(reason) => {
                info!(runner_id = %runner_id, reason = ?reason, "Release cancelled");
                if let Some(outcome) = reason.outcome() {
                    self.recorder.record_outcome(runner_id, &outcome).await?;
                }
                Err(Error::Cancelled(format!("release of runner {runner_id}: {reason:?}")))
            }
        }
    }

    /// Resolve a release that outlived its deadline from the Helm release
    /// status, falling back to a timeout failure.
    async fn finish_timed_out(&self, runner: &CdWorkflowRunner) -> Result<Option<i64>> {
        let pipeline = self.deps.pipelines.get(runner.pipeline_id).await?;
        let limit = self.deps.config.chart_install_timeout;
        let resolved = match self
            .deps
            .helm
            .get_application_and_release_status(&helm_app(&pipeline))
            .await
        {
            Ok(Some(status)) => outcome_from_release(&status, runner.started_on),
            Ok(None) => None,
            Err(e) => {
                warn!(runner_id = %runner.id, error = %e, "Failed to read release status after timeout");
                None
            }
        };
        let outcome = resolved.unwrap_or_else(|| DeploymentOutcome::Timeout {
            release: pipeline.app_release_name(),
            limit,
        });
        warn!(runner_id = %runner.id, outcome = ?outcome, "Release deadline exceeded");
        self.recorder.record_outcome(runner.id, &outcome).await?;

        if outcome == DeploymentOutcome::Succeeded {
            let counter = self
                .deps
                .overrides
                .find_by_workflow(runner.workflow_id)
                .await?
                .map(|o| o.pipeline_release_counter);
            return Ok(counter);
        }
        Err(Error::DeadlineExceeded(outcome.message()))
    }

    /// Process an async-deploy message.
    pub async fn handle_async_deploy(&self, event: &AsyncCdDeployEvent) -> Result<()> {
        let request = &event.values_override_request;
        let runner_id = request.wfr_id.ok_or_else(|| {
            Error::InvalidInput("async deploy event has no runner".to_string())
        })?;
        let Some(_claim) = self.claim(runner_id) else {
            debug!(runner_id = %runner_id, "Runner already in flight, dropping redelivery");
            return Ok(());
        };

        let runner = self.deps.workflows.get_runner(runner_id).await?;
        if runner.status.is_terminal() {
            debug!(runner_id = %runner_id, status = %runner.status, "Runner already terminal");
            return Ok(());
        }
        let latest = self
            .deps
            .workflows
            .latest_deploy_runner(runner.pipeline_id)
            .await?;
        if let Some(latest) = latest.filter(|l| l.id != runner.id) {
            self.recorder
                .record_outcome(runner_id, &DeploymentOutcome::SupersededBy(Some(latest.id)))
                .await?;
            return Ok(());
        }

        if let Err(e) = self.execute(request).await {
            // already recorded on the runner
            warn!(runner_id = %runner_id, error = %e, "Async release did not complete");
        }
        Ok(())
    }

    /// Cancel the release in flight for a deleted pipeline.
    pub async fn remove_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<RunnerId>> {
        let context = {
            let mut contexts = self
                .contexts
                .lock()
                .map_err(|_| Error::Internal("release context map poisoned".to_string()))?;
            contexts.remove(&pipeline_id)
        };
        let Some(context) = context else {
            return Ok(None);
        };
        let _ = context.cancel.send(Some(CancelReason::PipelineDeleted));
        self.recorder
            .record_outcome(
                context.runner_id,
                &DeploymentOutcome::Canceled(PIPELINE_DELETED.to_string()),
            )
            .await?;
        info!(pipeline_id = %pipeline_id, runner_id = %context.runner_id, "Cancelled release of deleted pipeline");
        Ok(Some(context.runner_id))
    }

    /// Cancel every in-flight release without touching the runners.
    pub fn shutdown(&self) {
        let drained: Vec<ReleaseContext> = match self.contexts.lock() {
            Ok(mut contexts) => contexts.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        for context in drained {
            let _ = context.cancel.send(Some(CancelReason::Shutdown));
        }
    }

    /// Re-publish deploy runners a previous process left queued or starting.
    ///
    /// Runners that are no longer the latest of their pipeline are superseded
    /// instead. Returns the number of re-published runners.
    pub async fn process_incomplete_requests(&self) -> Result<usize> {
        let pending = self
            .deps
            .workflows
            .deploy_runners_in(&[RunnerStatus::Queued, RunnerStatus::Starting])
            .await?;
        let mut published = 0;
        for runner in pending {
            let latest = self
                .deps
                .workflows
                .latest_deploy_runner(runner.pipeline_id)
                .await?;
            if let Some(latest) = latest.filter(|l| l.id != runner.id) {
                self.recorder
                    .record_outcome(runner.id, &DeploymentOutcome::SupersededBy(Some(latest.id)))
                    .await?;
                continue;
            }

            let workflow = self.deps.workflows.get_workflow(runner.workflow_id).await?;
            let mut request = ValuesOverrideRequest::new(
                runner.pipeline_id,
                workflow.ci_artifact_id,
                WorkflowType::Deploy,
                runner.triggered_by,
            );
            request.wfr_id = Some(runner.id);
            request.cd_workflow_id = Some(runner.workflow_id);
            request.reference_id = runner.reference_id.clone();
            if let Some(release) = self.deps.overrides.find_by_workflow(runner.workflow_id).await? {
                request.deployment_type = release.deployment_type;
            }
            let event = AsyncCdDeployEvent {
                values_override_request: request,
                triggered_at: runner.started_on,
                triggered_by: runner.triggered_by,
            };
            publish_json(self.deps.bus.as_ref(), topics::ASYNC_CHART_INSTALL, &event).await?;
            info!(runner_id = %runner.id, "Re-published incomplete release");
            published += 1;
        }
        Ok(published)
    }

    /// Resolve in-progress Helm releases from their release status.
    ///
    /// Returns the runners that reached `Succeeded`.
    pub async fn reconcile_in_progress(&self) -> Result<Vec<CdWorkflowRunner>> {
        let runners = self
            .deps
            .workflows
            .deploy_runners_in(&[RunnerStatus::InProgress])
            .await?;
        let mut succeeded = Vec::new();
        for runner in runners {
            let pipeline = match self.deps.pipelines.get(runner.pipeline_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(runner_id = %runner.id, error = %e, "Pipeline of in-progress runner unavailable");
                    continue;
                }
            };
            if pipeline.deployment_app_type != DeploymentAppType::Helm {
                continue;
            }
            let status = match self
                .deps
                .helm
                .get_application_and_release_status(&helm_app(&pipeline))
                .await
            {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    debug!(runner_id = %runner.id, error = %e, "Release status unavailable");
                    continue;
                }
            };
            let Some(outcome) = outcome_from_release(&status, runner.started_on) else {
                continue;
            };
            if self.recorder.record_outcome(runner.id, &outcome).await?
                && outcome == DeploymentOutcome::Succeeded
            {
                succeeded.push(self.deps.workflows.get_runner(runner.id).await?);
            }
        }
        Ok(succeeded)
    }
}
