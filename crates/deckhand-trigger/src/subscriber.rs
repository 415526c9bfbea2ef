//! Topic dispatch for consumed messages.

use deckhand_core::events::{
    AsyncCdDeployEvent, BulkTriggerRequest, CdStageCompleteEvent, CiCompleteEvent,
    DeploymentGroupAppWithEnv, Message, PipelineDeletedEvent, topics,
};
use deckhand_core::executor::WorkflowStatusEvent;
use deckhand_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::orchestrator::TriggerOrchestrator;

/// Topics the trigger core consumes.
pub const SUBSCRIBED_TOPICS: [&str; 7] = [
    topics::CI_COMPLETE,
    topics::CD_STAGE_COMPLETE,
    topics::CD_WORKFLOW_STATUS,
    topics::BULK_DEPLOY,
    topics::BULK_HIBERNATE,
    topics::ASYNC_CHART_INSTALL,
    topics::CD_PIPELINE_DELETE,
];

/// Whether a failed message is worth redelivering. Refusals and bad
/// payloads fail the same way every time.
pub fn is_retryable(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(_) | Error::Internal(_) | Error::DeadlineExceeded(_)
    )
}

pub struct EventSubscriber {
    orchestrator: Arc<TriggerOrchestrator>,
}

impl EventSubscriber {
    pub fn new(orchestrator: Arc<TriggerOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn handle(&self, message: &Message) -> Result<()> {
        debug!(message_id = %message.id, topic = %message.topic, attempts = message.attempts, "Handling message");
        let reference = Some(message.id.as_str());
        match message.topic.as_str() {
            topics::CI_COMPLETE => {
                let event: CiCompleteEvent = message.decode()?;
                let started = match event.external_ci_id {
                    Some(external) => {
                        self.orchestrator
                            .handle_webhook_external_ci(
                                event.ci_artifact_id,
                                external,
                                event.triggered_by,
                                reference,
                                &|_| true,
                            )
                            .await?
                    }
                    None => {
                        self.orchestrator
                            .handle_ci_success(event.ci_artifact_id, event.triggered_by, reference)
                            .await?
                    }
                };
                debug!(started = started.len(), "CI completion handled");
            }
            topics::CD_STAGE_COMPLETE => {
                let event: CdStageCompleteEvent = message.decode()?;
                self.orchestrator.handle_stage_complete(&event, reference).await?;
            }
            topics::CD_WORKFLOW_STATUS => {
                let event: WorkflowStatusEvent = message.decode()?;
                self.orchestrator.stages().on_workflow_event(&event).await?;
            }
            topics::BULK_DEPLOY => {
                let request: BulkTriggerRequest = message.decode()?;
                self.orchestrator.handle_bulk_deploy(&request, reference).await?;
            }
            topics::BULK_HIBERNATE => {
                let request: DeploymentGroupAppWithEnv = message.decode()?;
                self.orchestrator.handle_bulk_hibernate(&request, reference).await?;
            }
            topics::ASYNC_CHART_INSTALL => {
                let event: AsyncCdDeployEvent = message.decode()?;
                self.orchestrator.coordinator().handle_async_deploy(&event).await?;
            }
            topics::CD_PIPELINE_DELETE => {
                let event: PipelineDeletedEvent = message.decode()?;
                if let Some(runner) = self.orchestrator.handle_pipeline_deleted(&event).await? {
                    info!(runner_id = %runner, "Cancelled release of deleted pipeline");
                }
            }
            other => {
                return Err(Error::InvalidInput(format!("no handler for topic {other}")));
            }
        }
        Ok(())
    }
}
