//! Long-running loops: message consumption and release status polling.

use deckhand_config::QueueSettings;
use deckhand_core::Result;
use deckhand_core::events::{Message, MessageSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::orchestrator::TriggerOrchestrator;
use crate::subscriber::{EventSubscriber, is_retryable};

/// Messages handled concurrently by one worker.
const MAX_IN_FLIGHT: usize = 8;

/// Wait for `pause` or a shutdown signal. Returns false once the loop
/// should stop.
async fn idle(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(pause) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Claims messages from a set of topics and hands them to the subscriber.
pub struct SubscriberWorker {
    id: String,
    source: Arc<dyn MessageSource>,
    subscriber: Arc<EventSubscriber>,
    topics: Vec<&'static str>,
    settings: QueueSettings,
}

impl SubscriberWorker {
    pub fn new(
        id: impl Into<String>,
        source: Arc<dyn MessageSource>,
        subscriber: Arc<EventSubscriber>,
        topics: Vec<&'static str>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            subscriber,
            topics,
            settings,
        }
    }

    async fn claim_next(&self) -> Result<Option<Message>> {
        for topic in &self.topics {
            if let Some(message) = self.source.claim(&self.id, topic).await? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Handle one message and settle it: acknowledged when handled or when
    /// retrying cannot help, returned to the queue otherwise.
    async fn process(&self, message: &Message) {
        let settled = match self.subscriber.handle(message).await {
            Ok(()) => self.source.complete(&message.id).await,
            Err(e) if is_retryable(&e) => {
                warn!(message_id = %message.id, topic = %message.topic, error = %e, "Message failed, will retry");
                self.source.fail(&message.id, &e.to_string()).await
            }
            Err(e) => {
                warn!(message_id = %message.id, topic = %message.topic, error = %e, "Message rejected");
                self.source.complete(&message.id).await
            }
        };
        if let Err(e) = settled {
            warn!(message_id = %message.id, error = %e, "Failed to settle message");
        }
    }

    /// Run until `shutdown` flips to true, then wait for in-flight messages.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, topics = ?self.topics, "Starting subscriber worker");
        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            let Ok(permit) = permits.clone().try_acquire_owned() else {
                if !idle(self.settings.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            };
            let pause = match self.claim_next().await {
                Ok(Some(message)) => {
                    debug!(worker_id = %self.id, message_id = %message.id, topic = %message.topic, "Claimed message");
                    let worker = self.clone();
                    tasks.spawn(async move {
                        worker.process(&message).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.settings.poll_interval,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim message");
                    self.settings.backoff
                }
            };
            if !idle(pause, &mut shutdown).await {
                break;
            }
        }

        info!(worker_id = %self.id, in_flight = tasks.len(), "Stopping subscriber worker");
        while tasks.join_next().await.is_some() {}
    }
}

/// Polls Helm for releases in progress and continues pipelines whose
/// release became healthy.
pub struct StatusWatcher {
    orchestrator: Arc<TriggerOrchestrator>,
    interval: Duration,
}

impl StatusWatcher {
    pub fn new(orchestrator: Arc<TriggerOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// One reconciliation pass. Returns how many releases succeeded.
    pub async fn tick(&self) -> Result<usize> {
        let succeeded = self.orchestrator.coordinator().reconcile_in_progress().await?;
        for runner in &succeeded {
            if let Err(e) = self.orchestrator.handle_deploy_success(runner).await {
                warn!(runner_id = %runner.id, error = %e, "Failed to continue pipeline after release");
            }
        }
        Ok(succeeded.len())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting release status watcher");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(0) => {}
                Ok(n) => info!(succeeded = n, "Releases finished"),
                Err(e) => warn!(error = %e, "Release status pass failed"),
            }
            if !idle(self.interval, &mut shutdown).await {
                break;
            }
        }
    }
}
