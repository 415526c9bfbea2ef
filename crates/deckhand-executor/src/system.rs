//! Plain Kubernetes Job executor for stages that don't need Argo.

use async_trait::async_trait;
use deckhand_config::ExecutorSettings;
use deckhand_core::executor::*;
use deckhand_core::{Error, Result};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::info;

use crate::cluster::{ClusterClients, kube_error};
use crate::{PIPELINE_LABEL, REQUEST_ENV, RUNNER_LABEL};

/// Build the batch/v1 Job for a stage request.
pub fn job_manifest(request: &WorkflowRequest, settings: &ExecutorSettings) -> Result<Job> {
    let payload = serde_json::to_string(request)
        .map_err(|e| Error::Internal(format!("encode stage request: {e}")))?;
    let mut env = vec![json!({"name": REQUEST_ENV, "value": payload})];
    for (name, value) in &request.env_vars {
        env.push(json!({"name": name, "value": value}));
    }
    let labels = json!({
        RUNNER_LABEL: request.runner_id.to_string(),
        PIPELINE_LABEL: request.pipeline_id.to_string(),
    });

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": settings.active_deadline.as_secs(),
            "ttlSecondsAfterFinished": 3600,
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "restartPolicy": "Never",
                    "serviceAccountName": settings.service_account,
                    "containers": [{
                        "name": "stage",
                        "image": settings.runner_image,
                        "env": env,
                    }],
                },
            },
        },
    });
    serde_json::from_value(manifest).map_err(|e| Error::Internal(format!("job manifest: {e}")))
}

/// Translate Job counters into a workflow snapshot.
pub fn snapshot_from_job(status: Option<&JobStatus>) -> WorkflowSnapshot {
    let Some(status) = status else {
        return WorkflowSnapshot {
            phase: Some(WorkflowPhase::Pending),
            message: String::new(),
            finished_at: None,
        };
    };
    let count = |c: Option<i32>| c.unwrap_or(0);
    let phase = if count(status.succeeded) > 0 {
        WorkflowPhase::Succeeded
    } else if count(status.failed) > 0 {
        WorkflowPhase::Failed
    } else if count(status.active) > 0 {
        WorkflowPhase::Running
    } else {
        WorkflowPhase::Pending
    };
    let message = status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.iter().find(|c| c.status == "True"))
        .and_then(|c| c.message.clone())
        .unwrap_or_default();
    WorkflowSnapshot {
        phase: Some(phase),
        message,
        finished_at: status.completion_time.as_ref().map(|t| t.0),
    }
}

pub struct JobExecutor {
    clients: ClusterClients,
    settings: ExecutorSettings,
}

impl JobExecutor {
    pub fn new(clients: ClusterClients, settings: ExecutorSettings) -> Self {
        Self { clients, settings }
    }

    fn api(&self, target: &WorkflowTarget) -> Result<Api<Job>> {
        let client = self.clients.client_for(target)?;
        Ok(Api::namespaced(client, &target.namespace))
    }
}

#[async_trait]
impl Executor for JobExecutor {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn submit_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowHandle> {
        let job = job_manifest(request, &self.settings)?;
        let target = WorkflowTarget::in_cluster(&request.name, &request.namespace);
        self.api(&target)?
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| kube_error("submit job", e))?;
        info!(job = %request.name, namespace = %request.namespace, "Submitted stage job");
        Ok(WorkflowHandle {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            executor: self.name().to_string(),
        })
    }

    async fn get_workflow(&self, target: &WorkflowTarget) -> Result<Option<WorkflowSnapshot>> {
        let job = self
            .api(target)?
            .get_opt(&target.name)
            .await
            .map_err(|e| kube_error("get job", e))?;
        Ok(job.map(|j| snapshot_from_job(j.status.as_ref())))
    }

    async fn terminate_workflow(&self, target: &WorkflowTarget) -> Result<()> {
        let patch = json!({"spec": {"suspend": true}});
        self.api(target)?
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_error("suspend job", e))?;
        Ok(())
    }

    async fn delete_workflow(&self, target: &WorkflowTarget) -> Result<()> {
        match self
            .api(target)?
            .delete(&target.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(kube_error("delete job", e)),
        }
    }
}
