//! Argo Workflows executor.
//!
//! Each stage becomes one `Workflow` custom resource with a single container
//! template. The template name is the one workflow-status events are matched
//! against, so it must agree with the configured CD template name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_config::ExecutorSettings;
use deckhand_core::executor::*;
use deckhand_core::{Error, Result};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::cluster::{ClusterClients, kube_error};
use crate::{PIPELINE_LABEL, REQUEST_ENV, RUNNER_LABEL};

pub const GROUP: &str = "argoproj.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "Workflow";

pub fn workflow_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, KIND))
}

/// Render the Workflow manifest for a stage request.
pub fn workflow_manifest(
    request: &WorkflowRequest,
    settings: &ExecutorSettings,
    template_name: &str,
) -> Result<Value> {
    let payload = serde_json::to_string(request)
        .map_err(|e| Error::Internal(format!("encode stage request: {e}")))?;

    let mut env = vec![json!({"name": REQUEST_ENV, "value": payload})];
    env.extend(
        request
            .env_vars
            .iter()
            .map(|(k, v)| json!({"name": k, "value": v})),
    );

    Ok(json!({
        "apiVersion": format!("{GROUP}/{VERSION}"),
        "kind": KIND,
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
            "labels": {
                RUNNER_LABEL: request.runner_id.to_string(),
                PIPELINE_LABEL: request.pipeline_id.to_string(),
                "deckhand.io/stage": request.stage_type.as_str(),
            },
        },
        "spec": {
            "entrypoint": template_name,
            "serviceAccountName": settings.service_account,
            "activeDeadlineSeconds": settings.active_deadline.as_secs(),
            "podGC": {"strategy": "OnPodCompletion"},
            "templates": [{
                "name": template_name,
                "container": {
                    "image": settings.runner_image,
                    "env": env,
                },
            }],
        },
    }))
}

/// Read phase, message and finish time out of a Workflow's status.
pub fn snapshot_from_status(status: Option<&Value>) -> WorkflowSnapshot {
    let phase = status
        .and_then(|s| s.get("phase"))
        .and_then(|p| serde_json::from_value::<WorkflowPhase>(p.clone()).ok());
    let message = status
        .and_then(|s| s.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finished_at = status
        .and_then(|s| s.get("finishedAt"))
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    WorkflowSnapshot {
        phase,
        message,
        finished_at,
    }
}

/// Argo Workflows-based stage executor.
pub struct ArgoWorkflowExecutor {
    clients: ClusterClients,
    settings: ExecutorSettings,
    template_name: String,
}

impl ArgoWorkflowExecutor {
    pub fn new(
        clients: ClusterClients,
        settings: ExecutorSettings,
        template_name: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            settings,
            template_name: template_name.into(),
        }
    }

    fn api(&self, target: &WorkflowTarget) -> Result<Api<DynamicObject>> {
        let client = self.clients.client_for(target)?;
        Ok(Api::namespaced_with(
            client,
            &target.namespace,
            &workflow_resource(),
        ))
    }
}

#[async_trait]
impl Executor for ArgoWorkflowExecutor {
    fn name(&self) -> &'static str {
        "argo-workflow"
    }

    async fn submit_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowHandle> {
        let manifest = workflow_manifest(request, &self.settings, &self.template_name)?;
        let object: DynamicObject = serde_json::from_value(manifest)
            .map_err(|e| Error::Internal(format!("workflow manifest: {e}")))?;

        let target = WorkflowTarget::in_cluster(&request.name, &request.namespace);
        let api = self.api(&target)?;
        api.create(&PostParams::default(), &object)
            .await
            .map_err(|e| kube_error("submit workflow", e))?;

        info!(
            workflow = %request.name,
            namespace = %request.namespace,
            runner_id = %request.runner_id,
            "Submitted stage workflow"
        );
        Ok(WorkflowHandle {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            executor: self.name().to_string(),
        })
    }

    async fn get_workflow(&self, target: &WorkflowTarget) -> Result<Option<WorkflowSnapshot>> {
        let workflow = self
            .api(target)?
            .get_opt(&target.name)
            .await
            .map_err(|e| kube_error("get workflow", e))?;
        Ok(workflow.map(|wf| snapshot_from_status(wf.data.get("status"))))
    }

    async fn terminate_workflow(&self, target: &WorkflowTarget) -> Result<()> {
        let patch = json!({"spec": {"shutdown": "Terminate"}});
        self.api(target)?
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| kube_error("terminate workflow", e))?;
        debug!(workflow = %target.name, "Terminated workflow");
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
            Err(e) => Err(kube_error("delete workflow", e)),
        }
    }
}
