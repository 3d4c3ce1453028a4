//! Deployment lifecycle: state machine, action preconditions and the
//! process-wide registry of active deployments.
//!
//! Stages are causally dependent, so each pipeline is straight-line code
//! with one state transition per stage boundary; the registry only guards
//! O(1) map operations and is never held across a subprocess call.

pub mod pipeline;
pub mod progress;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::credentials::AwsCredentialFields;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::workspace::MetaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    Local,
    CloudLocal,
    CloudHosted,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Local => "local",
            DeploymentMode::CloudLocal => "cloud-local",
            DeploymentMode::CloudHosted => "cloud-hosted",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "local" => Some(DeploymentMode::Local),
            "cloud-local" => Some(DeploymentMode::CloudLocal),
            "cloud-hosted" => Some(DeploymentMode::CloudHosted),
            _ => None,
        }
    }

    pub fn is_cloud(self) -> bool {
        !matches!(self, DeploymentMode::Local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Deploy,
    Redeploy,
    Scale,
    Decommission,
}

impl LifecycleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::Deploy => "deploy",
            LifecycleAction::Redeploy => "redeploy",
            LifecycleAction::Scale => "scale",
            LifecycleAction::Decommission => "decommission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    Init,
    Cloning,
    Rendering,
    IacApplying,
    Building,
    ImagePublishing,
    ClusterBootstrapping,
    ApplyingManifests,
    WaitingRollout,
    Succeeded,
    Failed,
    Decommissioning,
    Decommissioned,
}

impl DeploymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentState::Init => "init",
            DeploymentState::Cloning => "cloning",
            DeploymentState::Rendering => "rendering",
            DeploymentState::IacApplying => "iac-applying",
            DeploymentState::Building => "building",
            DeploymentState::ImagePublishing => "image-publishing",
            DeploymentState::ClusterBootstrapping => "cluster-bootstrapping",
            DeploymentState::ApplyingManifests => "applying-manifests",
            DeploymentState::WaitingRollout => "waiting-rollout",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::Decommissioning => "decommissioning",
            DeploymentState::Decommissioned => "decommissioned",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "init" => Some(DeploymentState::Init),
            "cloning" => Some(DeploymentState::Cloning),
            "rendering" => Some(DeploymentState::Rendering),
            "iac-applying" => Some(DeploymentState::IacApplying),
            "building" => Some(DeploymentState::Building),
            "image-publishing" => Some(DeploymentState::ImagePublishing),
            "cluster-bootstrapping" => Some(DeploymentState::ClusterBootstrapping),
            "applying-manifests" => Some(DeploymentState::ApplyingManifests),
            "waiting-rollout" => Some(DeploymentState::WaitingRollout),
            "succeeded" => Some(DeploymentState::Succeeded),
            "failed" => Some(DeploymentState::Failed),
            "decommissioning" => Some(DeploymentState::Decommissioning),
            "decommissioned" => Some(DeploymentState::Decommissioned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::Decommissioned
        )
    }
}

pub fn can_transition(from: DeploymentState, to: DeploymentState) -> bool {
    use DeploymentState::*;
    if from == to {
        return true;
    }
    // Every non-terminal state may fail.
    if to == Failed && !from.is_terminal() {
        return true;
    }
    match from {
        Init => matches!(to, Cloning),
        Cloning => matches!(to, Rendering),
        // Local mode has no IaC work, so rendering may go straight to building.
        Rendering => matches!(to, IacApplying | Building),
        IacApplying => matches!(to, Building),
        Building => matches!(to, ImagePublishing | ClusterBootstrapping),
        ImagePublishing => matches!(to, ClusterBootstrapping),
        ClusterBootstrapping => matches!(to, ApplyingManifests),
        ApplyingManifests => matches!(to, WaitingRollout),
        WaitingRollout => matches!(to, Succeeded | Decommissioning),
        Succeeded | Failed => matches!(to, Decommissioning),
        Decommissioning => matches!(to, Decommissioned),
        Decommissioned => false,
    }
}

/// How a `deploy` action starts against the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStart {
    Fresh,
    Resume,
}

/// Dispatcher preconditions: what each action requires of the deployment's
/// recorded status (`None` when no workspace exists for the id).
pub fn action_precondition(
    action: LifecycleAction,
    existing_status: Option<&str>,
) -> Result<Option<DeployStart>> {
    match action {
        LifecycleAction::Deploy => match existing_status {
            None => Ok(Some(DeployStart::Fresh)),
            // A failed run left partial state behind; reopening it as a
            // resumption is the only way deploy may reuse an id.
            Some("failed") => Ok(Some(DeployStart::Resume)),
            Some(status) => Err(OrchestratorError::Validation(format!(
                "deployment already exists with status '{}'",
                status
            ))),
        },
        LifecycleAction::Redeploy => match existing_status {
            Some("succeeded") | Some("failed") => Ok(None),
            Some(status) => Err(OrchestratorError::Validation(format!(
                "redeploy requires a succeeded or failed deployment, found '{}'",
                status
            ))),
            None => Err(OrchestratorError::Validation(
                "redeploy requires an existing deployment".to_string(),
            )),
        },
        LifecycleAction::Scale => match existing_status {
            Some("succeeded") => Ok(None),
            Some(status) => Err(OrchestratorError::Validation(format!(
                "scale requires a succeeded deployment, found '{}'",
                status
            ))),
            None => Err(OrchestratorError::Validation(
                "scale requires an existing deployment".to_string(),
            )),
        },
        LifecycleAction::Decommission => match existing_status {
            Some(_) => Ok(None),
            None => Err(OrchestratorError::Validation(
                "no such deployment to decommission".to_string(),
            )),
        },
    }
}

/// Process-wide map of active deployment ids to their current state.
#[derive(Clone, Default)]
pub struct DeploymentRegistry {
    inner: Arc<Mutex<HashMap<String, DeploymentState>>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: &str) -> Option<DeploymentState> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.get(id).copied()
    }

    /// Claim an id for a new pipeline run. Refuses while a non-terminal run
    /// is registered for the same id.
    pub fn begin(&self, id: &str, initial: DeploymentState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = inner.get(id) {
            if !state.is_terminal() {
                return Err(OrchestratorError::Validation(format!(
                    "deployment '{}' is already running (state '{}')",
                    id,
                    state.as_str()
                )));
            }
        }
        inner.insert(id.to_string(), initial);
        Ok(())
    }

    /// Move a deployment to a new state, enforcing the transition graph.
    pub fn transition(&self, id: &str, to: DeploymentState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let from = inner.get(id).copied().unwrap_or(DeploymentState::Init);
        if !can_transition(from, to) {
            return Err(OrchestratorError::Validation(format!(
                "illegal state transition {} -> {} for deployment '{}'",
                from.as_str(),
                to.as_str(),
                id
            )));
        }
        inner.insert(id.to_string(), to);
        Ok(())
    }

}

/// A validated lifecycle request as handed to the pipeline layer.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub id: String,
    pub mode: Option<DeploymentMode>,
    pub repo_url: Option<String>,
    pub namespace: String,
    pub replicas: u32,
    pub env_vars: HashMap<String, String>,
    pub instance_name: Option<String>,
    pub ec2_key_name: Option<String>,
    pub base_hosted_zone_id: Option<String>,
    pub app_subdomain_label: Option<String>,
    pub credentials: Option<AwsCredentialFields>,
}

/// Structured final payload for a lifecycle run, carried by the terminal
/// progress event and by `stream=false` responses.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentOutcome {
    pub deployment_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub outputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaError>,
}

#[cfg(test)]
mod tests;
