//! OpenAI-compatible chat-completion shapes, extended with the deployment
//! fields, plus the request validation matrix.
//!
//! Unknown standard fields are accepted and ignored (serde's default), so
//! off-the-shelf chat clients can talk to the endpoint unmodified.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::config::OrchestratorConfig;
use crate::core::credentials::AwsCredentialFields;
use crate::core::deployment::{DeploymentMode, DeploymentRequest, LifecycleAction};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::intent::IntentFields;
use crate::core::sanitize;

pub const MODEL_ID: &str = "on-demand-infra";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,

    // Deployment extensions.
    #[serde(default)]
    pub action: Option<LifecycleAction>,
    #[serde(default)]
    pub deployment_mode: Option<String>,
    #[serde(default)]
    pub github_repo_url: Option<String>,
    #[serde(default)]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub ec2_key_name: Option<String>,
    #[serde(default)]
    pub aws_credentials: Option<AwsCredentialFields>,
    #[serde(default)]
    pub base_hosted_zone_id: Option<String>,
    #[serde(default)]
    pub app_subdomain_label: Option<String>,
    #[serde(default)]
    pub application_environment_variables: Option<HashMap<String, String>>,
    #[serde(default)]
    pub replicas: Option<u32>,
}

impl ChatCompletionRequest {
    /// Concatenated user text, for the intent extractor.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .filter_map(|m| m.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_intent_fields(&self) -> IntentFields {
        IntentFields {
            deployment_mode: self.deployment_mode.clone(),
            github_repo_url: self.github_repo_url.clone(),
            target_namespace: self.target_namespace.clone(),
            instance_name: self.instance_name.clone(),
            replicas: self.replicas,
            app_subdomain_label: self.app_subdomain_label.clone(),
        }
    }

    /// Fold merged intent fields back in. The merge itself already refused
    /// to overwrite supplied values.
    pub fn apply_intent(&mut self, fields: IntentFields) {
        self.deployment_mode = fields.deployment_mode;
        self.github_repo_url = fields.github_repo_url;
        self.target_namespace = fields.target_namespace;
        self.instance_name = fields.instance_name;
        self.replicas = fields.replicas;
        self.app_subdomain_label = fields.app_subdomain_label;
    }
}

fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Apply the request validation matrix and produce the resolved lifecycle
/// request. Runs before any workspace allocation.
pub fn validate(
    req: &ChatCompletionRequest,
    config: &OrchestratorConfig,
) -> Result<(LifecycleAction, DeploymentRequest)> {
    let action = req.action.unwrap_or(LifecycleAction::Deploy);

    let id = match action {
        LifecycleAction::Deploy => {
            let raw = req.instance_name.clone().unwrap_or_else(|| {
                format!("dep-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
            });
            sanitize::sanitize_kubernetes_name(&raw).ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "instance_name '{}' is not a valid deployment name",
                    raw
                ))
            })?
        }
        _ => {
            let raw = req.instance_id.clone().ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "instance_id is required for {}",
                    action.as_str()
                ))
            })?;
            sanitize::sanitize_kubernetes_name(&raw).ok_or_else(|| {
                OrchestratorError::Validation(format!("invalid instance_id '{}'", raw))
            })?
        }
    };

    let mode = match (&req.deployment_mode, action) {
        (Some(raw), _) => Some(DeploymentMode::from_str(raw).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "deployment_mode must be one of local, cloud-local, cloud-hosted (got '{}')",
                raw
            ))
        })?),
        (None, LifecycleAction::Deploy) => {
            return Err(OrchestratorError::Validation(
                "deployment_mode is required for deploy".to_string(),
            ));
        }
        (None, _) => None,
    };

    if action == LifecycleAction::Deploy {
        let repo = req.github_repo_url.as_deref().ok_or_else(|| {
            OrchestratorError::Validation("github_repo_url is required for deploy".to_string())
        })?;
        if !repo.starts_with("https://") {
            return Err(OrchestratorError::Validation(format!(
                "github_repo_url must be an https URL (got '{}')",
                repo
            )));
        }

        if let Some(mode) = mode {
            if mode.is_cloud()
                && req.aws_credentials.is_none()
                && config.default_credentials.is_none()
            {
                return Err(OrchestratorError::Validation(
                    "aws_credentials are required for cloud deployments (no server defaults configured)"
                        .to_string(),
                ));
            }
            if mode == DeploymentMode::CloudLocal && req.ec2_key_name.is_none() {
                return Err(OrchestratorError::Validation(
                    "ec2_key_name is required for cloud-local deploy".to_string(),
                ));
            }
            if mode != DeploymentMode::CloudHosted
                && (req.base_hosted_zone_id.is_some() || req.app_subdomain_label.is_some())
            {
                return Err(OrchestratorError::Validation(
                    "base_hosted_zone_id and app_subdomain_label only apply to cloud-hosted"
                        .to_string(),
                ));
            }
        }
    }

    match (&req.base_hosted_zone_id, &req.app_subdomain_label) {
        (Some(_), None) | (None, Some(_)) => {
            return Err(OrchestratorError::Validation(
                "base_hosted_zone_id and app_subdomain_label are mutually required".to_string(),
            ));
        }
        _ => {}
    }

    // Values that end up inside HCL or subprocess argument lists.
    if let Some(key) = &req.ec2_key_name {
        if sanitize::sanitize_terraform_input(key).is_none()
            || sanitize::sanitize_shell_input(key).is_none()
        {
            return Err(OrchestratorError::Validation(format!(
                "invalid ec2_key_name '{}'",
                key
            )));
        }
    }
    if let Some(zone) = &req.base_hosted_zone_id {
        if sanitize::sanitize_terraform_input(zone).is_none() {
            return Err(OrchestratorError::Validation(format!(
                "invalid base_hosted_zone_id '{}'",
                zone
            )));
        }
    }

    if let Some(label) = &req.app_subdomain_label {
        if label.is_empty() || sanitize::sanitize_kubernetes_name(label).is_none() {
            return Err(OrchestratorError::Validation(format!(
                "app_subdomain_label '{}' is not a valid DNS label",
                label
            )));
        }
    }

    if action == LifecycleAction::Scale && req.replicas.is_none() {
        return Err(OrchestratorError::Validation(
            "replicas is required for scale".to_string(),
        ));
    }

    let namespace = match &req.target_namespace {
        Some(ns) => sanitize::sanitize_kubernetes_name(ns)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("invalid target_namespace '{}'", ns))
            })?,
        None => "default".to_string(),
    };

    let env_vars = req
        .application_environment_variables
        .clone()
        .unwrap_or_default();
    for key in env_vars.keys() {
        if !valid_env_key(key) {
            return Err(OrchestratorError::Validation(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
    }

    Ok((
        action,
        DeploymentRequest {
            id,
            mode,
            repo_url: req.github_repo_url.clone(),
            namespace,
            replicas: req.replicas.unwrap_or(1),
            env_vars,
            instance_name: req.instance_name.clone(),
            ec2_key_name: req.ec2_key_name.clone(),
            base_hosted_zone_id: req.base_hosted_zone_id.clone(),
            app_subdomain_label: req.app_subdomain_label.clone(),
            credentials: req.aws_credentials.clone(),
        },
    ))
}

// ── Response shapes ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChoiceDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: ChoiceDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, delta: ChoiceDelta, finish_reason: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: Utc::now().timestamp(),
            model: MODEL_ID.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn single(id: &str, content: String, finish_reason: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model: MODEL_ID.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(content),
                },
                finish_reason: finish_reason.to_string(),
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "deploy my app"}],
            "deployment_mode": "local",
            "github_repo_url": "https://github.com/x/y.git",
            "target_namespace": "ns-a"
        }))
        .unwrap()
    }

    fn config_without_defaults() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::from_env();
        config.default_credentials = None;
        config
    }

    #[test]
    fn unknown_standard_fields_are_ignored() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "messages": [],
            "temperature": 0.4,
            "top_p": 0.9,
            "logit_bias": {"50256": -100},
            "deployment_mode": "local",
            "github_repo_url": "https://github.com/x/y.git"
        }))
        .unwrap();
        assert!(validate(&req, &config_without_defaults()).is_ok());
    }

    #[test]
    fn deploy_defaults_action_and_namespace() {
        let mut req = base_request();
        req.target_namespace = None;
        let (action, request) = validate(&req, &config_without_defaults()).unwrap();
        assert_eq!(action, LifecycleAction::Deploy);
        assert_eq!(request.namespace, "default");
        assert!(request.id.starts_with("dep-"));
        assert_eq!(request.replicas, 1);
    }

    #[test]
    fn deploy_requires_a_mode() {
        let mut req = base_request();
        req.deployment_mode = None;
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn cloud_deploy_requires_credentials_without_server_defaults() {
        let mut req = base_request();
        req.deployment_mode = Some("cloud-hosted".to_string());
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert!(err.to_string().contains("aws_credentials"));

        let mut config = config_without_defaults();
        config.default_credentials = Some(crate::core::config::AwsDefaultCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            region: "us-east-1".into(),
        });
        assert!(validate(&req, &config).is_ok());
    }

    #[test]
    fn cloud_local_deploy_requires_a_key_name() {
        let mut req = base_request();
        req.deployment_mode = Some("cloud-local".to_string());
        req.aws_credentials = Some(AwsCredentialFields {
            aws_access_key_id: "AKIA".into(),
            aws_secret_access_key: "secret".into(),
            aws_region: None,
        });
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert!(err.to_string().contains("ec2_key_name"));

        req.ec2_key_name = Some("demo-key".to_string());
        assert!(validate(&req, &config_without_defaults()).is_ok());
    }

    #[test]
    fn lifecycle_actions_require_instance_id() {
        for action in ["redeploy", "scale", "decommission"] {
            let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
                "messages": [],
                "action": action,
            }))
            .unwrap();
            let err = validate(&req, &config_without_defaults()).unwrap_err();
            assert!(err.to_string().contains("instance_id"), "action {}", action);
        }
    }

    #[test]
    fn scale_requires_replicas() {
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "messages": [],
            "action": "scale",
            "instance_id": "dep-1"
        }))
        .unwrap();
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert!(err.to_string().contains("replicas"));
    }

    #[test]
    fn hosted_zone_and_label_are_mutually_required() {
        let mut req = base_request();
        req.deployment_mode = Some("cloud-hosted".to_string());
        req.aws_credentials = Some(AwsCredentialFields {
            aws_access_key_id: "AKIA".into(),
            aws_secret_access_key: "secret".into(),
            aws_region: None,
        });
        req.base_hosted_zone_id = Some("Z123".to_string());
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert!(err.to_string().contains("mutually required"));

        req.app_subdomain_label = Some("my-app".to_string());
        assert!(validate(&req, &config_without_defaults()).is_ok());
    }

    #[test]
    fn domain_fields_are_rejected_outside_cloud_hosted() {
        let mut req = base_request();
        req.base_hosted_zone_id = Some("Z123".to_string());
        req.app_subdomain_label = Some("my-app".to_string());
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn invalid_env_var_names_are_rejected() {
        let mut req = base_request();
        req.application_environment_variables =
            Some(HashMap::from([("1BAD-NAME".to_string(), "x".to_string())]));
        let err = validate(&req, &config_without_defaults()).unwrap_err();
        assert!(err.to_string().contains("environment variable"));
    }

    #[test]
    fn hcl_bound_fields_reject_injection() {
        let mut req = base_request();
        req.deployment_mode = Some("cloud-local".to_string());
        req.aws_credentials = Some(AwsCredentialFields {
            aws_access_key_id: "AKIA".into(),
            aws_secret_access_key: "secret".into(),
            aws_region: None,
        });
        req.ec2_key_name = Some("key\"; rm -rf /".to_string());
        assert!(validate(&req, &config_without_defaults()).is_err());

        req.ec2_key_name = Some("demo-key".to_string());
        assert!(validate(&req, &config_without_defaults()).is_ok());
    }

    #[test]
    fn instance_name_must_be_a_valid_kubernetes_name() {
        let mut req = base_request();
        req.instance_name = Some("Bad_Name!".to_string());
        assert!(validate(&req, &config_without_defaults()).is_err());

        req.instance_name = Some("good-name".to_string());
        let (_, request) = validate(&req, &config_without_defaults()).unwrap();
        assert_eq!(request.id, "good-name");
    }
}
