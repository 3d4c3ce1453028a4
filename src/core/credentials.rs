//! Per-invocation cloud credential scope.
//!
//! Credentials are resolved fresh for every pipeline invocation (request body
//! first, then server defaults), flow into subprocesses only through env
//! maps, and are registered with the pipeline's event channel so no progress
//! text can echo them. They are never written to disk.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::core::config::OrchestratorConfig;
use crate::core::deployment::progress::ProgressSender;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};

/// Credential fields as they arrive in the chat request body.
#[derive(Clone, Deserialize)]
pub struct AwsCredentialFields {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    #[serde(default)]
    pub aws_region: Option<String>,
}

impl fmt::Debug for AwsCredentialFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentialFields")
            .field("aws_access_key_id", &"***")
            .field("aws_secret_access_key", &"***")
            .field("aws_region", &self.aws_region)
            .finish()
    }
}

pub struct CredentialScope {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl fmt::Debug for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialScope")
            .field("access_key_id", &"***")
            .field("secret_access_key", &"***")
            .field("region", &self.region)
            .finish()
    }
}

impl CredentialScope {
    /// Resolution order: request body, then server default environment, then
    /// failure. The scope lives exactly as long as the pipeline invocation.
    pub fn resolve(
        request: Option<&AwsCredentialFields>,
        config: &OrchestratorConfig,
    ) -> Result<Self> {
        if let Some(creds) = request {
            return Ok(Self {
                access_key_id: creds.aws_access_key_id.clone(),
                secret_access_key: creds.aws_secret_access_key.clone(),
                region: creds
                    .aws_region
                    .clone()
                    .or_else(|| config.default_credentials.as_ref().map(|d| d.region.clone()))
                    .unwrap_or_else(|| "us-east-1".to_string()),
            });
        }

        if let Some(defaults) = &config.default_credentials {
            return Ok(Self {
                access_key_id: defaults.access_key_id.clone(),
                secret_access_key: defaults.secret_access_key.clone(),
                region: defaults.region.clone(),
            });
        }

        Err(OrchestratorError::Credential(
            "no cloud credentials in the request and no server defaults configured".to_string(),
        ))
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Environment map injected into cloud-touching subprocesses.
    pub fn env_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.secret_access_key.clone(),
            ),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
            ("AWS_REGION".to_string(), self.region.clone()),
        ])
    }

    /// Register both secret values with the event channel's scrubber.
    pub fn register_with(&self, sender: &ProgressSender) {
        sender.register_secret(&self.access_key_id);
        sender.register_secret(&self.secret_access_key);
    }

    /// Prove the credentials are accepted before any resource is created.
    pub async fn verify(&self) -> Result<()> {
        let spec = CommandSpec::new("aws")
            .args(["sts", "get-caller-identity", "--output", "json"])
            .envs(&self.env_map())
            .timeout(Duration::from_secs(30));
        let captured = process::run_captured(&spec).await?;
        if captured.success() {
            return Ok(());
        }
        let detail = captured
            .stderr
            .lines()
            .next()
            .unwrap_or("sts get-caller-identity failed")
            .to_string();
        Err(OrchestratorError::Credential(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AwsDefaultCredentials;

    fn config_with_defaults() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::from_env();
        config.default_credentials = Some(AwsDefaultCredentials {
            access_key_id: "AKIADEFAULT".to_string(),
            secret_access_key: "default-secret".to_string(),
            region: "eu-west-1".to_string(),
        });
        config
    }

    #[test]
    fn request_credentials_win_over_server_defaults() {
        let request = AwsCredentialFields {
            aws_access_key_id: "AKIAREQUEST".to_string(),
            aws_secret_access_key: "request-secret".to_string(),
            aws_region: Some("us-west-2".to_string()),
        };
        let scope = CredentialScope::resolve(Some(&request), &config_with_defaults()).unwrap();
        assert_eq!(scope.env_map()["AWS_ACCESS_KEY_ID"], "AKIAREQUEST");
        assert_eq!(scope.region(), "us-west-2");
    }

    #[test]
    fn server_defaults_apply_when_request_omits_credentials() {
        let scope = CredentialScope::resolve(None, &config_with_defaults()).unwrap();
        assert_eq!(scope.env_map()["AWS_ACCESS_KEY_ID"], "AKIADEFAULT");
        assert_eq!(scope.region(), "eu-west-1");
    }

    #[test]
    fn missing_credentials_fail_with_credential_kind() {
        let mut config = OrchestratorConfig::from_env();
        config.default_credentials = None;
        let err = CredentialScope::resolve(None, &config).unwrap_err();
        assert_eq!(err.kind(), "CredentialError");
    }

    #[test]
    fn debug_output_never_contains_secret_material() {
        let scope = CredentialScope::resolve(None, &config_with_defaults()).unwrap();
        let debugged = format!("{:?}", scope);
        assert!(!debugged.contains("AKIADEFAULT"));
        assert!(!debugged.contains("default-secret"));
    }
}
