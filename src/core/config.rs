//! Process configuration resolved once at startup from the environment.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AwsDefaultCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct AzureOpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub clone: Duration,
    pub build: Duration,
    pub iac_apply: Duration,
    pub rollout: Duration,
    /// Overall ceiling for a cloud-hosted pipeline run.
    pub cloud_hosted_total: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            clone: Duration::from_secs(5 * 60),
            build: Duration::from_secs(20 * 60),
            iac_apply: Duration::from_secs(30 * 60),
            rollout: Duration::from_secs(5 * 60),
            cloud_hosted_total: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_base: PathBuf,
    pub key_base_path: Option<PathBuf>,
    pub default_domain: Option<String>,
    pub default_credentials: Option<AwsDefaultCredentials>,
    pub azure_openai: Option<AzureOpenAiConfig>,
    pub kind_cluster_name: String,
    pub calico_manifest_url: String,
    pub api_host: String,
    pub api_port: u16,
    pub timeouts: StageTimeouts,
}

const DEFAULT_CALICO_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.28.0/manifests/calico.yaml";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let default_credentials = match (
            env_var("AWS_ACCESS_KEY_ID"),
            env_var("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsDefaultCredentials {
                access_key_id,
                secret_access_key,
                region: env_var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            }),
            _ => None,
        };

        let azure_openai = match (
            env_var("AZURE_OPENAI_ENDPOINT"),
            env_var("AZURE_OPENAI_API_KEY"),
            env_var("AZURE_OPENAI_DEPLOYMENT_NAME"),
        ) {
            (Some(endpoint), Some(api_key), Some(deployment)) => Some(AzureOpenAiConfig {
                endpoint,
                api_key,
                deployment,
                api_version: env_var("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| "2024-12-01-preview".to_string()),
            }),
            _ => None,
        };

        Self {
            workspace_base: env_var("PERSISTENT_WORKSPACE_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspaces")),
            key_base_path: env_var("EC2_PRIVATE_KEY_BASE_PATH").map(PathBuf::from),
            default_domain: env_var("DEFAULT_DOMAIN_NAME_FOR_APPS"),
            default_credentials,
            azure_openai,
            kind_cluster_name: env_var("KIND_CLUSTER_NAME")
                .unwrap_or_else(|| "on-demand-infra".to_string()),
            calico_manifest_url: env_var("KIND_CALICO_MANIFEST_URL")
                .unwrap_or_else(|| DEFAULT_CALICO_MANIFEST_URL.to_string()),
            api_host: env_var("API_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            api_port: env_var("API_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            timeouts: StageTimeouts::default(),
        }
    }
}
