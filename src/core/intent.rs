//! Optional intent extraction for free-text deployment requests.
//!
//! Machine-generated requests carry structured fields and never reach this
//! module. For human text, the chat model proposes values for the missing
//! fields only; anything the caller already supplied is preserved, and any
//! failure degrades to "ask the user" rather than failing the pipeline.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::AzureOpenAiConfig;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IntentFields {
    #[serde(default)]
    pub deployment_mode: Option<String>,
    #[serde(default)]
    pub github_repo_url: Option<String>,
    #[serde(default)]
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub app_subdomain_label: Option<String>,
}

/// Fill holes in `base` from `proposal` without overwriting anything the
/// caller already supplied.
pub fn merge_preserving(base: &mut IntentFields, proposal: IntentFields) {
    base.deployment_mode = base.deployment_mode.take().or(proposal.deployment_mode);
    base.github_repo_url = base.github_repo_url.take().or(proposal.github_repo_url);
    base.target_namespace = base.target_namespace.take().or(proposal.target_namespace);
    base.instance_name = base.instance_name.take().or(proposal.instance_name);
    base.replicas = base.replicas.take().or(proposal.replicas);
    base.app_subdomain_label = base
        .app_subdomain_label
        .take()
        .or(proposal.app_subdomain_label);
}

#[async_trait]
pub trait IntentModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Serialize)]
struct AzureMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AzureRequest<'a> {
    messages: Vec<AzureMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct AzureResponse {
    choices: Vec<AzureChoice>,
}

#[derive(Deserialize)]
struct AzureChoice {
    message: AzureMessageOwned,
}

#[derive(Deserialize)]
struct AzureMessageOwned {
    content: Option<String>,
}

pub struct AzureOpenAiModel {
    config: AzureOpenAiConfig,
    client: Client,
}

impl AzureOpenAiModel {
    pub fn new(config: AzureOpenAiConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl IntentModel for AzureOpenAiModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.deployment,
            self.config.api_version
        );
        let req = AzureRequest {
            messages: vec![
                AzureMessage {
                    role: "system",
                    content: system,
                },
                AzureMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };
        let res = self
            .client
            .post(&url)
            .header("api-key", &self.config.api_key)
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Azure OpenAI API error: {}",
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: AzureResponse = res.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("Azure OpenAI returned no content"))
    }
}

/// Extract a JSON block from model output. Tries fenced ```json ... ```
/// first, then raw JSON starting with `{`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    None
}

const SYSTEM_PROMPT: &str = "You extract deployment parameters from a user's request. \
Output ONLY a JSON object with any of these keys you can infer: deployment_mode \
(one of: local, cloud-local, cloud-hosted), github_repo_url, target_namespace, \
instance_name, replicas, app_subdomain_label. Omit keys you cannot infer. \
Never invent repository URLs.";

/// Ask the model for the fields `current` is missing. Returns `None` on any
/// failure; the caller then asks the user instead.
pub async fn propose_missing_fields(
    model: &dyn IntentModel,
    user_text: &str,
    current: &IntentFields,
) -> Option<IntentFields> {
    let known = serde_json::to_string(current).ok()?;
    let prompt = format!(
        "Known fields (do not repeat values already present):\n{}\n\nUser request:\n{}",
        known, user_text
    );

    let reply = match model.complete(SYSTEM_PROMPT, &prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("intent extraction unavailable: {}", e);
            return None;
        }
    };

    let block = extract_json_block(&reply)?;
    match serde_json::from_str::<IntentFields>(block) {
        Ok(fields) => {
            debug!("intent proposal: {:?}", fields);
            Some(fields)
        }
        Err(e) => {
            warn!("intent proposal was not valid JSON: {}", e);
            None
        }
    }
}
