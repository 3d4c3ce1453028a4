mod handlers;
mod router;
pub mod schemas;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::config::OrchestratorConfig;
use crate::core::deployment::DeploymentRegistry;
use crate::core::intent::{AzureOpenAiModel, IntentModel};
use crate::core::templates;
use crate::core::workspace::WorkspaceStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) store: Arc<WorkspaceStore>,
    pub(crate) registry: DeploymentRegistry,
    pub(crate) intent: Option<Arc<dyn IntentModel>>,
}

pub struct ApiServer {
    config: Arc<OrchestratorConfig>,
}

impl ApiServer {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Serve the chat API until the process exits.
    pub async fn serve(&self) -> Result<()> {
        // Template contracts are part of startup, not first use.
        templates::verify_bundled()?;
        std::fs::create_dir_all(&self.config.workspace_base)?;

        let intent: Option<Arc<dyn IntentModel>> = self
            .config
            .azure_openai
            .clone()
            .map(|azure| Arc::new(AzureOpenAiModel::new(azure)) as Arc<dyn IntentModel>);
        if intent.is_some() {
            info!("intent extractor enabled (Azure OpenAI)");
        }

        let state = AppState {
            config: self.config.clone(),
            store: Arc::new(WorkspaceStore::new(self.config.workspace_base.clone())),
            registry: DeploymentRegistry::new(),
            intent,
        };
        let app = router::build_api_router(state);

        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("API server listening on http://{}", listener.local_addr()?);
        axum::serve(listener, app).await?;
        Ok(())
    }
}
