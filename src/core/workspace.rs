//! Per-deployment workspace store.
//!
//! A workspace is the on-disk unit of deployment state: cloned source,
//! rendered IaC and manifests, per-stage logs, and the authoritative
//! `meta.json` record. The IaC state under `tf/` transitively owns every
//! cloud resource the deployment created, so release is gated on the
//! `tf/state.exists` marker unless the caller forces it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::core::deployment::DeploymentMode;
use crate::core::errors::{OrchestratorError, Result};

pub const IAC_STATE_MARKER: &str = "state.exists";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaError {
    pub kind: String,
    pub message: String,
}

/// The durable record the orchestrator consults when resuming, redeploying
/// or decommissioning. Unknown fields are ignored on read so older binaries
/// can open newer workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub id: String,
    pub mode: DeploymentMode,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaError>,
    #[serde(default)]
    pub decommission_attempted: bool,
}

impl DeploymentMeta {
    pub fn new(id: &str, mode: DeploymentMode, status: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            mode,
            status: status.to_string(),
            created_at: now,
            updated_at: now,
            image_ref: None,
            outputs: HashMap::new(),
            error: None,
            decommission_attempted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    id: String,
    root: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn tf_dir(&self) -> PathBuf {
        self.root.join("tf")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.root.join("kubeconfig.yaml")
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    /// True while IaC state claims live cloud resources.
    pub fn has_iac_state(&self) -> bool {
        self.tf_dir().join(IAC_STATE_MARKER).exists()
    }

    /// Record that an apply has created cloud resources for this deployment.
    pub fn mark_iac_state(&self) -> Result<()> {
        std::fs::create_dir_all(self.tf_dir()).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot create tf dir: {}", e))
        })?;
        std::fs::write(self.tf_dir().join(IAC_STATE_MARKER), "").map_err(|e| {
            OrchestratorError::Configuration(format!("cannot write IaC state marker: {}", e))
        })
    }

    /// Clear the marker after every root has been destroyed.
    pub fn clear_iac_state(&self) -> Result<()> {
        let marker = self.tf_dir().join(IAC_STATE_MARKER);
        if marker.exists() {
            std::fs::remove_file(&marker).map_err(|e| {
                OrchestratorError::Decommission(format!("cannot clear IaC state marker: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn read_meta(&self) -> Result<Option<DeploymentMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let meta = serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::Configuration(format!("corrupt {}: {}", path.display(), e))
        })?;
        Ok(Some(meta))
    }

    pub fn write_meta(&self, meta: &mut DeploymentMeta) -> Result<()> {
        meta.updated_at = Utc::now();
        let raw = serde_json::to_string_pretty(meta)
            .map_err(|e| OrchestratorError::Configuration(format!("serialize meta: {}", e)))?;
        std::fs::write(self.meta_path(), raw).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot write {}: {}",
                self.meta_path().display(),
                e
            ))
        })
    }
}

/// Allocates, locates and reclaims workspaces under the configured base
/// path, and hands out the per-deployment advisory locks that serialize
/// pipeline runs for the same id.
pub struct WorkspaceStore {
    base: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn workspace(&self, id: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            root: self.base.join(id),
        }
    }

    /// Create the workspace root. An existing directory is only acceptable
    /// when the caller is resuming a prior run. Stage directories (source,
    /// tf, manifests) appear lazily as their stages run, so a failed clone
    /// leaves nothing but `source/` and `logs/` behind.
    pub fn allocate(&self, id: &str, resume: bool) -> Result<Workspace> {
        let ws = self.workspace(id);
        if ws.root.exists() && !resume {
            return Err(OrchestratorError::Validation(format!(
                "deployment '{}' already has a workspace",
                id
            )));
        }
        for dir in [ws.root.clone(), ws.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "cannot create {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(ws)
    }

    /// Read-only lookup; `None` when no workspace exists for the id.
    pub fn locate(&self, id: &str) -> Option<Workspace> {
        let ws = self.workspace(id);
        if ws.root.is_dir() { Some(ws) } else { None }
    }

    /// Recursively delete a workspace. Refuses while the IaC state marker is
    /// present, unless the caller asserts force.
    pub fn release(&self, id: &str, force: bool) -> Result<()> {
        let Some(ws) = self.locate(id) else {
            return Ok(());
        };
        if ws.has_iac_state() && !force {
            return Err(OrchestratorError::Decommission(format!(
                "workspace '{}' still holds IaC state; destroy it first or force the release",
                ws.id
            )));
        }
        std::fs::remove_dir_all(ws.root()).map_err(|e| {
            OrchestratorError::Decommission(format!("cannot remove workspace '{}': {}", ws.id, e))
        })?;
        info!("released workspace for deployment '{}'", ws.id);
        Ok(())
    }

    /// Advisory exclusive lock for a deployment id. The guard is owned so a
    /// pipeline can hold it across await points for its whole run.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, WorkspaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn allocate_creates_root_and_logs_only() {
        let (_dir, store) = store();
        let ws = store.allocate("dep-1", false).unwrap();
        assert!(ws.root().is_dir());
        assert!(ws.logs_dir().is_dir());
        // Stage directories appear when their stages run.
        assert!(!ws.tf_dir().exists());
        assert!(!ws.manifests_dir().exists());
    }

    #[test]
    fn allocate_refuses_an_existing_workspace_unless_resuming() {
        let (_dir, store) = store();
        store.allocate("dep-1", false).unwrap();
        let err = store.allocate("dep-1", false).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(store.allocate("dep-1", true).is_ok());
    }

    #[test]
    fn release_refuses_while_iac_state_exists() {
        let (_dir, store) = store();
        let ws = store.allocate("dep-1", false).unwrap();
        std::fs::create_dir_all(ws.tf_dir()).unwrap();
        std::fs::write(ws.tf_dir().join(IAC_STATE_MARKER), "").unwrap();

        let err = store.release("dep-1", false).unwrap_err();
        assert_eq!(err.kind(), "DecommissionError");
        assert!(store.locate("dep-1").is_some());

        store.release("dep-1", true).unwrap();
        assert!(store.locate("dep-1").is_none());
    }

    #[test]
    fn meta_round_trips_and_ignores_unknown_fields() {
        let (_dir, store) = store();
        let ws = store.allocate("dep-1", false).unwrap();

        let mut meta = DeploymentMeta::new("dep-1", DeploymentMode::Local, "running");
        meta.outputs
            .insert("public_ip".to_string(), "203.0.113.7".to_string());
        ws.write_meta(&mut meta).unwrap();

        let read = ws.read_meta().unwrap().unwrap();
        assert_eq!(read.id, "dep-1");
        assert_eq!(read.outputs["public_ip"], "203.0.113.7");

        // A newer writer may add fields; reads must tolerate them.
        let raw = std::fs::read_to_string(ws.root().join("meta.json")).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["a_future_field"] = serde_json::json!({"x": 1});
        std::fs::write(
            ws.root().join("meta.json"),
            serde_json::to_string(&value).unwrap(),
        )
        .unwrap();
        assert!(ws.read_meta().unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_serializes_same_id_and_not_distinct_ids() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let guard = store.lock("dep-1").await;

        // A distinct id is not blocked.
        let other = store.lock("dep-2").await;
        drop(other);

        // The same id is blocked until the guard drops.
        let contended = {
            let store = store.clone();
            tokio::spawn(async move {
                let _g = store.lock("dep-1").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contended.is_finished());
        drop(guard);
        contended.await.unwrap();
    }
}
