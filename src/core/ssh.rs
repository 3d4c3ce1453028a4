//! Secure-shell plumbing for the cloud-local mode.
//!
//! Remote operations go through the system `ssh`/`scp` binaries like every
//! other external tool. Keys are looked up under the configured base
//! directory as `<key_name>.pem`, then `<key_name>`; a missing key is a
//! configuration error, not a pipeline error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::config::OrchestratorConfig;
use crate::core::deployment::progress::StageReporter;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CapturedOutput, CommandOutcome, CommandSpec};

pub const REMOTE_USER: &str = "ec2-user";
pub const BOOTSTRAP_SENTINEL: &str = "/var/lib/bootstrap/ready";

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Locate the private key for `key_name` under the configured directory.
pub fn resolve_key_path(config: &OrchestratorConfig, key_name: &str) -> Result<PathBuf> {
    let base = config.key_base_path.as_ref().ok_or_else(|| {
        OrchestratorError::Configuration(
            "EC2_PRIVATE_KEY_BASE_PATH is not set; cannot reach the instance".to_string(),
        )
    })?;

    for candidate in [base.join(format!("{}.pem", key_name)), base.join(key_name)] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(OrchestratorError::Configuration(format!(
        "private key '{}' not found under {}",
        key_name,
        base.display()
    )))
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn new(host: &str, key_path: PathBuf) -> Self {
        Self {
            host: host.to_string(),
            user: REMOTE_USER.to_string(),
            key_path,
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Run a remote command, streaming its output as progress events.
    pub async fn exec_streamed(
        &self,
        command: &str,
        timeout: Duration,
        reporter: &StageReporter,
    ) -> Result<CommandOutcome> {
        let spec = CommandSpec::new("ssh")
            .args(self.common_args())
            .arg(self.destination())
            .arg(command)
            .timeout(timeout);
        process::run_streamed(&spec, reporter).await
    }

    /// Run a remote command quietly, capturing stdout.
    pub async fn exec_captured(&self, command: &str, timeout: Duration) -> Result<CapturedOutput> {
        let spec = CommandSpec::new("ssh")
            .args(self.common_args())
            .arg(self.destination())
            .arg(command)
            .timeout(timeout);
        process::run_captured(&spec).await
    }

    /// Copy a local file onto the instance via scp.
    pub async fn copy_to(
        &self,
        local: &Path,
        remote: &str,
        timeout: Duration,
        reporter: &StageReporter,
    ) -> Result<()> {
        let spec = CommandSpec::new("scp")
            .args(self.common_args())
            .arg(local.to_string_lossy().into_owned())
            .arg(format!("{}:{}", self.destination(), remote))
            .timeout(timeout);
        let outcome = process::run_streamed(&spec, reporter).await?;
        if !outcome.success() {
            return Err(process::exit_error("scp", &outcome));
        }
        Ok(())
    }

    /// Poll for the bootstrap sentinel until it appears or `total` elapses.
    /// Connection refusals are expected while the instance is still coming
    /// up, so individual probe failures are not fatal.
    pub async fn wait_for_sentinel(
        &self,
        sentinel: &str,
        total: Duration,
        reporter: &StageReporter,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + total;
        loop {
            let probe = self
                .exec_captured(&format!("test -f {}", sentinel), Duration::from_secs(30))
                .await;
            if matches!(probe, Ok(ref captured) if captured.success()) {
                reporter.line("instance bootstrap complete").await;
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::SubprocessExit {
                    program: "ssh".to_string(),
                    code: None,
                    timed_out: true,
                    tail: format!(
                        "bootstrap sentinel {} did not appear on {} within {}s",
                        sentinel,
                        self.host,
                        total.as_secs()
                    ),
                });
            }

            reporter
                .line(&format!("waiting for instance bootstrap on {}", self.host))
                .await;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_lookup_prefers_the_pem_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo-key.pem"), "k1").unwrap();
        std::fs::write(dir.path().join("demo-key"), "k2").unwrap();

        let mut config = OrchestratorConfig::from_env();
        config.key_base_path = Some(dir.path().to_path_buf());

        let resolved = resolve_key_path(&config, "demo-key").unwrap();
        assert_eq!(resolved, dir.path().join("demo-key.pem"));
    }

    #[test]
    fn key_lookup_falls_back_to_the_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo-key"), "k2").unwrap();

        let mut config = OrchestratorConfig::from_env();
        config.key_base_path = Some(dir.path().to_path_buf());

        let resolved = resolve_key_path(&config, "demo-key").unwrap();
        assert_eq!(resolved, dir.path().join("demo-key"));
    }

    #[test]
    fn missing_key_directory_is_a_configuration_error() {
        let mut config = OrchestratorConfig::from_env();
        config.key_base_path = None;
        let err = resolve_key_path(&config, "demo-key").unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn missing_key_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::from_env();
        config.key_base_path = Some(dir.path().to_path_buf());
        let err = resolve_key_path(&config, "absent").unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
