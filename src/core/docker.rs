//! Container image building for the three deployment modes.
//!
//! Local mode builds against the host daemon; cloud-local ships a source
//! tarball to the VM and builds there; cloud-hosted builds locally and
//! pushes to the registry provisioned by the first IaC apply.

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::core::credentials::CredentialScope;
use crate::core::deployment::progress::StageReporter;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};
use crate::core::ssh::SshTarget;
use crate::core::workspace::Workspace;

/// `{registry, repository, tag}`. The repository is the deployment id and
/// the tag a short content-derived suffix, so every build is unique per
/// deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn local(deployment_id: &str, commit: &str) -> Self {
        Self {
            registry: None,
            repository: deployment_id.to_string(),
            tag: fresh_tag_suffix(commit),
        }
    }

    /// Qualify this reference with a registry URL such as an ECR repository
    /// URL (`<account>.dkr.ecr.<region>.amazonaws.com/<name>`).
    pub fn with_registry(&self, registry_url: &str) -> Self {
        let (host, path) = match registry_url.split_once('/') {
            Some((host, path)) => (host.to_string(), path.to_string()),
            None => (registry_url.to_string(), self.repository.clone()),
        };
        Self {
            registry: Some(host),
            repository: path,
            tag: self.tag.clone(),
        }
    }

    pub fn registry_host(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn full_name(&self) -> String {
        match &self.registry {
            Some(host) => format!("{}/{}:{}", host, self.repository, self.tag),
            None => format!("{}:{}", self.repository, self.tag),
        }
    }
}

/// Short suffix from the commit id plus a per-build nonce: identical commits
/// still get a fresh tag on redeploy.
pub fn fresh_tag_suffix(commit: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(commit.as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Build against the local daemon.
pub async fn build_local(
    source_dir: &Path,
    image: &ImageRef,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<()> {
    let spec = CommandSpec::new("docker")
        .args(["build", "-t"])
        .arg(image.full_name())
        .arg(source_dir.to_string_lossy().into_owned())
        .timeout(timeout);
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("docker", &outcome));
    }
    info!("built image {}", image.full_name());
    Ok(())
}

/// Build on the remote VM: tar the checkout, copy it over, build there and
/// load the result into the VM's kind cluster.
pub async fn build_remote(
    target: &SshTarget,
    workspace: &Workspace,
    image: &ImageRef,
    cluster_name: &str,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<()> {
    let tarball = workspace.root().join("source.tar.gz");
    let tar_spec = CommandSpec::new("tar")
        .arg("czf")
        .arg(tarball.to_string_lossy().into_owned())
        .arg("-C")
        .arg(workspace.source_dir().to_string_lossy().into_owned())
        .arg(".")
        .timeout(Duration::from_secs(5 * 60));
    let outcome = process::run_streamed(&tar_spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("tar", &outcome));
    }

    let remote_tar = format!("/tmp/{}-source.tar.gz", image.repository);
    let remote_src = format!("/tmp/{}-src", image.repository);
    target
        .copy_to(&tarball, &remote_tar, Duration::from_secs(10 * 60), reporter)
        .await?;

    let remote_build = format!(
        "rm -rf {src} && mkdir -p {src} && tar xzf {tar} -C {src} && \
         sudo docker build -t {image} {src} && \
         sudo kind load docker-image {image} --name {cluster}",
        src = remote_src,
        tar = remote_tar,
        image = image.full_name(),
        cluster = cluster_name,
    );
    let outcome = target.exec_streamed(&remote_build, timeout, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("ssh", &outcome));
    }
    info!("built and loaded {} on {}", image.full_name(), target.host);
    Ok(())
}

/// Authenticate the local daemon to the ECR registry. The token travels via
/// stdin only; it never appears in argv or progress output.
pub async fn login_registry(
    registry_host: &str,
    scope: &CredentialScope,
    reporter: &StageReporter,
) -> Result<()> {
    let token_spec = CommandSpec::new("aws")
        .args(["ecr", "get-login-password", "--region", scope.region()])
        .envs(&scope.env_map())
        .timeout(Duration::from_secs(60));
    let captured = process::run_captured(&token_spec).await?;
    if !captured.success() {
        return Err(OrchestratorError::Credential(format!(
            "ecr get-login-password failed: {}",
            captured.stderr.lines().next().unwrap_or("unknown error")
        )));
    }

    let login_spec = CommandSpec::new("docker")
        .args(["login", "--username", "AWS", "--password-stdin", registry_host])
        .stdin(captured.stdout.trim().to_string())
        .timeout(Duration::from_secs(60));
    let login = process::run_captured(&login_spec).await?;
    if !login.success() {
        return Err(OrchestratorError::Credential(format!(
            "docker login to {} rejected: {}",
            registry_host,
            login.stderr.lines().next().unwrap_or("unknown error")
        )));
    }
    reporter
        .line(&format!("authenticated to registry {}", registry_host))
        .await;
    Ok(())
}

/// Tag the locally built image with its registry-qualified name and push.
pub async fn push(
    local: &ImageRef,
    remote: &ImageRef,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<()> {
    let tag_spec = CommandSpec::new("docker")
        .arg("tag")
        .arg(local.full_name())
        .arg(remote.full_name())
        .timeout(Duration::from_secs(60));
    process::require_captured("docker", process::run_captured(&tag_spec).await?)?;

    let push_spec = CommandSpec::new("docker")
        .arg("push")
        .arg(remote.full_name())
        .timeout(timeout);
    let outcome = process::run_streamed(&push_spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("docker", &outcome));
    }
    info!("pushed {}", remote.full_name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_suffix_is_short_hex_and_fresh_per_build() {
        let a = fresh_tag_suffix("abc123");
        let b = fresh_tag_suffix("abc123");
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn local_reference_uses_the_deployment_id() {
        let image = ImageRef::local("dep-web", "abc123");
        assert!(image.full_name().starts_with("dep-web:"));
        assert!(image.registry.is_none());
    }

    #[test]
    fn registry_qualification_splits_host_and_path() {
        let image = ImageRef::local("dep-web", "abc123");
        let remote = image.with_registry("123456789.dkr.ecr.us-east-1.amazonaws.com/dep-web");
        assert_eq!(
            remote.registry_host(),
            Some("123456789.dkr.ecr.us-east-1.amazonaws.com")
        );
        assert_eq!(remote.repository, "dep-web");
        assert_eq!(remote.tag, image.tag);
        assert_eq!(
            remote.full_name(),
            format!("123456789.dkr.ecr.us-east-1.amazonaws.com/dep-web:{}", image.tag)
        );
    }
}
