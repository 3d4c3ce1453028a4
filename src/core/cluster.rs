//! Cluster bootstrapping per deployment mode.
//!
//! Local mode ensures a kind cluster exists (creating it from a rendered
//! config, with the overlay network applied) and loads images straight into
//! its nodes. Cloud-hosted mode synthesizes a kubeconfig from the IaC
//! outputs and installs the ingress controller whose load balancer address
//! feeds the DNS/TLS apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::core::config::OrchestratorConfig;
use crate::core::deployment::progress::StageReporter;
use crate::core::docker::ImageRef;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};
use crate::core::templates;
use crate::core::workspace::Workspace;

pub const INGRESS_NAMESPACE: &str = "ingress-nginx";
pub const INGRESS_SERVICE: &str = "ingress-nginx-controller";

const LB_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Make sure the shared local kind cluster exists and export its kubeconfig
/// into the workspace.
pub async fn ensure_local_cluster(
    config: &OrchestratorConfig,
    workspace: &Workspace,
    reporter: &StageReporter,
) -> Result<()> {
    let name = &config.kind_cluster_name;
    let existing = process::require_captured(
        "kind",
        process::run_captured(&CommandSpec::new("kind").args(["get", "clusters"])).await?,
    )?;
    let present = existing.lines().any(|line| line.trim() == name.as_str());

    if !present {
        reporter
            .line(&format!("creating kind cluster '{}'", name))
            .await;
        let config_path = workspace.root().join("kind-config.yaml");
        templates::render_to_file(
            templates::KIND_CLUSTER_CONFIG,
            &templates::vars(&[("cluster_name", name.as_str()), ("pod_subnet", "10.244.0.0/16")]),
            &config_path,
        )?;

        let create = CommandSpec::new("kind")
            .args(["create", "cluster", "--name"])
            .arg(name.clone())
            .arg("--config")
            .arg(config_path.to_string_lossy().into_owned())
            .timeout(Duration::from_secs(10 * 60));
        let outcome = process::run_streamed(&create, reporter).await?;
        if !outcome.success() {
            return Err(process::exit_error("kind", &outcome));
        }
    } else {
        reporter
            .line(&format!("kind cluster '{}' already running", name))
            .await;
    }

    let export = CommandSpec::new("kind")
        .args(["get", "kubeconfig", "--name"])
        .arg(name.clone());
    let kubeconfig = process::require_captured("kind", process::run_captured(&export).await?)?;
    std::fs::write(workspace.kubeconfig_path(), kubeconfig).map_err(|e| {
        OrchestratorError::Configuration(format!("cannot write kubeconfig: {}", e))
    })?;

    if !present {
        // Fresh clusters come up without a CNI; apply the overlay network.
        let apply = CommandSpec::new("kubectl")
            .args(["apply", "-f"])
            .arg(config.calico_manifest_url.clone())
            .arg("--kubeconfig")
            .arg(workspace.kubeconfig_path().to_string_lossy().into_owned())
            .timeout(Duration::from_secs(3 * 60));
        let outcome = process::run_streamed(&apply, reporter).await?;
        if !outcome.success() {
            return Err(process::exit_error("kubectl", &outcome));
        }
    }

    info!("local cluster '{}' ready", name);
    Ok(())
}

/// Load a locally built image into the kind cluster's nodes.
pub async fn load_local_image(
    cluster_name: &str,
    image: &ImageRef,
    reporter: &StageReporter,
) -> Result<()> {
    let spec = CommandSpec::new("kind")
        .args(["load", "docker-image"])
        .arg(image.full_name())
        .arg("--name")
        .arg(cluster_name)
        .timeout(Duration::from_secs(5 * 60));
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("kind", &outcome));
    }
    Ok(())
}

/// Synthesize a deployment-scoped kubeconfig from the cluster outputs.
pub fn write_eks_kubeconfig(
    workspace: &Workspace,
    cluster_name: &str,
    endpoint: &str,
    ca_data: &str,
    region: &str,
) -> Result<PathBuf> {
    templates::render_to_file(
        templates::K8S_EKS_KUBECONFIG,
        &templates::vars(&[
            ("cluster_name", cluster_name),
            ("endpoint", endpoint),
            ("ca_data", ca_data),
            ("region", region),
        ]),
        &workspace.kubeconfig_path(),
    )
}

/// Install the nginx ingress controller via helm with rendered values.
pub async fn install_ingress_controller(
    kubeconfig: &Path,
    workspace: &Workspace,
    env: &HashMap<String, String>,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<()> {
    let mut helm_env = env.clone();
    helm_env.insert(
        "KUBECONFIG".to_string(),
        kubeconfig.to_string_lossy().into_owned(),
    );

    let repo_add = process::run_captured(
        &CommandSpec::new("helm")
            .args([
                "repo",
                "add",
                "ingress-nginx",
                "https://kubernetes.github.io/ingress-nginx",
            ])
            .envs(&helm_env)
            .timeout(Duration::from_secs(60)),
    )
    .await?;
    if !repo_add.success() && !repo_add.stderr.contains("already exists") {
        process::require_captured("helm", repo_add)?;
    }
    process::require_captured(
        "helm",
        process::run_captured(
            &CommandSpec::new("helm")
                .args(["repo", "update"])
                .envs(&helm_env)
                .timeout(Duration::from_secs(120)),
        )
        .await?,
    )?;

    let values_path = workspace.manifests_dir().join("ingress-nginx-values.yaml");
    templates::render_to_file(
        templates::HELM_INGRESS_NGINX_VALUES,
        &templates::vars(&[("load_balancer_type", "nlb")]),
        &values_path,
    )?;

    let install = CommandSpec::new("helm")
        .args([
            "upgrade",
            "--install",
            "ingress-nginx",
            "ingress-nginx/ingress-nginx",
            "--namespace",
            INGRESS_NAMESPACE,
            "--create-namespace",
            "--wait",
            "--values",
        ])
        .arg(values_path.to_string_lossy().into_owned())
        .envs(&helm_env)
        .timeout(timeout);
    let outcome = process::run_streamed(&install, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("helm", &outcome));
    }
    Ok(())
}

/// Poll the ingress controller's service until the cloud load balancer has
/// an externally resolvable address.
pub async fn wait_for_load_balancer(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
    reporter: &StageReporter,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let get_service = CommandSpec::new("kubectl")
            .args([
                "get",
                "service",
                INGRESS_SERVICE,
                "-n",
                INGRESS_NAMESPACE,
                "-o",
                "json",
                "--kubeconfig",
            ])
            .arg(kubeconfig.to_string_lossy().into_owned())
            .envs(env)
            .timeout(Duration::from_secs(60));
        let captured = process::run_captured(&get_service).await?;

        if captured.success() {
            if let Some(address) = parse_load_balancer_address(&captured.stdout) {
                reporter
                    .line(&format!("load balancer allocated: {}", address))
                    .await;
                return Ok(address);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(OrchestratorError::RolloutTimeout {
                deployment: INGRESS_SERVICE.to_string(),
                seconds: timeout.as_secs(),
                last_status: "load balancer address was never allocated".to_string(),
            });
        }
        reporter.line("waiting for load balancer allocation").await;
        tokio::time::sleep(LB_POLL_INTERVAL).await;
    }
}

pub fn parse_load_balancer_address(service_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(service_json).ok()?;
    let ingress = value
        .get("status")?
        .get("loadBalancer")?
        .get("ingress")?
        .as_array()?
        .first()?;
    ingress
        .get("hostname")
        .or_else(|| ingress.get("ip"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Resolve the NLB's canonical hosted zone id from its DNS name; the DNS/TLS
/// apply needs it for the alias record.
pub async fn lookup_nlb_hosted_zone(
    lb_dns_name: &str,
    env: &HashMap<String, String>,
) -> Result<String> {
    let captured = process::require_captured(
        "aws",
        process::run_captured(
            &CommandSpec::new("aws")
                .args(["elbv2", "describe-load-balancers", "--output", "json"])
                .envs(env)
                .timeout(Duration::from_secs(60)),
        )
        .await?,
    )?;
    parse_nlb_hosted_zone(&captured, lb_dns_name).ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "no load balancer with DNS name '{}' found",
            lb_dns_name
        ))
    })
}

pub fn parse_nlb_hosted_zone(describe_json: &str, lb_dns_name: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(describe_json).ok()?;
    value
        .get("LoadBalancers")?
        .as_array()?
        .iter()
        .find(|lb| lb.get("DNSName").and_then(|v| v.as_str()) == Some(lb_dns_name))?
        .get("CanonicalHostedZoneId")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_balancer_hostname_wins_over_ip() {
        let json = r#"{"status":{"loadBalancer":{"ingress":[
            {"hostname":"abc.elb.us-east-1.amazonaws.com","ip":"203.0.113.1"}
        ]}}}"#;
        assert_eq!(
            parse_load_balancer_address(json).as_deref(),
            Some("abc.elb.us-east-1.amazonaws.com")
        );
    }

    #[test]
    fn pending_load_balancer_yields_none() {
        let json = r#"{"status":{"loadBalancer":{}}}"#;
        assert!(parse_load_balancer_address(json).is_none());
    }

    #[test]
    fn nlb_hosted_zone_is_matched_by_dns_name() {
        let json = r#"{"LoadBalancers":[
            {"DNSName":"other.elb.amazonaws.com","CanonicalHostedZoneId":"ZOTHER"},
            {"DNSName":"mine.elb.amazonaws.com","CanonicalHostedZoneId":"ZMINE"}
        ]}"#;
        assert_eq!(
            parse_nlb_hosted_zone(json, "mine.elb.amazonaws.com").as_deref(),
            Some("ZMINE")
        );
        assert!(parse_nlb_hosted_zone(json, "absent.elb.amazonaws.com").is_none());
    }
}
