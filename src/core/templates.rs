//! Bundled IaC and manifest templates.
//!
//! Templates ship inside the binary so a deployed orchestrator has no
//! filesystem layout requirements. Rendering is a flat `{{variable}}`
//! substitution pass; each template's variable set is a contract checked at
//! startup by [`verify_bundled`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use include_dir::{Dir, include_dir};

use crate::core::errors::{OrchestratorError, Result};

static TEMPLATES: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/templates");

pub const KIND_CLUSTER_CONFIG: &str = "kind/cluster-config.yaml.tmpl";
pub const TF_EC2_INSTANCE: &str = "tf/ec2-instance.tf.tmpl";
pub const TF_EKS_CLUSTER: &str = "tf/eks-cluster.tf.tmpl";
pub const TF_EKS_DNS_TLS: &str = "tf/eks-dns-tls.tf.tmpl";
pub const K8S_NAMESPACE: &str = "k8s/namespace.yaml.tmpl";
pub const K8S_DEPLOYMENT: &str = "k8s/deployment.yaml.tmpl";
pub const K8S_SERVICE: &str = "k8s/service.yaml.tmpl";
pub const K8S_INGRESS: &str = "k8s/ingress.yaml.tmpl";
pub const K8S_SECRET: &str = "k8s/secret.yaml.tmpl";
pub const K8S_EKS_KUBECONFIG: &str = "k8s/eks-kubeconfig.yaml.tmpl";
pub const HELM_INGRESS_NGINX_VALUES: &str = "helm/ingress-nginx-values.yaml.tmpl";

/// Per-template variable contract. A template may not reference a variable
/// outside its declared set; callers must supply every declared variable.
const CONTRACTS: &[(&str, &[&str])] = &[
    (KIND_CLUSTER_CONFIG, &["cluster_name", "pod_subnet"]),
    (
        TF_EC2_INSTANCE,
        &[
            "deployment_id",
            "instance_type",
            "key_name",
            "cluster_name",
            "instance_name",
        ],
    ),
    (TF_EKS_CLUSTER, &["deployment_id", "cluster_name"]),
    (TF_EKS_DNS_TLS, &["app_fqdn", "base_hosted_zone_id"]),
    (K8S_NAMESPACE, &["namespace"]),
    (
        K8S_DEPLOYMENT,
        &[
            "app_name",
            "namespace",
            "image",
            "image_pull_policy",
            "replicas",
            "container_port",
            "env_block",
        ],
    ),
    (
        K8S_SERVICE,
        &["app_name", "namespace", "service_type", "port", "target_port"],
    ),
    (K8S_INGRESS, &["app_name", "namespace", "host", "service_port"]),
    (K8S_SECRET, &["app_name", "namespace", "string_data_block"]),
    (
        K8S_EKS_KUBECONFIG,
        &["cluster_name", "endpoint", "ca_data", "region"],
    ),
    (HELM_INGRESS_NGINX_VALUES, &["load_balancer_type"]),
];

fn template_body(name: &str) -> Result<&'static str> {
    TEMPLATES
        .get_file(name)
        .and_then(|f| f.contents_utf8())
        .ok_or_else(|| OrchestratorError::UnknownTemplate(name.to_string()))
}

fn placeholders(body: &str) -> BTreeSet<String> {
    let re = regex::Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
    re.captures_iter(body)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render a bundled template with a flat variable bag. Fails fast with the
/// full list of missing variables.
pub fn render(name: &str, vars: &HashMap<String, String>) -> Result<String> {
    let body = template_body(name)?;

    let missing: Vec<String> = placeholders(body)
        .into_iter()
        .filter(|p| !vars.contains_key(p))
        .collect();
    if !missing.is_empty() {
        return Err(OrchestratorError::Template {
            template: name.to_string(),
            missing,
        });
    }

    let re = regex::Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
    let rendered = re.replace_all(body, |caps: &regex::Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

/// Render a template and write it to `dest`, creating parent directories.
pub fn render_to_file(
    name: &str,
    vars: &HashMap<String, String>,
    dest: &Path,
) -> Result<PathBuf> {
    let rendered = render(name, vars)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot create {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    std::fs::write(dest, rendered).map_err(|e| {
        OrchestratorError::Configuration(format!("cannot write {}: {}", dest.display(), e))
    })?;
    Ok(dest.to_path_buf())
}

/// Startup check: every contracted template is present and references only
/// its declared variables.
pub fn verify_bundled() -> Result<()> {
    for (name, declared) in CONTRACTS {
        let body = template_body(name)?;
        let declared: BTreeSet<&str> = declared.iter().copied().collect();
        let undeclared: Vec<String> = placeholders(body)
            .into_iter()
            .filter(|p| !declared.contains(p.as_str()))
            .collect();
        if !undeclared.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "template '{}' references undeclared variables: {:?}",
                name, undeclared
            )));
        }
    }
    Ok(())
}

/// Build a flat variable bag from string pairs.
pub fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_templates_pass_contract_verification() {
        verify_bundled().unwrap();
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let out = render(K8S_NAMESPACE, &vars(&[("namespace", "demo")])).unwrap();
        assert!(out.contains("name: demo"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn render_lists_every_missing_variable() {
        let err = render(K8S_SERVICE, &vars(&[("app_name", "web")])).unwrap_err();
        match err {
            OrchestratorError::Template { template, missing } => {
                assert_eq!(template, K8S_SERVICE);
                assert!(missing.contains(&"namespace".to_string()));
                assert!(missing.contains(&"service_type".to_string()));
                assert!(missing.contains(&"port".to_string()));
                assert!(missing.contains(&"target_port".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn render_is_reproducible() {
        let v = vars(&[("namespace", "ns1")]);
        assert_eq!(render(K8S_NAMESPACE, &v).unwrap(), render(K8S_NAMESPACE, &v).unwrap());
    }

    #[test]
    fn unknown_template_is_a_template_error() {
        let err = render("nope/missing.tmpl", &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
    }
}
