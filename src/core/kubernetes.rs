//! Manifest rendering and application.
//!
//! A fixed manifest set per deployment: namespace, deployment, service,
//! optional secret (application env vars) and optional ingress. Scaling is a
//! direct replica patch; redeploys rewrite the deployment manifest's image
//! field and re-apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::deployment::progress::StageReporter;
use crate::core::docker::ImageRef;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};
use crate::core::templates;
use crate::core::workspace::Workspace;

pub struct ManifestInputs<'a> {
    pub app_name: &'a str,
    pub namespace: &'a str,
    pub image: &'a ImageRef,
    pub replicas: u32,
    pub container_port: u16,
    pub service_type: &'a str,
    pub image_pull_policy: &'a str,
    pub env_vars: &'a HashMap<String, String>,
    pub ingress_host: Option<&'a str>,
}

fn yaml_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn secret_string_data_block(env_vars: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = env_vars.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("  {}: {}", k, yaml_quote(&env_vars[*k])))
        .collect::<Vec<_>>()
        .join("\n")
}

fn env_from_block(app_name: &str) -> String {
    format!(
        "          envFrom:\n            - secretRef:\n                name: {}-env",
        app_name
    )
}

/// Render the manifest set into `workspace/manifests/`, returning the files
/// in application order (namespace first).
pub fn render_manifests(workspace: &Workspace, inputs: &ManifestInputs<'_>) -> Result<Vec<PathBuf>> {
    let dir = workspace.manifests_dir();
    let mut files = Vec::new();

    files.push(templates::render_to_file(
        templates::K8S_NAMESPACE,
        &templates::vars(&[("namespace", inputs.namespace)]),
        &dir.join("namespace.yaml"),
    )?);

    let has_secret = !inputs.env_vars.is_empty();
    if has_secret {
        let mut vars = templates::vars(&[
            ("app_name", inputs.app_name),
            ("namespace", inputs.namespace),
        ]);
        vars.insert(
            "string_data_block".to_string(),
            secret_string_data_block(inputs.env_vars),
        );
        files.push(templates::render_to_file(
            templates::K8S_SECRET,
            &vars,
            &dir.join("secret.yaml"),
        )?);
    }

    let image = inputs.image.full_name();
    let replicas = inputs.replicas.to_string();
    let port = inputs.container_port.to_string();
    let mut vars = templates::vars(&[
        ("app_name", inputs.app_name),
        ("namespace", inputs.namespace),
        ("image", image.as_str()),
        ("image_pull_policy", inputs.image_pull_policy),
        ("replicas", replicas.as_str()),
        ("container_port", port.as_str()),
    ]);
    vars.insert(
        "env_block".to_string(),
        if has_secret {
            env_from_block(inputs.app_name)
        } else {
            String::new()
        },
    );
    files.push(templates::render_to_file(
        templates::K8S_DEPLOYMENT,
        &vars,
        &dir.join("deployment.yaml"),
    )?);

    files.push(templates::render_to_file(
        templates::K8S_SERVICE,
        &templates::vars(&[
            ("app_name", inputs.app_name),
            ("namespace", inputs.namespace),
            ("service_type", inputs.service_type),
            ("port", port.as_str()),
            ("target_port", port.as_str()),
        ]),
        &dir.join("service.yaml"),
    )?);

    if let Some(host) = inputs.ingress_host {
        files.push(templates::render_to_file(
            templates::K8S_INGRESS,
            &templates::vars(&[
                ("app_name", inputs.app_name),
                ("namespace", inputs.namespace),
                ("host", host),
                ("service_port", port.as_str()),
            ]),
            &dir.join("ingress.yaml"),
        )?);
    }

    Ok(files)
}

async fn kubectl(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    args: &[&str],
    timeout: Duration,
) -> Result<process::CapturedOutput> {
    let spec = CommandSpec::new("kubectl")
        .args(args.iter().map(|s| s.to_string()))
        .args([
            "--kubeconfig".to_string(),
            kubeconfig.to_string_lossy().into_owned(),
        ])
        .envs(env)
        .timeout(timeout);
    process::run_captured(&spec).await
}

/// Apply the rendered manifest files in order.
pub async fn apply_manifests(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    files: &[PathBuf],
    reporter: &StageReporter,
) -> Result<()> {
    for file in files {
        let spec = CommandSpec::new("kubectl")
            .args(["apply", "-f"])
            .arg(file.to_string_lossy().into_owned())
            .arg("--kubeconfig")
            .arg(kubeconfig.to_string_lossy().into_owned())
            .envs(env)
            .timeout(Duration::from_secs(120));
        let outcome = process::run_streamed(&spec, reporter).await?;
        if !outcome.success() {
            return Err(process::exit_error("kubectl", &outcome));
        }
    }
    Ok(())
}

/// Block until the rollout converges or the timeout elapses.
pub async fn wait_for_rollout(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    namespace: &str,
    app_name: &str,
    timeout: Duration,
    reporter: &StageReporter,
) -> Result<()> {
    let spec = CommandSpec::new("kubectl")
        .args(["rollout", "status"])
        .arg(format!("deployment/{}", app_name))
        .arg("-n")
        .arg(namespace)
        .arg(format!("--timeout={}s", timeout.as_secs()))
        .arg("--kubeconfig")
        .arg(kubeconfig.to_string_lossy().into_owned())
        .envs(env)
        // Leave headroom so kubectl's own timeout fires first.
        .timeout(timeout + Duration::from_secs(30));
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        let last_status = outcome
            .tail
            .last()
            .cloned()
            .unwrap_or_else(|| "no rollout status observed".to_string());
        return Err(OrchestratorError::RolloutTimeout {
            deployment: app_name.to_string(),
            seconds: timeout.as_secs(),
            last_status,
        });
    }
    Ok(())
}

/// Patch the replica count directly; no re-render, no image build.
pub async fn scale(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    namespace: &str,
    app_name: &str,
    replicas: u32,
    reporter: &StageReporter,
) -> Result<()> {
    let captured = kubectl(
        kubeconfig,
        env,
        &[
            "scale",
            &format!("deployment/{}", app_name),
            "-n",
            namespace,
            &format!("--replicas={}", replicas),
        ],
        Duration::from_secs(60),
    )
    .await?;
    process::require_captured("kubectl", captured)?;
    reporter
        .line(&format!("scaled {} to {} replicas", app_name, replicas))
        .await;
    Ok(())
}

/// NodePort assigned to the application service (local and cloud-local URLs).
pub async fn get_node_port(
    kubeconfig: &Path,
    env: &HashMap<String, String>,
    namespace: &str,
    app_name: &str,
) -> Result<u16> {
    let captured = kubectl(
        kubeconfig,
        env,
        &["get", "service", app_name, "-n", namespace, "-o", "json"],
        Duration::from_secs(60),
    )
    .await?;
    let stdout = process::require_captured("kubectl", captured)?;
    parse_node_port(&stdout).ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "service '{}' has no NodePort assigned",
            app_name
        ))
    })
}

pub fn parse_node_port(service_json: &str) -> Option<u16> {
    let value: serde_json::Value = serde_json::from_str(service_json).ok()?;
    value
        .get("spec")?
        .get("ports")?
        .as_array()?
        .first()?
        .get("nodePort")?
        .as_u64()
        .map(|p| p as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workspace::WorkspaceStore;

    fn inputs<'a>(
        image: &'a ImageRef,
        env_vars: &'a HashMap<String, String>,
        host: Option<&'a str>,
    ) -> ManifestInputs<'a> {
        ManifestInputs {
            app_name: "dep-web",
            namespace: "apps",
            image,
            replicas: 2,
            container_port: 3000,
            service_type: "NodePort",
            image_pull_policy: "IfNotPresent",
            env_vars,
            ingress_host: host,
        }
    }

    #[test]
    fn manifest_set_without_extras_is_namespace_deployment_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());
        let ws = store.allocate("dep-web", false).unwrap();

        let image = ImageRef::local("dep-web", "abc");
        let env_vars = HashMap::new();
        let files = render_manifests(&ws, &inputs(&image, &env_vars, None)).unwrap();

        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["namespace.yaml", "deployment.yaml", "service.yaml"]);

        let deployment = std::fs::read_to_string(ws.manifests_dir().join("deployment.yaml")).unwrap();
        assert!(deployment.contains(&image.full_name()));
        assert!(deployment.contains("replicas: 2"));
        assert!(!deployment.contains("envFrom"));
    }

    #[test]
    fn env_vars_produce_a_secret_and_env_from() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());
        let ws = store.allocate("dep-web", false).unwrap();

        let image = ImageRef::local("dep-web", "abc");
        let env_vars = HashMap::from([
            ("DATABASE_URL".to_string(), "postgres://db/x".to_string()),
            ("FLAG".to_string(), "a \"quoted\" value".to_string()),
        ]);
        render_manifests(&ws, &inputs(&image, &env_vars, None)).unwrap();

        let secret = std::fs::read_to_string(ws.manifests_dir().join("secret.yaml")).unwrap();
        assert!(secret.contains("DATABASE_URL: \"postgres://db/x\""));
        assert!(secret.contains("FLAG: \"a \\\"quoted\\\" value\""));

        let deployment = std::fs::read_to_string(ws.manifests_dir().join("deployment.yaml")).unwrap();
        assert!(deployment.contains("envFrom"));
        assert!(deployment.contains("dep-web-env"));
    }

    #[test]
    fn ingress_is_rendered_only_when_a_host_is_given() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(dir.path());
        let ws = store.allocate("dep-web", false).unwrap();

        let image = ImageRef::local("dep-web", "abc");
        let env_vars = HashMap::new();
        render_manifests(&ws, &inputs(&image, &env_vars, Some("my-app.example.com"))).unwrap();

        let ingress = std::fs::read_to_string(ws.manifests_dir().join("ingress.yaml")).unwrap();
        assert!(ingress.contains("host: my-app.example.com"));
    }

    #[test]
    fn node_port_is_read_from_the_service_spec() {
        let json = r#"{"spec":{"ports":[{"port":3000,"nodePort":31234}]}}"#;
        assert_eq!(parse_node_port(json), Some(31234));
        assert_eq!(parse_node_port(r#"{"spec":{"ports":[{"port":80}]}}"#), None);
    }
}
