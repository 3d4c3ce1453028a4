//! IaC driver: a thin, opinionated wrapper around the terraform CLI.
//!
//! State lives inside the workspace (`tf/…`); there is no remote backend.
//! Apply failures leave partial state behind; `destroy` is the only
//! sanctioned reclamation path. A non-empty state directory on deploy means
//! resumption: plan again and refuse to continue unless the plan is a no-op.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::core::deployment::progress::StageReporter;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};

const PLAN_FILE: &str = "tfplan";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
    pub summary: String,
}

impl PlanSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.changed == 0 && self.destroyed == 0
    }
}

/// Flat string outputs of a successful apply.
#[derive(Debug, Clone, Default)]
pub struct OutputBag(HashMap<String, String>);

impl OutputBag {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "IaC output '{}' missing from apply results",
                key
            ))
        })
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.0
    }
}

impl From<HashMap<String, String>> for OutputBag {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

fn base_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = env.clone();
    merged.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
    merged.insert("TF_INPUT".to_string(), "0".to_string());
    merged
}

fn var_args(vars: &[(String, String)]) -> Vec<String> {
    vars.iter()
        .flat_map(|(k, v)| ["-var".to_string(), format!("{}={}", k, v)])
        .collect()
}

/// `terraform init`. Idempotent; safe to re-run on resumption.
pub async fn init(
    tf_dir: &Path,
    env: &HashMap<String, String>,
    reporter: &StageReporter,
) -> Result<()> {
    let spec = CommandSpec::new("terraform")
        .args(["init", "-input=false", "-no-color"])
        .cwd(tf_dir)
        .envs(&base_env(env))
        .timeout(Duration::from_secs(5 * 60));
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("terraform", &outcome));
    }
    Ok(())
}

/// `terraform plan -out=tfplan -detailed-exitcode`: exit 0 is a no-op plan,
/// exit 2 means changes are pending, anything else is a failure.
pub async fn plan(
    tf_dir: &Path,
    env: &HashMap<String, String>,
    vars: &[(String, String)],
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<PlanSummary> {
    let spec = CommandSpec::new("terraform")
        .args(["plan", "-input=false", "-no-color", "-detailed-exitcode"])
        .arg(format!("-out={}", PLAN_FILE))
        .args(var_args(vars))
        .cwd(tf_dir)
        .envs(&base_env(env))
        .timeout(timeout);
    let outcome = process::run_streamed(&spec, reporter).await?;

    match outcome.exit_code {
        Some(0) => Ok(PlanSummary {
            added: 0,
            changed: 0,
            destroyed: 0,
            summary: "No changes.".to_string(),
        }),
        Some(2) => {
            let (added, changed, destroyed, summary) = parse_plan_counts(&outcome.tail_text())
                .unwrap_or((0, 0, 0, "changes pending".to_string()));
            Ok(PlanSummary {
                added,
                changed,
                destroyed,
                summary,
            })
        }
        _ => Err(process::exit_error("terraform", &outcome)),
    }
}

/// Apply the previously written plan file, then read structured outputs.
pub async fn apply(
    tf_dir: &Path,
    env: &HashMap<String, String>,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<OutputBag> {
    let spec = CommandSpec::new("terraform")
        .args(["apply", "-input=false", "-no-color", PLAN_FILE])
        .cwd(tf_dir)
        .envs(&base_env(env))
        .timeout(timeout);
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(process::exit_error("terraform", &outcome));
    }
    output(tf_dir, env).await
}

/// `terraform output -json`, flattened to strings.
pub async fn output(tf_dir: &Path, env: &HashMap<String, String>) -> Result<OutputBag> {
    let spec = CommandSpec::new("terraform")
        .args(["output", "-json"])
        .cwd(tf_dir)
        .envs(&base_env(env))
        .timeout(Duration::from_secs(60));
    let stdout = process::require_captured("terraform", process::run_captured(&spec).await?)?;
    parse_outputs(&stdout)
}

/// `terraform destroy -auto-approve`. Variables must be re-supplied because
/// staged roots (DNS/TLS) declare inputs.
pub async fn destroy(
    tf_dir: &Path,
    env: &HashMap<String, String>,
    vars: &[(String, String)],
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<()> {
    let spec = CommandSpec::new("terraform")
        .args(["destroy", "-auto-approve", "-input=false", "-no-color"])
        .args(var_args(vars))
        .cwd(tf_dir)
        .envs(&base_env(env))
        .timeout(timeout);
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(OrchestratorError::Decommission(format!(
            "terraform destroy failed in {}:\n{}",
            tf_dir.display(),
            outcome.tail_text()
        )));
    }
    info!("destroyed IaC resources under {}", tf_dir.display());
    Ok(())
}

/// True when this root has recorded state from a previous apply.
pub fn has_state(tf_dir: &Path) -> bool {
    tf_dir.join("terraform.tfstate").is_file()
}

pub fn parse_plan_counts(text: &str) -> Option<(u32, u32, u32, String)> {
    let re =
        regex::Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").unwrap();
    let caps = re.captures(text)?;
    let line = caps.get(0)?.as_str().to_string();
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
        line,
    ))
}

fn parse_outputs(raw: &str) -> Result<OutputBag> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        OrchestratorError::Configuration(format!("cannot parse terraform outputs: {}", e))
    })?;
    let mut bag = HashMap::new();
    if let Some(map) = value.as_object() {
        for (key, entry) in map {
            let inner = entry.get("value").unwrap_or(entry);
            let flat = match inner {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            bag.insert(key.clone(), flat);
        }
    }
    Ok(OutputBag(bag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_counts_are_parsed_from_the_summary_line() {
        let text = "aws_instance.app: Refreshing state...\nPlan: 3 to add, 1 to change, 0 to destroy.\n";
        let (added, changed, destroyed, line) = parse_plan_counts(text).unwrap();
        assert_eq!((added, changed, destroyed), (3, 1, 0));
        assert!(line.starts_with("Plan: 3"));
    }

    #[test]
    fn missing_plan_line_yields_none() {
        assert!(parse_plan_counts("No changes. Infrastructure is up-to-date.").is_none());
    }

    #[test]
    fn outputs_flatten_strings_and_composites() {
        let raw = r#"{
            "public_ip": {"sensitive": false, "type": "string", "value": "203.0.113.9"},
            "private_subnet_ids": {"sensitive": false, "type": "string", "value": "subnet-a,subnet-b"},
            "node_count": {"sensitive": false, "type": "number", "value": 2}
        }"#;
        let bag = parse_outputs(raw).unwrap();
        assert_eq!(bag.get("public_ip"), Some("203.0.113.9"));
        assert_eq!(bag.get("private_subnet_ids"), Some("subnet-a,subnet-b"));
        assert_eq!(bag.get("node_count"), Some("2"));
        assert_eq!(
            bag.require("missing_key").unwrap_err().kind(),
            "ConfigurationError"
        );
    }

    #[test]
    fn noop_plan_summary_reports_noop() {
        let summary = PlanSummary {
            added: 0,
            changed: 0,
            destroyed: 0,
            summary: "No changes.".to_string(),
        };
        assert!(summary.is_noop());
    }
}
