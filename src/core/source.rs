//! Source repository fetcher.
//!
//! Clones the requested repository into the workspace and summarizes what it
//! found: container recipe, readme, best-effort build/run hints and listening
//! ports. Hint extraction is a single heuristic pass; failing to extract
//! anything is never fatal.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::core::deployment::progress::StageReporter;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::process::{self, CommandSpec};
use crate::core::workspace::Workspace;

pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub repo_url: String,
    pub commit: String,
    pub has_dockerfile: bool,
    pub has_readme: bool,
    pub build_hint: Option<String>,
    pub run_hint: Option<String>,
    pub ports: Vec<u16>,
}

impl SourceSnapshot {
    /// Port the rendered manifests expose: the first `EXPOSE`d port (README
    /// numbers only fill in when the Dockerfile exposes nothing), or the
    /// default when nothing was detected at all.
    pub fn container_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or(DEFAULT_CONTAINER_PORT)
    }
}

/// The Dockerfile's `EXPOSE` set is authoritative for what the container
/// actually serves; README-scraped numbers are a fallback only.
fn resolve_ports(expose_ports: Vec<u16>, readme_ports: Vec<u16>) -> Vec<u16> {
    if expose_ports.is_empty() {
        readme_ports
    } else {
        expose_ports
    }
}

/// Clone `repo_url` into `workspace/source/` and build a snapshot.
pub async fn fetch(
    repo_url: &str,
    workspace: &Workspace,
    reporter: &StageReporter,
    timeout: Duration,
) -> Result<SourceSnapshot> {
    if !repo_url.starts_with("https://") {
        return Err(OrchestratorError::Source(format!(
            "unsupported repository URL '{}': only https cloning is supported",
            repo_url
        )));
    }

    let dest = workspace.source_dir();
    if dest.exists() {
        // Redeploys re-clone so the snapshot reflects the current head.
        std::fs::remove_dir_all(&dest)
            .map_err(|e| OrchestratorError::Source(format!("cannot clear source dir: {}", e)))?;
    }

    let spec = CommandSpec::new("git")
        .args(["clone", "--depth", "1", repo_url])
        .arg(dest.to_string_lossy().to_string())
        .timeout(timeout);
    let outcome = process::run_streamed(&spec, reporter).await?;
    if !outcome.success() {
        return Err(OrchestratorError::Source(format!(
            "clone of '{}' failed:\n{}",
            repo_url,
            outcome.tail_text()
        )));
    }

    let rev_parse = CommandSpec::new("git")
        .arg("-C")
        .arg(dest.to_string_lossy().into_owned())
        .args(["rev-parse", "HEAD"]);
    let commit = process::require_captured("git", process::run_captured(&rev_parse).await?)?
        .trim()
        .to_string();

    let has_dockerfile = dockerfile_path(&dest).is_some();
    let readme = read_readme(&dest);
    let has_readme = readme.is_some();

    let (build_hint, run_hint, readme_ports) = readme
        .as_deref()
        .map(extract_hints)
        .unwrap_or((None, None, Vec::new()));

    let expose_ports = dockerfile_path(&dest)
        .and_then(|dockerfile| std::fs::read_to_string(dockerfile).ok())
        .map(|body| extract_expose_ports(&body))
        .unwrap_or_default();
    let ports = resolve_ports(expose_ports, readme_ports);

    if !has_dockerfile {
        reporter
            .warn("no Dockerfile found at the repository root")
            .await;
    }
    info!(
        "source snapshot for {}: commit {}, dockerfile={}, ports={:?}",
        repo_url, commit, has_dockerfile, ports
    );

    Ok(SourceSnapshot {
        repo_url: repo_url.to_string(),
        commit,
        has_dockerfile,
        has_readme,
        build_hint,
        run_hint,
        ports,
    })
}

fn dockerfile_path(source_dir: &Path) -> Option<std::path::PathBuf> {
    ["Dockerfile", "Containerfile"]
        .iter()
        .map(|name| source_dir.join(name))
        .find(|p| p.is_file())
}

fn read_readme(source_dir: &Path) -> Option<String> {
    ["README.md", "README", "Readme.md", "readme.md"]
        .iter()
        .map(|name| source_dir.join(name))
        .find(|p| p.is_file())
        .and_then(|p| std::fs::read_to_string(p).ok())
}

fn looks_like_command(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "make", "npm", "yarn", "pnpm", "docker", "python", "pip", "cargo", "go ", "mvn",
        "gradle", "./", "sh ",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}

/// One pass over the readme: fenced code lines are attributed to the nearest
/// preceding header, the first command under a build-ish header becomes the
/// build hint, the first under a run-ish header the run hint. Ports are
/// picked up anywhere in the text.
pub fn extract_hints(readme: &str) -> (Option<String>, Option<String>, Vec<u16>) {
    const BUILD_WORDS: &[&str] = &["build", "building", "compile", "compilation"];
    const RUN_WORDS: &[&str] = &["run", "running", "start", "launch", "usage", "execute"];

    let port_re = regex::Regex::new(r"(?i)\bport\s*[:=]?\s*(\d{2,5})\b").unwrap();

    let mut build_hint: Option<String> = None;
    let mut run_hint: Option<String> = None;
    let mut ports: Vec<u16> = Vec::new();

    let mut section = String::new();
    let mut in_fence = false;

    for line in readme.lines() {
        for cap in port_re.captures_iter(line) {
            if let Ok(port) = cap[1].parse::<u16>() {
                if port >= 80 && !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }

        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence && trimmed.starts_with('#') {
            section = trimmed.trim_start_matches('#').trim().to_lowercase();
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let is_candidate = in_fence || looks_like_command(trimmed);
        if !is_candidate {
            continue;
        }

        if build_hint.is_none() && BUILD_WORDS.iter().any(|w| section.contains(w)) {
            build_hint = Some(trimmed.to_string());
        } else if run_hint.is_none() && RUN_WORDS.iter().any(|w| section.contains(w)) {
            run_hint = Some(trimmed.to_string());
        }
    }

    (build_hint, run_hint, ports)
}

pub fn extract_expose_ports(dockerfile: &str) -> Vec<u16> {
    let re = regex::Regex::new(r"(?im)^\s*EXPOSE\s+(.+)$").unwrap();
    let mut ports = Vec::new();
    for cap in re.captures_iter(dockerfile) {
        for token in cap[1].split_whitespace() {
            let number = token.split('/').next().unwrap_or(token);
            if let Ok(port) = number.parse::<u16>() {
                if !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_README: &str = "\
# My Service

## Building

```bash
docker build -t myservice .
```

## Running

```sh
docker run -p 3000:3000 myservice
```

The server listens on port 3000.
";

    #[test]
    fn hints_come_from_their_sections() {
        let (build, run, ports) = extract_hints(SAMPLE_README);
        assert_eq!(build.as_deref(), Some("docker build -t myservice ."));
        assert_eq!(run.as_deref(), Some("docker run -p 3000:3000 myservice"));
        assert_eq!(ports, vec![3000]);
    }

    #[test]
    fn missing_sections_yield_no_hints() {
        let (build, run, ports) = extract_hints("# Hello\n\nJust a readme.\n");
        assert!(build.is_none());
        assert!(run.is_none());
        assert!(ports.is_empty());
    }

    #[test]
    fn bare_command_lines_count_outside_fences() {
        let readme = "## Build\nmake all\n## Start\n./server --listen\n";
        let (build, run, _) = extract_hints(readme);
        assert_eq!(build.as_deref(), Some("make all"));
        assert_eq!(run.as_deref(), Some("./server --listen"));
    }

    #[test]
    fn expose_ports_are_parsed_with_protocols() {
        let dockerfile = "FROM alpine\nEXPOSE 8080\nexpose 9090/tcp 9091\n";
        assert_eq!(extract_expose_ports(dockerfile), vec![8080, 9090, 9091]);
    }

    #[test]
    fn exposed_ports_override_readme_numbers() {
        // README says 3000, the image serves 8080: EXPOSE wins.
        let ports = resolve_ports(vec![8080], vec![3000]);
        assert_eq!(ports, vec![8080]);

        let snapshot = SourceSnapshot {
            repo_url: "https://github.com/x/y.git".to_string(),
            commit: "abc".to_string(),
            has_dockerfile: true,
            has_readme: true,
            build_hint: None,
            run_hint: None,
            ports,
        };
        assert_eq!(snapshot.container_port(), 8080);
    }

    #[test]
    fn readme_ports_apply_only_without_expose() {
        assert_eq!(resolve_ports(Vec::new(), vec![3000]), vec![3000]);
        assert_eq!(resolve_ports(Vec::new(), Vec::new()), Vec::<u16>::new());
    }

    #[test]
    fn first_exposed_port_is_the_container_port() {
        let snapshot = SourceSnapshot {
            repo_url: "https://github.com/x/y.git".to_string(),
            commit: "abc".to_string(),
            has_dockerfile: true,
            has_readme: false,
            build_hint: None,
            run_hint: None,
            ports: resolve_ports(vec![9090, 80], Vec::new()),
        };
        assert_eq!(snapshot.container_port(), 9090);
    }

    #[test]
    fn snapshot_falls_back_to_the_default_port() {
        let snapshot = SourceSnapshot {
            repo_url: "https://github.com/x/y.git".to_string(),
            commit: "abc".to_string(),
            has_dockerfile: true,
            has_readme: false,
            build_hint: None,
            run_hint: None,
            ports: Vec::new(),
        };
        assert_eq!(snapshot.container_port(), DEFAULT_CONTAINER_PORT);
    }
}
