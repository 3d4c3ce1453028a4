//! Subprocess runner for every external tool the orchestrator drives.
//!
//! Two entry points: [`run_streamed`] for long-running commands whose output
//! becomes progress events (builds, applies, rollouts), and [`run_captured`]
//! for short commands whose stdout is parsed (rev-parse, `terraform output`,
//! `kubectl get -o json`). Both refuse to start when the binary is not
//! discoverable, and both guarantee the child is gone after a timeout.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::deployment::progress::StageReporter;
use crate::core::errors::{OrchestratorError, Result};

const TAIL_LINES: usize = 40;
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(120),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub tail: Vec<String>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate a binary on PATH (or verify an absolute path). This runs before
/// every spawn so a missing tool is a [`OrchestratorError::SubprocessLaunch`]
/// rather than an opaque spawn failure mid-pipeline.
pub fn find_binary(program: &str) -> Result<PathBuf> {
    let as_path = Path::new(program);
    if as_path.is_absolute() {
        if is_executable(as_path) {
            return Ok(as_path.to_path_buf());
        }
        return Err(OrchestratorError::SubprocessLaunch {
            program: program.to_string(),
            reason: "not an executable file".to_string(),
        });
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(OrchestratorError::SubprocessLaunch {
        program: program.to_string(),
        reason: "not found on PATH".to_string(),
    })
}

fn build_command(spec: &CommandSpec, resolved: &Path) -> Command {
    let mut cmd = Command::new(resolved);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    cmd
}

fn spawn(spec: &CommandSpec) -> Result<Child> {
    let resolved = find_binary(&spec.program)?;
    debug!("spawning {} {:?}", resolved.display(), spec.args);
    build_command(spec, &resolved)
        .spawn()
        .map_err(|e| OrchestratorError::SubprocessLaunch {
            program: spec.program.clone(),
            reason: e.to_string(),
        })
}

async fn feed_stdin(child: &mut Child, payload: &Option<String>) {
    if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), payload.as_ref()) {
        let _ = stdin.write_all(payload.as_bytes()).await;
    }
}

/// SIGTERM the child, give it a grace window, then SIGKILL.
async fn terminate(child: &mut Child, program: &str) {
    warn!("'{}' exceeded its timeout, terminating", program);
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Run a command, emitting each output line (stdout and stderr interleaved by
/// arrival) as a progress event. Returns the exit code and the last lines of
/// combined output. A nonzero exit is not an error at this layer.
pub async fn run_streamed(spec: &CommandSpec, reporter: &StageReporter) -> Result<CommandOutcome> {
    let mut child = spawn(spec)?;
    feed_stdin(&mut child, &spec.stdin).await;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut timed_out = false;
    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => match maybe_line {
                Some(line) => {
                    reporter.line(&line).await;
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => break,
            },
            _ = &mut deadline => {
                timed_out = true;
                terminate(&mut child, &spec.program).await;
                break;
            }
        }
    }

    let exit_code = if timed_out {
        None
    } else {
        child
            .wait()
            .await
            .map_err(|e| OrchestratorError::SubprocessLaunch {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?
            .code()
    };

    Ok(CommandOutcome {
        exit_code,
        timed_out,
        tail: tail.into_iter().collect(),
    })
}

/// Run a command quietly, capturing full stdout and stderr.
pub async fn run_captured(spec: &CommandSpec) -> Result<CapturedOutput> {
    let mut child = spawn(spec)?;
    feed_stdin(&mut child, &spec.stdin).await;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let ran = {
        let read_and_wait = async {
            tokio::join!(
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stdout_buf).await;
                    }
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut stderr_buf).await;
                    }
                },
            );
            child.wait().await
        };
        tokio::time::timeout(spec.timeout, read_and_wait).await
    };

    match ran {
        Ok(status) => {
            let status = status.map_err(|e| OrchestratorError::SubprocessLaunch {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;
            Ok(CapturedOutput {
                exit_code: status.code(),
                timed_out: false,
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            })
        }
        Err(_) => {
            terminate(&mut child, &spec.program).await;
            Ok(CapturedOutput {
                exit_code: None,
                timed_out: true,
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            })
        }
    }
}

/// Convert a failed streamed outcome into the structured exit error.
pub fn exit_error(program: &str, outcome: &CommandOutcome) -> OrchestratorError {
    OrchestratorError::SubprocessExit {
        program: program.to_string(),
        code: outcome.exit_code,
        timed_out: outcome.timed_out,
        tail: outcome.tail_text(),
    }
}

/// Require a captured command to have succeeded, returning its stdout.
pub fn require_captured(program: &str, captured: CapturedOutput) -> Result<String> {
    if captured.success() {
        return Ok(captured.stdout);
    }
    let mut tail: Vec<String> = captured
        .stderr
        .lines()
        .chain(captured.stdout.lines())
        .map(str::to_string)
        .collect();
    if tail.len() > TAIL_LINES {
        tail = tail.split_off(tail.len() - TAIL_LINES);
    }
    Err(OrchestratorError::SubprocessExit {
        program: program.to_string(),
        code: captured.exit_code,
        timed_out: captured.timed_out,
        tail: tail.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::deployment::progress::ProgressSender;

    fn quiet_reporter() -> (StageReporter, mpsc::Receiver<crate::core::deployment::progress::ProgressEvent>)
    {
        let (tx, rx) = mpsc::channel(256);
        (StageReporter::new(ProgressSender::new(tx), "test", None), rx)
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let err = find_binary("definitely-not-a-real-binary-37f2").unwrap_err();
        assert_eq!(err.kind(), "SubprocessLaunchError");
    }

    #[tokio::test]
    async fn captured_returns_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops 1>&2; exit 3"]);
        let captured = run_captured(&spec).await.unwrap();
        assert_eq!(captured.exit_code, Some(3));
        assert_eq!(captured.stdout.trim(), "hello");
        assert_eq!(captured.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn captured_feeds_stdin() {
        let spec = CommandSpec::new("cat").stdin("piped-through");
        let captured = run_captured(&spec).await.unwrap();
        assert!(captured.success());
        assert_eq!(captured.stdout, "piped-through");
    }

    #[tokio::test]
    async fn streamed_preserves_line_order_and_tail() {
        let (reporter, mut rx) = quiet_reporter();
        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two; echo three"]);
        let outcome = run_streamed(&spec, &reporter).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.tail, vec!["one", "two", "three"]);

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev.text);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (reporter, _rx) = quiet_reporter();
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200));
        let outcome = run_streamed(&spec, &reporter).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[test]
    fn require_captured_carries_the_tail() {
        let captured = CapturedOutput {
            exit_code: Some(1),
            timed_out: false,
            stdout: "partial".to_string(),
            stderr: "fatal: repository not found".to_string(),
        };
        let err = require_captured("git", captured).unwrap_err();
        assert_eq!(err.kind(), "SubprocessExitError");
        assert!(err.to_string().contains("repository not found"));
    }
}
