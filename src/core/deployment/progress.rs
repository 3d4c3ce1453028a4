//! Progress events: the unit of observable pipeline progress.
//!
//! Every long-running component reports through a [`StageReporter`], which
//! tees each line into the per-stage log file and forwards it, redacted, to
//! the pipeline's event channel. Events from one pipeline are delivered in
//! strict emission order; the chat front-end turns them into stream deltas.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Start,
    Log,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub phase: EventPhase,
    pub severity: EventSeverity,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

const REDACTED: &str = "***";

/// Cloneable sending half of a pipeline's event channel. Secrets registered
/// here are scrubbed from every event before it leaves the pipeline.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
    secrets: Arc<Mutex<Vec<String>>>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            secrets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a secret value to scrub from all subsequent events.
    pub fn register_secret(&self, value: &str) {
        if value.is_empty() {
            return;
        }
        let mut secrets = self.secrets.lock().unwrap_or_else(|p| p.into_inner());
        secrets.push(value.to_string());
    }

    pub fn redact(&self, text: &str) -> String {
        let secrets = self.secrets.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = text.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Send an event. A closed channel means the consumer went away; the
    /// pipeline keeps running regardless, so send failures are ignored.
    pub async fn emit(&self, mut event: ProgressEvent) {
        event.text = self.redact(&event.text);
        let _ = self.tx.send(event).await;
    }
}

/// Per-stage reporting handle: emits start/log/end events and appends every
/// line to `logs/<stage>.log` inside the workspace.
pub struct StageReporter {
    sender: ProgressSender,
    stage: String,
    log_file: Option<Arc<Mutex<std::fs::File>>>,
}

impl StageReporter {
    pub fn new(sender: ProgressSender, stage: &str, logs_dir: Option<&Path>) -> Self {
        let log_file = logs_dir.and_then(|dir| {
            std::fs::create_dir_all(dir).ok()?;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{}.log", stage)))
                .ok()
                .map(|f| Arc::new(Mutex::new(f)))
        });
        Self {
            sender,
            stage: stage.to_string(),
            log_file,
        }
    }

    fn tee(&self, text: &str) {
        if let Some(file) = &self.log_file {
            let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
            let _ = writeln!(file, "{}", text);
        }
    }

    async fn emit(&self, phase: EventPhase, severity: EventSeverity, text: &str) {
        let text = self.sender.redact(text);
        self.tee(&text);
        debug!(stage = %self.stage, "{}", text);
        self.sender
            .emit(ProgressEvent {
                stage: self.stage.clone(),
                phase,
                severity,
                text,
                data: None,
            })
            .await;
    }

    pub async fn start(&self, text: &str) {
        self.emit(EventPhase::Start, EventSeverity::Info, text).await;
    }

    pub async fn line(&self, text: &str) {
        self.emit(EventPhase::Log, EventSeverity::Info, text).await;
    }

    pub async fn warn(&self, text: &str) {
        self.emit(EventPhase::Log, EventSeverity::Warn, text).await;
    }

    pub async fn end(&self, text: &str) {
        self.emit(EventPhase::End, EventSeverity::Info, text).await;
    }

    /// Terminal event carrying a structured payload alongside the text.
    pub async fn end_with_data(
        &self,
        severity: EventSeverity,
        text: &str,
        data: serde_json::Value,
    ) {
        let text = self.sender.redact(text);
        self.tee(&text);
        self.sender
            .emit(ProgressEvent {
                stage: self.stage.clone(),
                phase: EventPhase::End,
                severity,
                text,
                data: Some(data),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn secrets_are_scrubbed_from_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = ProgressSender::new(tx);
        sender.register_secret("AKIAEXAMPLEKEY");
        sender.register_secret("wJalrXUtnFEMI/K7MDENG");

        sender
            .emit(ProgressEvent {
                stage: "iac-apply".to_string(),
                phase: EventPhase::Log,
                severity: EventSeverity::Info,
                text: "env AWS_ACCESS_KEY_ID=AKIAEXAMPLEKEY secret=wJalrXUtnFEMI/K7MDENG".to_string(),
                data: None,
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert!(!event.text.contains("AKIAEXAMPLEKEY"));
        assert!(!event.text.contains("wJalrXUtnFEMI/K7MDENG"));
        assert!(event.text.contains("***"));
    }

    #[tokio::test]
    async fn reporter_tees_lines_to_stage_log() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = StageReporter::new(ProgressSender::new(tx), "build", Some(dir.path()));

        reporter.start("building image").await;
        reporter.line("step 1/3").await;
        reporter.end("built").await;

        let logged = std::fs::read_to_string(dir.path().join("build.log")).unwrap();
        assert!(logged.contains("step 1/3"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, EventPhase::Start);
        assert_eq!(first.stage, "build");
    }
}
