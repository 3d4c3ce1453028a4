//! Structured failure taxonomy for the orchestrator.
//!
//! Every failure that can cross a pipeline boundary is one of these kinds.
//! The `kind()` string is what lands in `meta.json` and in the terminal
//! progress event, so it is part of the external contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("template '{template}' is missing required variables: {missing:?}")]
    Template {
        template: String,
        missing: Vec<String>,
    },

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("cannot launch '{program}': {reason}")]
    SubprocessLaunch { program: String, reason: String },

    #[error("'{program}' failed (exit code {code:?}, timed out: {timed_out})\n{tail}")]
    SubprocessExit {
        program: String,
        code: Option<i32>,
        timed_out: bool,
        tail: String,
    },

    #[error("resumption plan is not a no-op ({summary}); refusing to continue")]
    IaCPlanMismatch { summary: String },

    #[error("rollout of '{deployment}' did not converge within {seconds}s: {last_status}")]
    RolloutTimeout {
        deployment: String,
        seconds: u64,
        last_status: String,
    },

    #[error("decommission incomplete: {0}")]
    Decommission(String),

    #[error("cloud credentials rejected: {0}")]
    Credential(String),
}

impl OrchestratorError {
    /// Stable error-kind name surfaced in `meta.json` and terminal events.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "ValidationError",
            OrchestratorError::Configuration(_) => "ConfigurationError",
            OrchestratorError::Source(_) => "SourceError",
            OrchestratorError::Template { .. } | OrchestratorError::UnknownTemplate(_) => {
                "TemplateError"
            }
            OrchestratorError::SubprocessLaunch { .. } => "SubprocessLaunchError",
            OrchestratorError::SubprocessExit { .. } => "SubprocessExitError",
            OrchestratorError::IaCPlanMismatch { .. } => "IaCPlanMismatch",
            OrchestratorError::RolloutTimeout { .. } => "RolloutTimeout",
            OrchestratorError::Decommission(_) => "DecommissionError",
            OrchestratorError::Credential(_) => "CredentialError",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
