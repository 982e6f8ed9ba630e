use std::path::PathBuf;

use thiserror::Error;

/// Failures the orchestration engine distinguishes.
///
/// Tool-level variants are never propagated past the [`crate::runner`]; they
/// are recorded on the affected `ToolRun` and reported once the run ends.
/// Only configuration problems abort a run, and those travel as `anyhow`
/// errors from `lib.rs`. [`OpsError::RunInterrupted`] is the exception: it
/// ends a run the user stopped, after the report has been printed.
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("{tool}: executable not found or not executable: {}", path.display())]
    ToolNotFound { tool: String, path: PathBuf },

    #[error("{tool}: {} is not built for this host architecture", path.display())]
    IncompatibleExecutable { tool: String, path: PathBuf },

    #[error("{tool}: exited with code {code}")]
    ToolExecutionFailure { tool: String, code: i32 },

    #[error("{tool}: timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("{tool}: interrupted before completion")]
    Interrupted { tool: String },

    #[error("failed to read artifact {}: {reason}", path.display())]
    CacheReadFailure { path: PathBuf, reason: String },

    #[error("LLM request failed: {0}")]
    LlmRequestFailure(String),

    #[error("interrupted; running tools were stopped and the partial report printed")]
    RunInterrupted,
}

impl OpsError {
    pub fn llm(reason: impl std::fmt::Display) -> Self {
        Self::LlmRequestFailure(reason.to_string())
    }
}
