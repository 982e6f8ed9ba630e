use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::OpsError;

/// Exit code recorded when the executable is missing.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code recorded when the process could not be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 126;
/// Exit code recorded when the process was killed without reporting a status.
pub const EXIT_KILLED: i32 = -1;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Incompatible,
    Spawn,
    ExitCode,
    Timeout,
    Interrupted,
    Io,
}

/// One execution attempt of one tool. Never reused: a retry is a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    pub elapsed_ms: u64,
    pub log_path: PathBuf,
    /// Process invocations made for this attempt (more than one in per-file mode).
    pub invocations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Executable the attempt pointed at, kept for error reporting.
    #[serde(skip)]
    pub program: PathBuf,
    #[serde(skip)]
    pub timeout_secs: u64,
}

impl ToolRun {
    pub fn new(tool: &str, attempt: u32, log_path: PathBuf, program: PathBuf) -> Self {
        Self {
            tool: tool.to_owned(),
            attempt,
            pid: None,
            status: RunStatus::Pending,
            exit_code: None,
            started_at: Timestamp::now(),
            ended_at: None,
            elapsed_ms: 0,
            log_path,
            invocations: 0,
            failure: None,
            program,
            timeout_secs: 0,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Timestamp::now();
    }

    pub fn finish(&mut self, status: RunStatus, exit_code: Option<i32>, failure: Option<FailureKind>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.exit_code = exit_code;
        self.failure = failure;
        self.ended_at = Some(Timestamp::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The failure as a reportable error, if the run did not succeed.
    pub fn error(&self) -> Option<OpsError> {
        let tool = self.tool.clone();
        let failure = self.failure?;
        Some(match failure {
            FailureKind::NotFound => OpsError::ToolNotFound {
                tool,
                path: self.program.clone(),
            },
            FailureKind::Incompatible => OpsError::IncompatibleExecutable {
                tool,
                path: self.program.clone(),
            },
            FailureKind::Timeout => OpsError::ToolTimeout {
                tool,
                secs: self.timeout_secs,
            },
            FailureKind::Interrupted => OpsError::Interrupted { tool },
            FailureKind::ExitCode | FailureKind::Spawn | FailureKind::Io => {
                OpsError::ToolExecutionFailure {
                    tool,
                    code: self.exit_code.unwrap_or(EXIT_SPAWN_FAILED),
                }
            }
        })
    }
}
