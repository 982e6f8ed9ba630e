use std::collections::BTreeMap;

use serde::Serialize;

use super::{RunStatus, ToolRun};

/// Aggregate of every attempt made during one orchestrator invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub run_id: String,
    /// Attempts per tool, oldest first.
    history: BTreeMap<String, Vec<ToolRun>>,
}

impl RunResult {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            history: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, run: ToolRun) {
        self.history.entry(run.tool.clone()).or_default().push(run);
    }

    pub fn tool_count(&self) -> usize {
        self.history.len()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.history.keys().map(String::as_str)
    }

    pub fn attempts(&self, tool: &str) -> &[ToolRun] {
        self.history.get(tool).map_or(&[], Vec::as_slice)
    }

    pub fn final_run(&self, tool: &str) -> Option<&ToolRun> {
        self.attempts(tool).last()
    }

    pub fn final_runs(&self) -> impl Iterator<Item = &ToolRun> {
        self.history.values().filter_map(|runs| runs.last())
    }

    /// True iff every tool's latest attempt succeeded.
    pub fn overall_success(&self) -> bool {
        self.final_runs().all(ToolRun::succeeded)
    }

    /// Tools whose latest attempt failed or timed out.
    pub fn retry_candidates(&self) -> Vec<&ToolRun> {
        self.final_runs()
            .filter(|run| run.status.is_retryable())
            .collect()
    }

    pub fn status_of(&self, tool: &str) -> Option<RunStatus> {
        self.final_run(tool).map(|run| run.status)
    }
}
