use anyhow::Result;
use tracing::warn;

use crate::models::RunResult;
use crate::orchestrator::{Orchestrator, RunOptions, StatusEvent};

use super::Session;

/// Run every enabled tool, then print the per-tool report.
pub fn run(session: &Session<'_>) -> Result<RunResult> {
    session.output.run_started(session.layout, session.specs)?;

    let options = RunOptions {
        retry_failed: session.retry_failed,
        poll_interval: session.config.runtime.poll_interval(),
        cancel: session.cancel.clone(),
    };
    let mut sink = |event: &StatusEvent| {
        if let Err(err) = session.output.status_event(event) {
            warn!("failed to print status: {err}");
        }
    };
    let result = Orchestrator::new(session.layout, options).run(session.specs, &mut sink)?;

    session
        .output
        .run_report(session.layout, session.specs, &result, session.cache)?;
    Ok(result)
}
