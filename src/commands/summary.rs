use anyhow::Result;
use tracing::warn;

use crate::models::RunResult;
use crate::summarizer::{Summarizer, ToolDigest};

use super::Session;

/// Summarize whatever artifacts exist. A failed request is reported, never fatal.
pub fn run(session: &Session<'_>, result: Option<&RunResult>) -> Result<()> {
    let llm = &session.config.llm;
    if !llm.enabled {
        warn!(
            "LLM integration is disabled in configuration, but a summary was requested. Proceeding with {}",
            llm.endpoint
        );
    }

    let digests = ToolDigest::collect(session.layout, session.specs, result);
    let destination = session.layout.summary_path();
    let summarizer = Summarizer::new(llm, session.client);

    match summarizer.summarize(session.layout.case(), &digests, session.cache, &destination) {
        Ok(summary) => session.output.summary(&summary, &destination),
        Err(err) => {
            warn!("LLM summary failed: {err:#}");
            session.output.summary_failed(&err)
        }
    }
}
