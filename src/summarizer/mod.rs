//! Optional LLM summary over the artifacts of one case.

mod client;
mod confidence;
mod prompt;

pub use client::{ChatResponse, CompletionClient, CompletionRequest, HttpCompletionClient};
pub use confidence::classify;
pub use prompt::{Assembled, Priority, PromptBuilder, Section, digest_sections};

use std::path::{Path, PathBuf};

use anyhow::Result;
use jiff::Timestamp;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cache::ArtifactCache;
use crate::config::LlmConfig;
use crate::layout::CaseLayout;
use crate::models::{RunResult, RunStatus, Summary, ToolSpec};

/// What the prompt says about one tool.
#[derive(Debug, Clone)]
pub struct ToolDigest {
    pub tool: String,
    /// None when summarizing output from an earlier invocation.
    pub status: Option<RunStatus>,
    pub log_path: Option<PathBuf>,
    pub artifacts: Vec<PathBuf>,
}

impl ToolDigest {
    pub fn collect(layout: &CaseLayout, specs: &[ToolSpec], result: Option<&RunResult>) -> Vec<Self> {
        specs
            .iter()
            .map(|spec| {
                let last = result.and_then(|r| r.final_run(&spec.name));
                let log_path = match last {
                    Some(run) => Some(run.log_path.clone()),
                    None => Some(layout.log_path(&spec.name, 1)).filter(|p| p.exists()),
                };
                Self {
                    tool: spec.name.clone(),
                    status: last.map(|run| run.status),
                    log_path,
                    artifacts: spec.artifact_paths(layout),
                }
            })
            .collect()
    }
}

pub struct Summarizer<'a> {
    config: &'a LlmConfig,
    client: &'a dyn CompletionClient,
}

impl<'a> Summarizer<'a> {
    pub fn new(config: &'a LlmConfig, client: &'a dyn CompletionClient) -> Self {
        Self { config, client }
    }

    /// The user prompt for `case`, within the configured character budget.
    pub fn build_prompt(&self, case: &str, digests: &[ToolDigest], cache: &ArtifactCache) -> String {
        let template = self.config.prompt_template.replace("{case}", case);
        let (template, has_slot) = if template.contains("{context}") {
            (template, true)
        } else {
            (format!("{template}\n{{context}}"), false)
        };
        let overhead = template.chars().count().saturating_sub("{context}".len());
        let budget = self.config.prompt_budget_chars.saturating_sub(overhead);

        let assembled = digest_sections(digests, cache).assemble(budget);
        if assembled.dropped > 0 || assembled.truncated {
            warn!(
                dropped = assembled.dropped,
                truncated = assembled.truncated,
                budget,
                "prompt over budget, trimmed artifact context"
            );
        }
        if !has_slot {
            warn!("prompt template has no {{context}} placeholder, appending artifact context");
        }
        template.replace("{context}", &assembled.text)
    }

    /// One request, no retries. The summary is written next to `destination`'s
    /// metadata sidecar only when the request succeeds.
    pub fn summarize(
        &self,
        case: &str,
        digests: &[ToolDigest],
        cache: &ArtifactCache,
        destination: &Path,
    ) -> Result<Summary> {
        let prompt = self.build_prompt(case, digests, cache);
        let prompt_hash = hex::encode(Sha256::digest(prompt.as_bytes()));
        let request = CompletionRequest::from_config(self.config, prompt);

        info!(model = %request.model, chars = request.user_prompt.chars().count(), "requesting summary");
        let text = self.client.complete(&request)?;

        let summary = Summary {
            confidence: classify(&text),
            text,
            generated_at: Timestamp::now(),
            prompt_hash,
            model: request.model,
        };
        summary.write_files(destination)?;
        Ok(summary)
    }
}
