#![allow(clippy::needless_pass_by_value)]

pub mod analyze;
pub mod inspect;
pub mod summary;

use anyhow::Result;

use crate::archive;
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::layout::CaseLayout;
use crate::models::ToolSpec;
use crate::orchestrator::CancelFlag;
use crate::output::Output;
use crate::rerun::PathHandlers;
use crate::summarizer::CompletionClient;

/// What a single invocation works with, resolved before any path runs.
pub struct Session<'a> {
    pub config: &'a Config,
    pub layout: &'a CaseLayout,
    pub specs: &'a [ToolSpec],
    pub cache: &'a ArtifactCache,
    pub output: &'a Output,
    pub client: &'a dyn CompletionClient,
    pub cancel: CancelFlag,
    pub retry_failed: bool,
    pub want_summary: bool,
    pub want_archive: bool,
}

impl PathHandlers for Session<'_> {
    fn run_tools(&mut self) -> Result<()> {
        let result = analyze::run(self)?;
        if self.cancel.is_cancelled() {
            return self.output.interrupted();
        }
        if self.want_summary {
            summary::run(self, Some(&result))?;
        }
        if self.want_archive {
            self.archive()?;
        }
        Ok(())
    }

    fn regenerate_summary(&mut self) -> Result<()> {
        summary::run(self, None)?;
        if self.want_archive {
            self.archive()?;
        }
        Ok(())
    }

    fn archive(&mut self) -> Result<()> {
        let report = archive::create_archive(self.layout)?;
        self.output.archive_created(&report)
    }
}
