//! What to do when a case already has output on disk.
//!
//! Evaluated once, before any tool starts. An empty output set always means a
//! fresh run; otherwise a [`Prompter`] picks one of four choices.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use strum::{AsRefStr, Display};

use crate::layout::OutputSet;

/// Listed paths in the console menu before collapsing the rest into a count.
const MENU_PATH_LIMIT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RerunChoice {
    /// Run every tool again; existing artifacts are superseded.
    #[value(name = "rerun")]
    RerunAll,
    /// Rebuild only the LLM summary from existing artifacts.
    #[value(name = "summary")]
    RegenerateSummaryOnly,
    /// Bundle the existing output directory and stop.
    #[value(name = "archive")]
    ArchiveOnly,
    /// Leave everything as is.
    #[value(name = "abort")]
    Abort,
}

impl RerunChoice {
    pub const ALL: [Self; 4] = [
        Self::RerunAll,
        Self::RegenerateSummaryOnly,
        Self::ArchiveOnly,
        Self::Abort,
    ];

    /// Menu answer to choice. Empty input means rerun.
    pub fn parse_answer(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "" | "r" | "rerun" => Some(Self::RerunAll),
            "l" | "llm" | "summary" => Some(Self::RegenerateSummaryOnly),
            "a" | "archive" => Some(Self::ArchiveOnly),
            "s" | "skip" | "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionPath {
    FreshRun,
    SummaryOnly,
    ArchiveOnly,
    Abort,
}

impl From<RerunChoice> for ExecutionPath {
    fn from(choice: RerunChoice) -> Self {
        match choice {
            RerunChoice::RerunAll => Self::FreshRun,
            RerunChoice::RegenerateSummaryOnly => Self::SummaryOnly,
            RerunChoice::ArchiveOnly => Self::ArchiveOnly,
            RerunChoice::Abort => Self::Abort,
        }
    }
}

/// Asks which path to take when output already exists.
pub trait Prompter {
    fn choose(&mut self, existing: &OutputSet) -> Result<RerunChoice>;
}

/// Always answers the same way, for `--on-existing` and unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompter(pub RerunChoice);

impl Prompter for FixedPrompter {
    fn choose(&mut self, _existing: &OutputSet) -> Result<RerunChoice> {
        Ok(self.0)
    }
}

/// Interactive menu. Re-asks on unrecognized input; end of input aborts.
pub struct ConsolePrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsolePrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn show_existing(&mut self, existing: &OutputSet) -> Result<()> {
        writeln!(
            self.output,
            "Existing output found for case '{}':",
            existing.case
        )?;
        for path in existing.paths.iter().take(MENU_PATH_LIMIT) {
            writeln!(self.output, "  {}", path.display())?;
        }
        if existing.paths.len() > MENU_PATH_LIMIT {
            writeln!(
                self.output,
                "  ... and {} more",
                existing.paths.len() - MENU_PATH_LIMIT
            )?;
        }
        Ok(())
    }
}

impl<R: BufRead, W: Write> Prompter for ConsolePrompter<R, W> {
    fn choose(&mut self, existing: &OutputSet) -> Result<RerunChoice> {
        self.show_existing(existing)?;
        loop {
            write!(
                self.output,
                "[R]erun all tools, [L]LM summary only, [A]rchive only, [S]kip (default R): "
            )?;
            self.output.flush()?;

            let mut line = String::new();
            let read = self
                .input
                .read_line(&mut line)
                .context("Failed to read menu answer")?;
            if read == 0 {
                writeln!(self.output)?;
                return Ok(RerunChoice::Abort);
            }
            match RerunChoice::parse_answer(&line) {
                Some(choice) => return Ok(choice),
                None => writeln!(self.output, "Unrecognized choice: {}", line.trim())?,
            }
        }
    }
}

pub struct RerunDecision;

impl RerunDecision {
    pub fn evaluate(existing: &OutputSet, prompter: &mut dyn Prompter) -> Result<ExecutionPath> {
        if existing.is_empty() {
            return Ok(ExecutionPath::FreshRun);
        }
        prompter.choose(existing).map(ExecutionPath::from)
    }
}

/// One callback per execution path.
pub trait PathHandlers {
    fn run_tools(&mut self) -> Result<()>;
    fn regenerate_summary(&mut self) -> Result<()>;
    fn archive(&mut self) -> Result<()>;
}

/// Invoke exactly the handler for `path`. Abort invokes none.
pub fn dispatch(path: ExecutionPath, handlers: &mut dyn PathHandlers) -> Result<()> {
    match path {
        ExecutionPath::FreshRun => handlers.run_tools(),
        ExecutionPath::SummaryOnly => handlers.regenerate_summary(),
        ExecutionPath::ArchiveOnly => handlers.archive(),
        ExecutionPath::Abort => Ok(()),
    }
}
