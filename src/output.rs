use std::cell::RefCell;
use std::fs;
use std::path::Path;

use anyhow::Result;
use console::{Term, style};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::archive::ArchiveReport;
use crate::cache::ArtifactCache;
use crate::commands::inspect::{CaseListing, CaseOverview, LogTail};
use crate::helpers::human_size;
use crate::layout::{CaseLayout, OutputSet};
use crate::models::{
    ArtifactEntry, Confidence, FailureKind, Preview, RunResult, RunStatus, Summary, ToolRun, ToolSpec,
};
use crate::orchestrator::StatusEvent;
use crate::rerun::ExecutionPath;
use crate::update::UpdateReport;

const DEFAULT_WIDTH: usize = 100;

/// Console reporting. With `--json` nothing is printed as it happens; each
/// section is collected into one document that `finish` writes to stdout.
pub struct Output {
    term: Term,
    json: bool,
    document: RefCell<Map<String, Value>>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    overall_success: bool,
    #[serde(flatten)]
    result: &'a RunResult,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self {
            term: Term::stdout(),
            json,
            document: RefCell::new(Map::new()),
        }
    }

    fn record<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.document.borrow_mut().insert(key.to_owned(), value);
        Ok(())
    }

    /// The collected JSON document, if anything was recorded.
    pub fn document(&self) -> Option<Value> {
        let document = self.document.borrow();
        (!document.is_empty()).then(|| Value::Object(document.clone()))
    }

    /// Write the JSON document, once. A no-op on the console.
    pub fn finish(&self) -> Result<()> {
        if !self.json {
            return Ok(());
        }
        let Some(document) = self.document() else {
            return Ok(());
        };
        self.term.write_line(&serde_json::to_string_pretty(&document)?)?;
        self.document.borrow_mut().clear();
        Ok(())
    }

    fn width(&self) -> usize {
        self.term
            .size_checked()
            .map_or(DEFAULT_WIDTH, |(_, cols)| usize::from(cols).max(40))
    }

    pub fn notice(&self, message: &str) -> Result<()> {
        if self.json {
            return Ok(());
        }
        self.term.write_line(message)?;
        Ok(())
    }

    pub fn run_started(&self, layout: &CaseLayout, specs: &[ToolSpec]) -> Result<()> {
        if self.json {
            return Ok(());
        }
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        self.term.write_line(&format!(
            "{} {} ({})",
            style("Analyzing case").green(),
            style(layout.case()).cyan().bold(),
            names.join(", ")
        ))?;
        self.term
            .write_line(&format!("  Output: {}", layout.output_dir().display()))?;
        Ok(())
    }

    /// Record which path the run took.
    pub fn path_chosen(&self, case: &str, path: ExecutionPath) -> Result<()> {
        if self.json {
            self.record("case", case)?;
            self.record("path", &path)?;
        }
        Ok(())
    }

    /// One line per attempt as it finishes.
    pub fn status_event(&self, event: &StatusEvent) -> Result<()> {
        if self.json {
            return Ok(());
        }
        let label = event_label(event);
        let status = match event.status {
            RunStatus::Succeeded => style(label).green(),
            RunStatus::TimedOut => style(label).yellow(),
            _ => style(label).red(),
        };
        self.term.write_line(&format!(
            "  {} attempt {}: {} after {:.1}s",
            style(&event.tool).cyan(),
            event.attempt,
            status,
            event.elapsed.as_secs_f64()
        ))?;
        Ok(())
    }

    pub fn update_finished(&self, report: &UpdateReport) -> Result<()> {
        if self.json {
            return self.record("update", report);
        }
        self.notice(&format!(
            "Tool update: {} succeeded, {} skipped, {} failed",
            report.succeeded, report.skipped, report.failed
        ))
    }

    /// Final per-tool report: status, artifacts found and log size.
    pub fn run_report(
        &self,
        layout: &CaseLayout,
        specs: &[ToolSpec],
        result: &RunResult,
        cache: &ArtifactCache,
    ) -> Result<()> {
        if self.json {
            self.record("case", layout.case())?;
            return self.record(
                "run",
                &RunReport {
                    overall_success: result.overall_success(),
                    result,
                },
            );
        }

        self.term.write_line("")?;
        self.term.write_line(&style("Results:").bold().to_string())?;
        for spec in specs {
            let Some(run) = result.final_run(&spec.name) else {
                continue;
            };
            let entries = cache.get_all(&spec.artifact_paths(layout));
            let present: Vec<_> = entries.iter().filter(|e| e.exists()).collect();
            let report = if present.is_empty() {
                style("missing".to_owned()).dim()
            } else {
                let total: u64 = present.iter().map(|e| e.total_size()).sum();
                style(format!(
                    "{} artifact{} ({})",
                    present.len(),
                    if present.len() == 1 { "" } else { "s" },
                    human_size(total)
                ))
            };
            let log = fs::metadata(&run.log_path)
                .map_or_else(|_| "missing".to_owned(), |meta| human_size(meta.len()));

            self.term.write_line(&format!(
                "- {}: {}; report {}; log {}",
                style(&run.tool).cyan().bold(),
                status_label(run),
                report,
                log
            ))?;
        }

        self.term.write_line("")?;
        if result.overall_success() {
            self.term.write_line(
                &style("All tools completed successfully.")
                    .green()
                    .to_string(),
            )?;
            return Ok(());
        }

        self.term
            .write_line(&style("Some tools did not complete:").red().to_string())?;
        for run in result.final_runs().filter(|run| !run.succeeded()) {
            let reason = run
                .error()
                .map_or_else(|| run.status.to_string(), |err| err.to_string());
            self.term.write_line(&format!(
                "  - {reason} (see {})",
                style(run.log_path.display()).dim()
            ))?;
        }
        Ok(())
    }

    pub fn summary(&self, summary: &Summary, path: &Path) -> Result<()> {
        if self.json {
            return self.record("summary", summary);
        }

        self.term.write_line("")?;
        self.term.write_line(&format!(
            "{} (confidence: {})",
            style("LLM summary").bold(),
            confidence_label(summary.confidence)
        ))?;
        for line in render_summary(&summary.text, self.width()) {
            self.term.write_line(&line)?;
        }
        self.term
            .write_line(&format!("Summary saved to {}", path.display()))?;
        Ok(())
    }

    pub fn summary_failed(&self, err: &anyhow::Error) -> Result<()> {
        if self.json {
            return self.record("summary_error", &format!("{err:#}"));
        }
        self.term.write_line(&format!(
            "{} {err:#}",
            style("LLM summary failed:").yellow()
        ))?;
        Ok(())
    }

    pub fn archive_created(&self, report: &ArchiveReport) -> Result<()> {
        if self.json {
            return self.record("archive", report);
        }
        self.term.write_line(&format!(
            "{} {} ({} files, {})",
            style("Archive created:").green(),
            style(report.path.display()).cyan(),
            report.files,
            human_size(report.bytes)
        ))?;
        Ok(())
    }

    pub fn aborted(&self, existing: &OutputSet) -> Result<()> {
        if self.json {
            self.record("case", &existing.case)?;
            return self.record("aborted", &true);
        }
        self.term.write_line(&format!(
            "Leaving existing output for {} untouched.",
            style(&existing.case).cyan()
        ))?;
        Ok(())
    }

    pub fn interrupted(&self) -> Result<()> {
        if self.json {
            return self.record("interrupted", &true);
        }
        self.term.write_line(&format!(
            "{} running tools were stopped; summary and archive skipped.",
            style("Run interrupted:").yellow().bold()
        ))?;
        Ok(())
    }

    pub fn cases(&self, base: &Path, cases: &[CaseListing]) -> Result<()> {
        if self.json {
            return self.record("cases", cases);
        }
        if cases.is_empty() {
            self.term
                .write_line(&format!("No processed cases under {}", base.display()))?;
            return Ok(());
        }
        for case in cases {
            let tools = if case.tools.is_empty() {
                style("no tool output".to_owned()).dim()
            } else {
                style(case.tools.join(", "))
            };
            self.term.write_line(&format!(
                "{}  {}; {} log{}{}",
                style(&case.case).cyan().bold(),
                tools,
                case.logs,
                if case.logs == 1 { "" } else { "s" },
                if case.has_summary { "; summary" } else { "" }
            ))?;
        }
        Ok(())
    }

    pub fn overview(&self, overview: &CaseOverview) -> Result<()> {
        if self.json {
            return self.record("overview", overview);
        }
        self.term.write_line(&format!(
            "{} {}",
            style("Case").green(),
            style(&overview.case).cyan().bold()
        ))?;
        self.term
            .write_line(&format!("  Output: {}", overview.output_dir.display()))?;

        for tool in &overview.tools {
            self.term.write_line("")?;
            self.term.write_line(&style(&tool.tool).cyan().bold().to_string())?;
            for artifact in &tool.artifacts {
                self.term.write_line(&format!("  {}", artifact_line(artifact)))?;
            }
            match tool.logs.last() {
                Some(log) => self.term.write_line(&format!(
                    "  log: {} attempt{}, latest {} ({})",
                    tool.logs.len(),
                    if tool.logs.len() == 1 { "" } else { "s" },
                    log.path.display(),
                    human_size(log.size)
                ))?,
                None => self.term.write_line(&format!("  log: {}", style("none").dim()))?,
            }
        }

        self.term.write_line("")?;
        match &overview.summary {
            Some(summary) => {
                let confidence = summary
                    .meta
                    .as_ref()
                    .map_or(Confidence::Unknown, |meta| meta.confidence);
                self.term.write_line(&format!(
                    "{} (confidence: {})",
                    style("LLM summary").bold(),
                    confidence_label(confidence)
                ))?;
                for line in render_summary(&summary.text, self.width()) {
                    self.term.write_line(&line)?;
                }
            }
            None => self
                .term
                .write_line(&format!("{} none", style("LLM summary:").bold()))?,
        }
        Ok(())
    }

    pub fn log_tail(&self, log: &LogTail) -> Result<()> {
        if self.json {
            return self.record("log", log);
        }
        let shown = log.lines.len();
        self.term.write_line(&format!(
            "{} attempt {} ({}, last {shown} of {} lines)",
            style(&log.tool).cyan().bold(),
            log.attempt,
            log.path.display(),
            log.total_lines
        ))?;
        for line in &log.lines {
            self.term.write_line(line)?;
        }
        Ok(())
    }
}

fn artifact_line(entry: &ArtifactEntry) -> String {
    let name = entry.file_name();
    if !entry.exists() {
        return format!("{name}: {}", style("missing").dim());
    }
    let detail = match &entry.preview {
        Preview::Table { rows_scanned, truncated, .. } => {
            format!("{rows_scanned}{} rows", if *truncated { "+" } else { "" })
        }
        Preview::Workbook { sheet_count, .. } => format!("{sheet_count} sheet(s)"),
        Preview::Listing { total_children, .. } => format!("{total_children} entries"),
        _ => entry.kind.as_ref().to_owned(),
    };
    let mut line = format!("{name}: {detail}, {}", human_size(entry.total_size()));
    if let Some(error) = &entry.error {
        line.push_str(&format!(" ({})", style(error).yellow()));
    }
    line
}

/// Status of one finished attempt, noting a retry only when one will run.
pub fn event_label(event: &StatusEvent) -> String {
    let label = describe(event.status, event.failure, event.exit_code);
    if event.retry_pending {
        format!("{label}, pending-retry")
    } else {
        label
    }
}

/// Final status for the report line.
pub fn status_label(run: &ToolRun) -> String {
    let label = describe(run.status, run.failure, run.exit_code);
    if run.succeeded() {
        style(label).green().to_string()
    } else {
        style(label).red().to_string()
    }
}

fn describe(status: RunStatus, failure: Option<FailureKind>, exit_code: Option<i32>) -> String {
    match (status, failure) {
        (RunStatus::Succeeded, _) => "succeeded".to_owned(),
        (_, Some(FailureKind::Interrupted)) => "interrupted".to_owned(),
        (_, Some(FailureKind::NotFound)) => "not found".to_owned(),
        (_, Some(FailureKind::Incompatible)) => "incompatible with this host".to_owned(),
        (RunStatus::TimedOut, _) => "timed out".to_owned(),
        (_, _) => match exit_code {
            Some(code) => format!("failed ({code})"),
            None => "failed".to_owned(),
        },
    }
}

fn confidence_label(confidence: Confidence) -> String {
    let text = confidence.to_string();
    match confidence {
        Confidence::High => style(text).red().bold().to_string(),
        Confidence::Medium => style(text).yellow().to_string(),
        Confidence::Low => style(text).green().to_string(),
        Confidence::Unknown => style(text).dim().to_string(),
    }
}

/// Headings bold, table rows kept intact with the Confidence cell colored,
/// prose wrapped to `width`.
pub fn render_summary(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut confidence_col: Option<usize> = None;
    let mut in_table = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('|') {
            let cells: Vec<&str> = trimmed.trim_matches('|').split('|').collect();
            if !in_table {
                in_table = true;
                confidence_col = cells
                    .iter()
                    .position(|c| c.trim().eq_ignore_ascii_case("confidence"));
                lines.push(style(trimmed).bold().to_string());
                continue;
            }
            let rendered: Vec<String> = cells
                .iter()
                .enumerate()
                .map(|(idx, cell)| {
                    if Some(idx) == confidence_col {
                        color_confidence_cell(cell)
                    } else {
                        (*cell).to_owned()
                    }
                })
                .collect();
            lines.push(format!("|{}|", rendered.join("|")));
            continue;
        }

        in_table = false;
        confidence_col = None;
        if trimmed.starts_with('#') {
            lines.push(style(trimmed).cyan().bold().to_string());
        } else if trimmed.is_empty() {
            lines.push(String::new());
        } else {
            lines.extend(textwrap::wrap(line, width).into_iter().map(|l| l.into_owned()));
        }
    }
    lines
}

fn color_confidence_cell(cell: &str) -> String {
    let lower = cell.to_ascii_lowercase();
    if lower.contains("high") {
        style(cell).red().to_string()
    } else if lower.contains("medium") {
        style(cell).yellow().to_string()
    } else if lower.contains("low") {
        style(cell).green().to_string()
    } else {
        cell.to_owned()
    }
}
