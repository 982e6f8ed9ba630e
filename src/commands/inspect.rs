//! Read-only views over cases that were already processed.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::warn;

use crate::cache::ArtifactCache;
use crate::cli::Commands;
use crate::layout::{CaseLayout, OUTPUT_DIR, OutputSet};
use crate::models::{ArtifactEntry, Summary, SummaryMeta, ToolSpec};
use crate::output::Output;

pub const DEFAULT_LOG_TAIL: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct CaseListing {
    pub case: String,
    pub path: PathBuf,
    /// Existing tool outputs plus the summary, if any.
    pub outputs: usize,
    pub tools: Vec<String>,
    pub has_summary: bool,
    pub logs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFile {
    pub attempt: u32,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolOverview {
    pub tool: String,
    pub artifacts: Vec<ArtifactEntry>,
    pub logs: Vec<LogFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredSummary {
    pub path: PathBuf,
    #[serde(flatten)]
    pub meta: Option<SummaryMeta>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseOverview {
    pub case: String,
    pub output_dir: PathBuf,
    pub tools: Vec<ToolOverview>,
    pub summary: Option<StoredSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub tool: String,
    pub attempt: u32,
    pub path: PathBuf,
    pub total_lines: usize,
    pub lines: Vec<String>,
}

pub fn run(command: &Commands, specs: &[ToolSpec], output: &Output) -> Result<()> {
    match command {
        Commands::Cases { base } => output.cases(base, &list_cases(base, specs)?),
        Commands::Show { target } => {
            let layout = CaseLayout::new(target)?;
            output.overview(&overview(&layout, specs, &ArtifactCache::new())?)
        }
        Commands::Log {
            target,
            tool,
            attempt,
            tail,
        } => {
            let layout = CaseLayout::new(target)?;
            output.log_tail(&tool_log(&layout, specs, tool, *attempt, *tail)?)
        }
    }
}

/// Every direct child of `base` holding an output directory, sorted by name.
pub fn list_cases(base: &Path, specs: &[ToolSpec]) -> Result<Vec<CaseListing>> {
    if !base.is_dir() {
        bail!("Not a directory: {}", base.display());
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(base)
        .with_context(|| format!("Failed to read {}", base.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join(OUTPUT_DIR).is_dir())
        .collect();
    dirs.sort();

    dirs.iter()
        .map(|dir| {
            let layout = CaseLayout::new(dir)?;
            let existing = OutputSet::scan(&layout, specs);
            let tools = specs
                .iter()
                .filter(|spec| spec.artifact_paths(&layout).iter().any(|p| p.exists()))
                .map(|spec| spec.name.clone())
                .collect();
            Ok(CaseListing {
                case: layout.case().to_owned(),
                path: layout.target().to_path_buf(),
                outputs: existing.paths.len(),
                tools,
                has_summary: layout.summary_path().exists(),
                logs: count_files(layout.log_dir()),
            })
        })
        .collect()
}

/// Artifacts, logs and summary of one case.
pub fn overview(layout: &CaseLayout, specs: &[ToolSpec], cache: &ArtifactCache) -> Result<CaseOverview> {
    require_output(layout)?;

    let tools = specs
        .iter()
        .map(|spec| ToolOverview {
            tool: spec.name.clone(),
            artifacts: cache
                .get_all(&spec.artifact_paths(layout))
                .into_iter()
                .map(|entry| (*entry).clone())
                .collect(),
            logs: log_files(layout, &spec.name),
        })
        .collect();

    Ok(CaseOverview {
        case: layout.case().to_owned(),
        output_dir: layout.output_dir().to_path_buf(),
        tools,
        summary: stored_summary(layout)?,
    })
}

/// The last `tail` lines of one attempt's log; the latest attempt by default.
/// `apt_hunter` is accepted for `apt-hunter`.
pub fn tool_log(
    layout: &CaseLayout,
    specs: &[ToolSpec],
    tool: &str,
    attempt: Option<u32>,
    tail: usize,
) -> Result<LogTail> {
    require_output(layout)?;

    let name = tool.trim().to_ascii_lowercase().replace('_', "-");
    if !specs.iter().any(|spec| spec.name == name) {
        let known: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        bail!("Unknown tool '{tool}'; expected one of: {}", known.join(", "));
    }

    let logs = log_files(layout, &name);
    let log = match attempt {
        Some(n) => logs.iter().find(|log| log.attempt == n),
        None => logs.last(),
    }
    .ok_or_else(|| match attempt {
        Some(n) => anyhow!("No log for {name} attempt {n} in {}", layout.log_dir().display()),
        None => anyhow!("No log for {name} in {}", layout.log_dir().display()),
    })?;

    let bytes = fs::read(&log.path).with_context(|| format!("Failed to read {}", log.path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();

    Ok(LogTail {
        tool: name,
        attempt: log.attempt,
        path: log.path.clone(),
        total_lines,
        lines: lines[total_lines.saturating_sub(tail)..]
            .iter()
            .map(|line| (*line).to_owned())
            .collect(),
    })
}

fn require_output(layout: &CaseLayout) -> Result<()> {
    if !layout.output_dir().is_dir() {
        bail!(
            "No {OUTPUT_DIR} directory under {}; run evops against it first",
            layout.target().display()
        );
    }
    Ok(())
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir).map_or(0, |entries| {
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .count()
    })
}

/// Attempt logs for `tool`, oldest first. Attempts are numbered without gaps.
fn log_files(layout: &CaseLayout, tool: &str) -> Vec<LogFile> {
    (1..)
        .map(|attempt| (attempt, layout.log_path(tool, attempt)))
        .map_while(|(attempt, path)| {
            let size = fs::metadata(&path).ok()?.len();
            Some(LogFile { attempt, path, size })
        })
        .collect()
}

fn stored_summary(layout: &CaseLayout) -> Result<Option<StoredSummary>> {
    let path = layout.summary_path();
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let meta = Summary::read_meta(&path).unwrap_or_else(|err| {
        warn!("ignoring summary metadata: {err:#}");
        None
    });
    Ok(Some(StoredSummary { path, meta, text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactKind, Confidence};
    use jiff::Timestamp;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("hayabusa", "/bin/true").with_output("{case}_hayabusa_output.csv"),
            ToolSpec::new("apt-hunter", "/bin/true").with_output("{case}_apt_hunter_output"),
            ToolSpec::new("chainsaw", "/bin/true").with_output("{case}_chainsaw_output"),
        ]
    }

    /// A base directory with one processed case (DC01) and one untouched (WS02).
    #[fixture]
    fn base() -> (TempDir, CaseLayout) {
        let dir = TempDir::new().unwrap();
        let processed = dir.path().join("DC01");
        fs::create_dir_all(&processed).unwrap();
        fs::create_dir_all(dir.path().join("WS02")).unwrap();

        let layout = CaseLayout::new(&processed).unwrap();
        layout.ensure_dirs().unwrap();
        fs::write(
            layout.output_dir().join("DC01_hayabusa_output.csv"),
            "Timestamp,RuleTitle,Level\n2024-01-01,Logon,high\n",
        )
        .unwrap();
        fs::write(layout.log_path("hayabusa", 1), "# hayabusa attempt 1\nline a\nline b\n").unwrap();
        fs::write(layout.log_path("hayabusa", 2), "# hayabusa attempt 2\nline c\n").unwrap();
        (dir, layout)
    }

    // Only directories with an output directory are listed.
    #[rstest]
    fn lists_processed_cases_only(base: (TempDir, CaseLayout)) {
        let (dir, layout) = base;
        fs::write(layout.summary_path(), "summary").unwrap();

        let cases = list_cases(dir.path(), &specs()).unwrap();

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].case, "DC01");
        assert_eq!(cases[0].tools, vec!["hayabusa"]);
        assert!(cases[0].has_summary);
        assert_eq!(cases[0].outputs, 2);
        assert_eq!(cases[0].logs, 2);
    }

    #[test]
    fn list_cases_rejects_missing_base() {
        let dir = TempDir::new().unwrap();
        assert!(list_cases(&dir.path().join("nope"), &specs()).is_err());
    }

    // The overview previews artifacts through the cache and reads the summary sidecar.
    #[rstest]
    fn overview_describes_outputs(base: (TempDir, CaseLayout)) {
        let (_dir, layout) = base;
        Summary {
            text: "Overall confidence: High".into(),
            confidence: Confidence::High,
            generated_at: Timestamp::from_second(1_700_000_000).unwrap(),
            prompt_hash: "feed".into(),
            model: "m".into(),
        }
        .write_files(&layout.summary_path())
        .unwrap();
        let cache = ArtifactCache::new();

        let view = overview(&layout, &specs(), &cache).unwrap();

        assert_eq!(view.case, "DC01");
        let hayabusa = &view.tools[0];
        assert_eq!(hayabusa.artifacts[0].kind, ArtifactKind::Csv);
        assert_eq!(hayabusa.logs.len(), 2);
        assert_eq!(view.tools[2].artifacts[0].kind, ArtifactKind::Missing);
        let summary = view.summary.unwrap();
        assert_eq!(summary.meta.unwrap().confidence, Confidence::High);
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn overview_requires_output_dir() {
        let dir = TempDir::new().unwrap();
        let layout = CaseLayout::new(dir.path()).unwrap();
        let err = overview(&layout, &specs(), &ArtifactCache::new()).unwrap_err();
        assert!(err.to_string().contains(OUTPUT_DIR));
    }

    #[rstest]
    #[case::latest("hayabusa", None, 10, 2, vec!["# hayabusa attempt 2", "line c"])]
    #[case::first_attempt("hayabusa", Some(1), 10, 1, vec!["# hayabusa attempt 1", "line a", "line b"])]
    #[case::tail("hayabusa", Some(1), 1, 1, vec!["line b"])]
    fn log_tail_selects_attempt(
        base: (TempDir, CaseLayout),
        #[case] tool: &str,
        #[case] attempt: Option<u32>,
        #[case] tail: usize,
        #[case] expected_attempt: u32,
        #[case] expected: Vec<&str>,
    ) {
        let (_dir, layout) = base;
        let log = tool_log(&layout, &specs(), tool, attempt, tail).unwrap();
        assert_eq!(log.attempt, expected_attempt);
        assert_eq!(log.lines, expected);
    }

    // Unknown names and tools that never ran are reported, not guessed at.
    #[rstest]
    fn log_tail_reports_unknown_and_missing(base: (TempDir, CaseLayout)) {
        let (_dir, layout) = base;
        fs::write(layout.log_path("apt-hunter", 1), "ok\n").unwrap();

        assert_eq!(tool_log(&layout, &specs(), "APT_HUNTER", None, 5).unwrap().tool, "apt-hunter");
        let unknown = tool_log(&layout, &specs(), "sigma", None, 5).unwrap_err().to_string();
        assert!(unknown.contains("expected one of"));
        assert!(tool_log(&layout, &specs(), "chainsaw", None, 5).is_err());
        assert!(tool_log(&layout, &specs(), "hayabusa", Some(7), 5).is_err());
    }
}
