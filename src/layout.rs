use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

use crate::models::ToolSpec;

pub const OUTPUT_DIR: &str = "eventlog_operations_output";
pub const LOG_DIR: &str = "eventlog_operations_log";

/// Where one case's outputs live on disk. The target itself is only read.
#[derive(Debug, Clone)]
pub struct CaseLayout {
    target: PathBuf,
    case: String,
    output_dir: PathBuf,
    log_dir: PathBuf,
}

impl CaseLayout {
    /// Resolve `target` to an absolute directory and derive the case name from it.
    pub fn new(target: &Path) -> Result<Self> {
        if !target.exists() {
            bail!("Target directory does not exist: {}", target.display());
        }
        if !target.is_dir() {
            bail!("Target path is not a directory: {}", target.display());
        }

        let target = target
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", target.display()))?;
        let case = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Cannot derive a case name from {}", target.display()))?;

        let output_dir = target.join(OUTPUT_DIR);
        let log_dir = output_dir.join(LOG_DIR);

        Ok(Self {
            target,
            case,
            output_dir,
            log_dir,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn case(&self) -> &str {
        &self.case
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Log file for one attempt; later attempts never overwrite earlier ones.
    pub fn log_path(&self, tool: &str, attempt: u32) -> PathBuf {
        let name = if attempt <= 1 {
            format!("{}_{tool}.log", self.case)
        } else {
            format!("{}_{tool}.attempt{attempt}.log", self.case)
        };
        self.log_dir.join(name)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_llm_summary.txt", self.case))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))
    }
}

/// Artifacts already on disk for a case. A view over the output directory,
/// rebuilt on demand and never stored.
#[derive(Debug, Clone, Default)]
pub struct OutputSet {
    pub case: String,
    pub paths: Vec<PathBuf>,
}

impl OutputSet {
    pub fn scan(layout: &CaseLayout, specs: &[ToolSpec]) -> Self {
        let summary = layout.summary_path();
        let paths = specs
            .iter()
            .flat_map(|spec| spec.artifact_paths(layout))
            .chain(std::iter::once(summary))
            .filter(|path| path.exists())
            .collect();

        Self {
            case: layout.case().to_owned(),
            paths,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
