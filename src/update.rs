//! Best-effort refresh of the external tool checkouts before a run.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ToolPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStep {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl UpdateStep {
    fn new(name: &str, program: impl Into<String>, args: &[&str], cwd: PathBuf) -> Self {
        Self {
            name: name.to_owned(),
            program: program.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            cwd,
        }
    }

    fn git_pull(name: &str, cwd: PathBuf) -> Self {
        Self::new(name, "git", &["pull", "--ff-only"], cwd)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map_or_else(|| path.to_path_buf(), Path::to_path_buf)
}

/// Steps to run, in order. Pure: only inspects the filesystem.
pub fn plan(tools: &ToolPaths) -> Vec<UpdateStep> {
    let hayabusa_root = parent_of(&resolve(&tools.hayabusa));
    let apt_root = parent_of(&resolve(&tools.apt_hunter));
    let chainsaw_bin = resolve(&tools.chainsaw);
    // <root>/target/release/chainsaw
    let chainsaw_root = chainsaw_bin
        .ancestors()
        .nth(3)
        .map_or_else(|| parent_of(&chainsaw_bin), Path::to_path_buf);

    let mut steps = vec![
        UpdateStep::git_pull("hayabusa", hayabusa_root.clone()),
        UpdateStep::git_pull("apt-hunter", apt_root.clone()),
        UpdateStep::git_pull("chainsaw", chainsaw_root),
        UpdateStep::git_pull("sigma", resolve(&tools.sigma)),
    ];

    let requirements = apt_root.join("requirements.txt");
    if requirements.exists() {
        let python = &tools.apt_hunter_python;
        if python.components().any(|c| c.as_os_str() == ".venv") {
            let requirements = requirements.to_string_lossy().into_owned();
            steps.push(UpdateStep::new(
                "apt-hunter requirements",
                python.to_string_lossy(),
                &["-m", "pip", "install", "-r", requirements.as_str()],
                apt_root,
            ));
        } else {
            warn!(
                "Skipping apt-hunter requirements update: {} does not look like a virtualenv interpreter",
                python.display()
            );
        }
    }

    if hayabusa_root.join("Cargo.toml").exists() {
        steps.push(UpdateStep::new(
            "hayabusa build",
            "cargo",
            &["build", "--release"],
            hayabusa_root,
        ));
    }

    steps
}

/// Run each step in turn. Missing directories and failures only warn.
/// Child output goes to stderr; stdout carries only the run report.
pub fn run(steps: &[UpdateStep]) -> UpdateReport {
    let mut report = UpdateReport::default();

    for step in steps {
        if !step.cwd.is_dir() {
            warn!("Skipping {} update; directory missing: {}", step.name, step.cwd.display());
            report.skipped += 1;
            continue;
        }

        info!("Updating {}", step.name);
        debug!(cwd = %step.cwd.display(), "{} {}", step.program, step.args.join(" "));
        let status = Command::new(&step.program)
            .args(&step.args)
            .current_dir(&step.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(io::stderr()))
            .status();
        match status {
            Ok(status) if status.success() => {
                info!("{} update completed", step.name);
                report.succeeded += 1;
            }
            Ok(status) => {
                warn!("{} update exited with {status}", step.name);
                report.failed += 1;
            }
            Err(err) => {
                warn!("Command not found while updating {}: {} ({err})", step.name, step.program);
                report.failed += 1;
            }
        }
    }

    report
}
