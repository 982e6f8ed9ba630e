use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::CaseLayout;

/// How a tool is pointed at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// One invocation with `{input}` bound to the target directory.
    Directory,
    /// One invocation per qualifying file in the target. Used for tools that
    /// deadlock when they fan out worker processes over a whole directory.
    PerFile { extensions: Vec<String> },
}

/// Immutable description of one analysis tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub program: PathBuf,
    /// Script handed to `program` (e.g. a Python entry point), bound to `{script}`.
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    /// Argument template used in per-file mode; falls back to `args`.
    pub per_file_args: Option<Vec<String>>,
    /// Output name relative to the output directory, bound to `{output}`.
    pub output: String,
    /// Expected artifacts relative to the output directory. Empty means the
    /// `{output}` path itself is the artifact.
    pub artifacts: Vec<String>,
    pub timeout: Option<Duration>,
    pub mode: InvocationMode,
}

/// Values substituted into an argument template.
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    pub input: &'a Path,
    pub target: &'a Path,
    pub output: &'a Path,
    pub case: &'a str,
    pub script: Option<&'a Path>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            script: None,
            args: Vec::new(),
            per_file_args: None,
            output: String::new(),
            artifacts: Vec::new(),
            timeout: None,
            mode: InvocationMode::Directory,
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_per_file_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.per_file_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_per_file(&self) -> bool {
        matches!(self.mode, InvocationMode::PerFile { .. })
    }

    /// Output path bound to `{output}` in directory mode.
    pub fn output_path(&self, layout: &CaseLayout) -> PathBuf {
        layout.output_dir().join(expand_case(&self.output, layout.case()))
    }

    /// Directory collecting every per-file invocation's output.
    pub fn per_file_dir(&self, layout: &CaseLayout) -> PathBuf {
        layout
            .output_dir()
            .join(format!("{}_{}_per_file", layout.case(), self.name))
    }

    /// `{output}` for the per-file invocation over `input`.
    pub fn per_file_output(&self, layout: &CaseLayout, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_owned());
        let output_name = expand_case(&self.output, layout.case());
        self.per_file_dir(layout)
            .join(format!("{stem}_{output_name}"))
    }

    /// Paths this tool is expected to produce.
    pub fn artifact_paths(&self, layout: &CaseLayout) -> Vec<PathBuf> {
        if self.is_per_file() {
            return vec![self.per_file_dir(layout)];
        }
        if self.artifacts.is_empty() {
            return vec![self.output_path(layout)];
        }
        self.artifacts
            .iter()
            .map(|pattern| layout.output_dir().join(expand_case(pattern, layout.case())))
            .collect()
    }

    /// Argument template for the current mode.
    pub fn template(&self) -> &[String] {
        match (&self.mode, &self.per_file_args) {
            (InvocationMode::PerFile { .. }, Some(args)) => args,
            _ => &self.args,
        }
    }

    pub fn render_args(&self, bindings: &Bindings<'_>) -> Vec<OsString> {
        self.template()
            .iter()
            .map(|arg| OsString::from(render(arg, bindings)))
            .collect()
    }

    /// Qualifying inputs for per-file mode: immediate children of `target`
    /// with a matching extension, sorted by name.
    pub fn qualifying_inputs(&self, target: &Path) -> std::io::Result<Vec<PathBuf>> {
        let InvocationMode::PerFile { extensions } = &self.mode else {
            return Ok(vec![target.to_path_buf()]);
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(target)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn expand_case(pattern: &str, case: &str) -> String {
    pattern.replace("{case}", case)
}

fn render(arg: &str, bindings: &Bindings<'_>) -> String {
    let mut out = arg
        .replace("{input}", &bindings.input.to_string_lossy())
        .replace("{target}", &bindings.target.to_string_lossy())
        .replace("{output}", &bindings.output.to_string_lossy())
        .replace("{case}", bindings.case);
    if let Some(script) = bindings.script {
        out = out.replace("{script}", &script.to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn layout() -> (TempDir, CaseLayout) {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("HOST01");
        std::fs::create_dir_all(&target).unwrap();
        let layout = CaseLayout::new(&target).unwrap();
        (dir, layout)
    }

    // Every placeholder is substituted; unknown braces pass through untouched.
    #[rstest]
    fn render_args_binds_placeholders() {
        let spec = ToolSpec::new("apt-hunter", "/usr/bin/python3")
            .with_script("/opt/apt/APT-Hunter.py")
            .with_args(["{script}", "-p", "{input}", "-o", "{output}", "--case={case}", "{keep}"]);
        let bindings = Bindings {
            input: Path::new("/cases/HOST01"),
            target: Path::new("/cases/HOST01"),
            output: Path::new("/cases/HOST01/out/x"),
            case: "HOST01",
            script: spec.script.as_deref(),
        };

        let args: Vec<String> = spec
            .render_args(&bindings)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "/opt/apt/APT-Hunter.py",
                "-p",
                "/cases/HOST01",
                "-o",
                "/cases/HOST01/out/x",
                "--case=HOST01",
                "{keep}",
            ]
        );
    }

    // Artifacts default to the output path, expand {case} when listed, and
    // collapse to the per-file directory in per-file mode.
    #[rstest]
    fn artifact_paths_follow_mode(layout: (TempDir, CaseLayout)) {
        let (_dir, layout) = layout;
        let out = layout.output_dir().to_path_buf();

        let single = ToolSpec::new("hayabusa", "/bin/true").with_output("{case}_hayabusa_output.csv");
        assert_eq!(single.artifact_paths(&layout), vec![out.join("HOST01_hayabusa_output.csv")]);

        let listed = ToolSpec::new("apt-hunter", "/bin/true")
            .with_output("{case}_apt")
            .with_artifacts(["{case}_apt_Report.xlsx", "{case}_apt_hunting.csv"]);
        assert_eq!(
            listed.artifact_paths(&layout),
            vec![out.join("HOST01_apt_Report.xlsx"), out.join("HOST01_apt_hunting.csv")]
        );

        let per_file = listed.with_mode(InvocationMode::PerFile {
            extensions: vec!["evtx".into()],
        });
        assert_eq!(
            per_file.artifact_paths(&layout),
            vec![out.join("HOST01_apt-hunter_per_file")]
        );
        assert_eq!(
            per_file.per_file_output(&layout, Path::new("/x/Security.evtx")),
            out.join("HOST01_apt-hunter_per_file").join("Security_HOST01_apt")
        );
    }

    // Only direct children with a matching extension qualify, regardless of case.
    #[rstest]
    fn qualifying_inputs_filters_and_sorts(layout: (TempDir, CaseLayout)) {
        let (_dir, layout) = layout;
        let target = layout.target();
        std::fs::write(target.join("System.evtx"), b"x").unwrap();
        std::fs::write(target.join("Application.EVTX"), b"x").unwrap();
        std::fs::write(target.join("notes.txt"), b"x").unwrap();
        std::fs::create_dir_all(target.join("nested.evtx")).unwrap();

        let spec = ToolSpec::new("apt-hunter", "/bin/true").with_mode(InvocationMode::PerFile {
            extensions: vec!["evtx".into()],
        });
        let inputs = spec.qualifying_inputs(target).unwrap();
        assert_eq!(
            inputs,
            vec![target.join("Application.EVTX"), target.join("System.evtx")]
        );
    }

    // Per-file mode prefers the dedicated template when one is given.
    #[rstest]
    fn template_switches_in_per_file_mode() {
        let spec = ToolSpec::new("t", "/bin/true")
            .with_args(["-d", "{input}"])
            .with_per_file_args(["-f", "{input}"]);
        assert_eq!(spec.template(), ["-d", "{input}"]);

        let spec = spec.with_mode(InvocationMode::PerFile { extensions: vec![] });
        assert_eq!(spec.template(), ["-f", "{input}"]);
    }
}
