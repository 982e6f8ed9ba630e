use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::helpers::atomic_write;

pub const CONFIG_FILE_NAME: &str = "eventlog_tools.toml";
pub const CONFIG_ENV: &str = "EVENTLOG_OPS_CONFIG";
pub const LLM_ENDPOINT_ENV: &str = "LLM_ENDPOINT";
pub const LLM_MODEL_ENV: &str = "LLM_MODEL";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an incident-response assistant. Summarize findings with a concise \
markdown table (columns: Tool, Key Finding, Supporting Evidence) followed by a short narrative summary.";

/// User prompt wrapped around the artifact digest. `{case}` and `{context}`
/// are substituted at request time.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "The following JSON describes outputs from Windows event log analysis tools. \
Examine the artifacts to surface notable findings, correlations, and any gaps.
Case identifier: {case}.
JSON data:
{context}

Instructions:
1. Produce a markdown table with columns: Tool, Artifact, Key Finding, Evidence Snippet, Confidence.
   - Use concise entries (<=120 characters per cell).
   - When an artifact comes from multiple files (e.g., directory contents), mention each file in Evidence.
   - Highlight if an artifact is unreadable or a tool failed.
2. Provide a narrative summary (<= 180 words) that:
   - Synthesizes correlations between tools.
   - Calls out investigative next steps.
   - Notes any data quality issues.
3. Highlight any notable workbook sheets (e.g., APT-Hunter TimeSketch) with why they matter.
4. Add a 'Reasoning Notes' section that explains, in bullet points, how the evidence informed each major finding.
5. Suggest two follow-up questions the analyst should ask.
6. End with a line of the form 'Overall confidence: <Low|Medium|High>'.";

/// Immutable configuration, loaded once and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tools: ToolPaths,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub hayabusa: PathBuf,
    pub apt_hunter: PathBuf,
    pub apt_hunter_python: PathBuf,
    pub chainsaw: PathBuf,
    pub sigma: PathBuf,
    pub mapping: PathBuf,
    pub chainsaw_rules: PathBuf,
}

impl ToolPaths {
    /// Conventional checkout locations under `<home>/git`.
    pub fn under(home: &Path) -> Self {
        let git = home.join("git");
        let apt_root = ["APT-Hunter", "APT-Hunter-main"]
            .iter()
            .map(|name| git.join(name))
            .find(|root| root.exists())
            .unwrap_or_else(|| git.join("APT-Hunter"));

        Self {
            hayabusa: git.join("hayabusa").join("hayabusa"),
            apt_hunter: apt_root.join("APT-Hunter.py"),
            apt_hunter_python: apt_root.join(".venv").join("bin").join("python"),
            chainsaw: git.join("chainsaw").join("target").join("release").join("chainsaw"),
            sigma: git.join("sigma"),
            mapping: git.join("chainsaw").join("mappings").join("sigma-event-logs-all.yml"),
            chainsaw_rules: git.join("chainsaw").join("rules"),
        }
    }
}

/// How apt-hunter is pointed at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AptHunterMode {
    Directory,
    PerFile,
}

impl Default for AptHunterMode {
    /// apt-hunter's worker pool deadlocks under the spawn start method used on macOS.
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::PerFile
        } else {
            Self::Directory
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads/cores handed to the tools that accept one.
    pub threads: u32,
    /// Per-invocation timeout; 0 disables it.
    pub tool_timeout_secs: u64,
    pub apt_hunter_mode: AptHunterMode,
    /// Extensions that qualify an input file in per-file mode.
    pub input_extensions: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: 20,
            tool_timeout_secs: 0,
            apt_hunter_mode: AptHunterMode::default(),
            input_extensions: vec!["evtx".to_owned()],
            poll_interval_ms: 200,
        }
    }
}

impl RuntimeConfig {
    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub system_prompt: String,
    pub prompt_template: String,
    pub temperature: f64,
    /// Negative means "let the model decide" and is left out of the request.
    pub max_tokens: i64,
    pub timeout_seconds: u64,
    /// Upper bound on the assembled user prompt, in characters.
    pub prompt_budget_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:1234/v1/chat/completions".to_owned(),
            model: "openai/gpt-oss-120b".to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_owned(),
            temperature: 0.2,
            max_tokens: -1,
            timeout_seconds: 180,
            prompt_budget_chars: 48_000,
        }
    }
}

impl Config {
    pub fn with_home(home: &Path) -> Self {
        Self {
            tools: ToolPaths::under(home),
            runtime: RuntimeConfig::default(),
            llm: LlmConfig::default(),
        }
    }

    /// `explicit` wins, then the environment, then the file next to the executable.
    pub fn locate(explicit: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = env(CONFIG_ENV).filter(|p| !p.trim().is_empty()) {
            return Ok(PathBuf::from(path));
        }
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        let dir = exe
            .parent()
            .ok_or_else(|| anyhow!("Executable has no parent directory: {}", exe.display()))?;
        Ok(dir.join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "Configuration file not found: {} (run with --auto-config to create one)",
                path.display()
            );
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Write a default configuration to `path`, refusing to clobber an existing one.
    pub fn write_default(path: &Path, home: &Path) -> Result<Self> {
        if path.exists() {
            bail!("Configuration file already exists: {}", path.display());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let config = Self::with_home(home);
        let content = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
        atomic_write(path, content.as_bytes())?;
        Ok(config)
    }

    /// Merge environment overrides into the loaded value. Nothing is written back.
    pub fn with_env_overrides(mut self, env: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(endpoint) = env(LLM_ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            self.llm.endpoint = endpoint.trim().to_owned();
        }
        if let Some(model) = env(LLM_MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.llm.model = model.trim().to_owned();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const TOOLS_ONLY: &str = r#"
[tools]
hayabusa = "/opt/hayabusa/hayabusa"
apt_hunter = "/opt/apt/APT-Hunter.py"
apt_hunter_python = "/opt/apt/.venv/bin/python"
chainsaw = "/opt/chainsaw/target/release/chainsaw"
sigma = "/opt/sigma"
mapping = "/opt/chainsaw/mappings/sigma-event-logs-all.yml"
chainsaw_rules = "/opt/chainsaw/rules"
"#;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // Only [tools] is mandatory; the other sections fall back to defaults.
    #[test]
    fn missing_sections_take_defaults() {
        let config: Config = toml::from_str(TOOLS_ONLY).unwrap();
        assert_eq!(config.tools.sigma, PathBuf::from("/opt/sigma"));
        assert_eq!(config.runtime.threads, 20);
        assert_eq!(config.runtime.tool_timeout(), None);
        assert_eq!(config.llm.max_tokens, -1);
        assert_eq!(config.llm.timeout_seconds, 180);
        assert!(!config.llm.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = format!(
            "{TOOLS_ONLY}\n[runtime]\ntool_timeout_secs = 90\napt_hunter_mode = \"per_file\"\n\n[llm]\nenabled = true\n"
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.runtime.tool_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.runtime.apt_hunter_mode, AptHunterMode::PerFile);
        assert_eq!(config.runtime.input_extensions, vec!["evtx"]);
        assert!(config.llm.enabled);
        assert_eq!(config.llm.temperature, 0.2);
    }

    #[test]
    fn missing_tool_key_is_an_error() {
        let text = TOOLS_ONLY.replace("sigma = \"/opt/sigma\"\n", "");
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, text).unwrap();
        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("sigma"));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err().to_string();
        assert!(err.contains("--auto-config"));
    }

    // Environment values replace the stored endpoint and model; blanks are ignored.
    #[rstest]
    #[case::both(&[("LLM_ENDPOINT", "http://gpu:8080/v1/chat/completions"), ("LLM_MODEL", "m2")], "http://gpu:8080/v1/chat/completions", "m2")]
    #[case::blank(&[("LLM_ENDPOINT", "  ")], "http://localhost:1234/v1/chat/completions", "openai/gpt-oss-120b")]
    #[case::none(&[], "http://localhost:1234/v1/chat/completions", "openai/gpt-oss-120b")]
    fn env_overrides_merge(#[case] pairs: &[(&str, &str)], #[case] endpoint: &str, #[case] model: &str) {
        let config: Config = toml::from_str(TOOLS_ONLY).unwrap();
        let config = config.with_env_overrides(env_of(pairs));
        assert_eq!(config.llm.endpoint, endpoint);
        assert_eq!(config.llm.model, model);
    }

    #[test]
    fn locate_prefers_explicit_then_env() {
        let explicit = Path::new("/etc/evops.toml");
        let env = env_of(&[(CONFIG_ENV, "/srv/evops.toml")]);
        assert_eq!(Config::locate(Some(explicit), &env).unwrap(), explicit);
        assert_eq!(Config::locate(None, &env).unwrap(), PathBuf::from("/srv/evops.toml"));
        let fallback = Config::locate(None, env_of(&[])).unwrap();
        assert!(fallback.ends_with(CONFIG_FILE_NAME));
    }

    // The generated file loads back and points into ~/git.
    #[test]
    fn write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE_NAME);
        let written = Config::write_default(&path, Path::new("/home/analyst")).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.tools, written.tools);
        assert_eq!(
            loaded.tools.chainsaw,
            PathBuf::from("/home/analyst/git/chainsaw/target/release/chainsaw")
        );
        assert!(Config::write_default(&path, Path::new("/home/analyst")).is_err());
    }
}
