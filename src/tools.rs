//! The analysis tools this crate drives, expressed as [`ToolSpec`]s.

use std::time::Duration;

use crate::config::{AptHunterMode, Config};
use crate::models::{InvocationMode, ToolSpec};

pub const HAYABUSA: &str = "hayabusa";
pub const APT_HUNTER: &str = "apt-hunter";
pub const CHAINSAW: &str = "chainsaw";

/// Which tools the caller asked to leave out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Skips {
    pub hayabusa: bool,
    pub apt_hunter: bool,
    pub chainsaw: bool,
}

impl Skips {
    pub fn skips(&self, tool: &str) -> bool {
        match tool {
            HAYABUSA => self.hayabusa,
            APT_HUNTER => self.apt_hunter,
            CHAINSAW => self.chainsaw,
            _ => false,
        }
    }
}

pub fn hayabusa(config: &Config, timeout: Option<Duration>) -> ToolSpec {
    ToolSpec::new(HAYABUSA, &config.tools.hayabusa)
        .with_args([
            "csv-timeline".to_owned(),
            "--ISO-8601".to_owned(),
            "-t".to_owned(),
            config.runtime.threads.to_string(),
            "--UTC".to_owned(),
            "-q".to_owned(),
            "--no-wizard".to_owned(),
            "-d".to_owned(),
            "{input}".to_owned(),
            "-o".to_owned(),
            "{output}".to_owned(),
        ])
        .with_output("{case}_hayabusa_output.csv")
        .with_timeout(timeout)
}

/// apt-hunter is a script run by the configured interpreter. It writes a set
/// of files sharing the `{output}` prefix.
pub fn apt_hunter(config: &Config, timeout: Option<Duration>) -> ToolSpec {
    let threads = config.runtime.threads.to_string();
    let mode = match config.runtime.apt_hunter_mode {
        AptHunterMode::Directory => InvocationMode::Directory,
        AptHunterMode::PerFile => InvocationMode::PerFile {
            extensions: config.runtime.input_extensions.clone(),
        },
    };

    ToolSpec::new(APT_HUNTER, &config.tools.apt_hunter_python)
        .with_script(&config.tools.apt_hunter)
        .with_args([
            "{script}", "-p", "{input}", "-cores", threads.as_str(), "-tz", "UTC", "-allreport", "-o", "{output}",
        ])
        .with_per_file_args([
            "{script}", "-f", "{input}", "-cores", "1", "-tz", "UTC", "-allreport", "-o", "{output}",
        ])
        .with_output("{case}_apt_hunter_output")
        .with_artifacts([
            "{case}_apt_hunter_output_Report.xlsx",
            "{case}_apt_hunter_output_TimeSketch.csv",
            "{case}_apt_hunter_output_Logon_Events.csv",
            "{case}_apt_hunter_output_hunting.csv",
        ])
        .with_timeout(timeout)
        .with_mode(mode)
}

pub fn chainsaw(config: &Config, timeout: Option<Duration>) -> ToolSpec {
    let tools = &config.tools;
    ToolSpec::new(CHAINSAW, &tools.chainsaw)
        .with_args([
            "hunt".to_owned(),
            "{input}".to_owned(),
            "-s".to_owned(),
            tools.sigma.to_string_lossy().into_owned(),
            "--mapping".to_owned(),
            tools.mapping.to_string_lossy().into_owned(),
            "-r".to_owned(),
            tools.chainsaw_rules.to_string_lossy().into_owned(),
            "--timezone".to_owned(),
            "UTC".to_owned(),
            "--full".to_owned(),
            "--csv".to_owned(),
            "-o".to_owned(),
            "{output}".to_owned(),
        ])
        .with_output("{case}_chainsaw_output")
        .with_timeout(timeout)
}

/// Every tool not skipped, in a fixed order. `timeout` overrides the configured one.
pub fn catalog(config: &Config, skips: Skips, timeout: Option<Duration>) -> Vec<ToolSpec> {
    let timeout = timeout.or_else(|| config.runtime.tool_timeout());
    [hayabusa(config, timeout), apt_hunter(config, timeout), chainsaw(config, timeout)]
        .into_iter()
        .filter(|spec| !skips.skips(&spec.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CaseLayout;
    use crate::models::Bindings;
    use rstest::rstest;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn config() -> Config {
        Config::with_home(Path::new("/home/analyst"))
    }

    fn names(specs: &[ToolSpec]) -> Vec<&str> {
        specs.iter().map(|s| s.name.as_str()).collect()
    }

    #[rstest]
    #[case::none(Skips::default(), vec![HAYABUSA, APT_HUNTER, CHAINSAW])]
    #[case::hayabusa(Skips { hayabusa: true, ..Skips::default() }, vec![APT_HUNTER, CHAINSAW])]
    #[case::two(Skips { apt_hunter: true, chainsaw: true, ..Skips::default() }, vec![HAYABUSA])]
    #[case::all(Skips { hayabusa: true, apt_hunter: true, chainsaw: true }, vec![])]
    fn catalog_respects_skips(#[case] skips: Skips, #[case] expected: Vec<&str>) {
        let specs = catalog(&config(), skips, None);
        assert_eq!(names(&specs), expected);
    }

    // The command-line override beats the configured timeout.
    #[test]
    fn timeout_override_applies_to_every_tool() {
        let mut config = config();
        config.runtime.tool_timeout_secs = 600;

        let specs = catalog(&config, Skips::default(), None);
        assert!(specs.iter().all(|s| s.timeout == Some(Duration::from_secs(600))));

        let specs = catalog(&config, Skips::default(), Some(Duration::from_secs(5)));
        assert!(specs.iter().all(|s| s.timeout == Some(Duration::from_secs(5))));
    }

    // apt-hunter runs the configured script through the interpreter and
    // lists each report file it writes.
    #[test]
    fn apt_hunter_binds_script_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("HOST7");
        std::fs::create_dir_all(&target).unwrap();
        let layout = CaseLayout::new(&target).unwrap();

        let mut config = config();
        config.runtime.apt_hunter_mode = AptHunterMode::Directory;
        config.runtime.threads = 4;
        let spec = apt_hunter(&config, None);

        assert_eq!(spec.program, PathBuf::from("/home/analyst/git/APT-Hunter/.venv/bin/python"));
        let output = spec.output_path(&layout);
        let args: Vec<String> = spec
            .render_args(&Bindings {
                input: layout.target(),
                target: layout.target(),
                output: &output,
                case: layout.case(),
                script: spec.script.as_deref(),
            })
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "/home/analyst/git/APT-Hunter/APT-Hunter.py");
        assert_eq!(args[4], "4");
        assert!(args.last().unwrap().ends_with("HOST7_apt_hunter_output"));

        let artifacts = spec.artifact_paths(&layout);
        assert_eq!(artifacts.len(), 4);
        assert!(artifacts[0].ends_with("HOST7_apt_hunter_output_Report.xlsx"));
    }

    #[test]
    fn apt_hunter_mode_selects_per_file() {
        let mut config = config();
        config.runtime.apt_hunter_mode = AptHunterMode::PerFile;
        config.runtime.input_extensions = vec!["evtx".into(), "evt".into()];
        let spec = apt_hunter(&config, None);

        assert_eq!(
            spec.mode,
            InvocationMode::PerFile {
                extensions: vec!["evtx".into(), "evt".into()]
            }
        );
        assert_eq!(spec.template()[1], "-f");
    }

    #[test]
    fn chainsaw_points_at_rule_sets() {
        let spec = chainsaw(&config(), None);
        assert_eq!(spec.args[0], "hunt");
        assert!(spec.args.iter().any(|a| a.ends_with("sigma-event-logs-all.yml")));
        assert!(spec.artifacts.is_empty());
    }
}
