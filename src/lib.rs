#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod archive;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod helpers;
pub mod id;
pub mod layout;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod rerun;
pub mod runner;
pub mod summarizer;
pub mod tools;
pub mod update;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use console::Term;
use tracing::{debug, info, warn};

use cache::ArtifactCache;
use cli::{Cli, Commands};
use commands::{Session, inspect};
use config::Config;
use error::OpsError;
use layout::{CaseLayout, OutputSet};
use orchestrator::CancelFlag;
use output::Output;
use rerun::{ConsolePrompter, ExecutionPath, FixedPrompter, Prompter, RerunDecision};
use summarizer::HttpCompletionClient;
use tools::Skips;

/// Exit status of a run stopped by SIGINT or SIGTERM.
pub const EXIT_INTERRUPTED: u8 = 130;

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Load the configuration, writing a default one first when asked to.
fn load_config(cli: &Cli, output: &Output) -> Result<Config> {
    let path = Config::locate(cli.config.as_deref(), env_var)?;
    debug!(path = %path.display(), "configuration file");

    let config = if !path.exists() && cli.auto_config {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow!("Cannot determine the home directory for default tool paths"))?;
        let config = Config::write_default(&path, &home)?;
        output.notice(&format!(
            "Wrote default configuration to {}. Review the tool paths before the next run.",
            path.display()
        ))?;
        config
    } else {
        Config::load(&path)?
    };
    Ok(config.with_env_overrides(env_var))
}

fn resolve_target(cli: &Cli) -> Result<PathBuf> {
    match &cli.target {
        Some(target) => Ok(target.clone()),
        None => std::env::current_dir().context("Failed to read the current directory"),
    }
}

fn decide(cli: &Cli, existing: &OutputSet) -> Result<ExecutionPath> {
    // The menu goes to stderr when stdout carries the JSON document.
    let term = if cli.json { Term::stderr() } else { Term::stdout() };
    let mut prompter: Box<dyn Prompter> = match cli.on_existing {
        Some(choice) => Box::new(FixedPrompter(choice)),
        None => Box::new(ConsolePrompter::new(std::io::stdin().lock(), term)),
    };
    RerunDecision::evaluate(existing, prompter.as_mut())
}

/// First Ctrl-C (or SIGTERM) stops the running tools and lets the report
/// print; a second one exits at once.
fn install_interrupt_handler(cancel: &CancelFlag) {
    let flag = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if flag.is_cancelled() {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
        warn!("Interrupted; stopping tools (press Ctrl-C again to exit now)");
        flag.cancel();
    });
    if let Err(err) = installed {
        warn!("failed to install interrupt handler: {err}");
    }
}

/// Inspection reads whatever configuration exists; output names only depend
/// on the case and the APT-Hunter mode, so defaults are fine without one.
fn inspection_config(cli: &Cli) -> Result<Config> {
    let path = Config::locate(cli.config.as_deref(), env_var)?;
    if path.exists() {
        return Config::load(&path);
    }
    debug!(path = %path.display(), "no configuration file, using defaults");
    Ok(Config::with_home(&dirs::home_dir().unwrap_or_default()))
}

fn inspect_cases(cli: &Cli, command: &Commands, output: &Output) -> Result<()> {
    let config = inspection_config(cli)?;
    let specs = tools::catalog(&config, Skips::default(), None);
    inspect::run(command, &specs, output)
}

fn analyze(cli: &Cli, output: &Output, cancel: &CancelFlag) -> Result<()> {
    let layout = CaseLayout::new(&resolve_target(cli)?)?;
    let config = load_config(cli, output)?;

    if cli.update_tools {
        let report = update::run(&update::plan(&config.tools));
        output.update_finished(&report)?;
    }

    let specs = tools::catalog(&config, cli.skips(), cli.tool_timeout.map(Duration::from_secs));
    if specs.is_empty() {
        bail!("Every tool is skipped; nothing to run");
    }

    let existing = OutputSet::scan(&layout, &specs);
    let path = decide(cli, &existing)?;
    info!(case = layout.case(), path = %path, "execution path chosen");
    output.path_chosen(layout.case(), path)?;

    if path == ExecutionPath::Abort {
        return output.aborted(&existing);
    }

    install_interrupt_handler(cancel);
    let cache = ArtifactCache::new();
    let client = HttpCompletionClient;
    let mut session = Session {
        config: &config,
        layout: &layout,
        specs: &specs,
        cache: &cache,
        output,
        client: &client,
        cancel: cancel.clone(),
        retry_failed: cli.retry_failed,
        want_summary: cli.llm_summary,
        want_archive: cli.archive,
    };
    rerun::dispatch(path, &mut session)
}

pub fn run(cli: Cli) -> Result<()> {
    let output = Output::new(cli.json);
    let cancel = CancelFlag::default();

    let outcome = match &cli.command {
        Some(command) => inspect_cases(&cli, command, &output),
        None => analyze(&cli, &output, &cancel),
    };
    // Whatever was recorded before a failure still reaches stdout.
    output.finish()?;
    outcome?;

    if cancel.is_cancelled() {
        return Err(OpsError::RunInterrupted.into());
    }
    Ok(())
}
