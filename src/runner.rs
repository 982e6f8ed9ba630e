//! One external tool invocation per attempt.
//!
//! An [`Attempt`] is driven by polling: [`Attempt::poll`] never blocks, so a
//! single coordinator can watch several tools at once. [`Attempt::wait`] is
//! the blocking form for callers that only track one tool.
//!
//! Each invocation leads its own process group. Timeouts, aborts and drops
//! kill the whole group, and a finished invocation's stragglers are swept, so
//! no worker a tool forked outlives the attempt that started it.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use jiff::Timestamp;
use tracing::{debug, warn};

use crate::layout::CaseLayout;
use crate::models::{
    Bindings, EXIT_KILLED, EXIT_NOT_FOUND, EXIT_SPAWN_FAILED, FailureKind, RunStatus, ToolRun,
    ToolSpec,
};

/// `ENOEXEC`: the kernel refused the binary format.
const EXEC_FORMAT_ERROR: i32 = 8;

pub struct ToolRunner<'a> {
    spec: &'a ToolSpec,
    layout: &'a CaseLayout,
}

impl<'a> ToolRunner<'a> {
    pub fn new(spec: &'a ToolSpec, layout: &'a CaseLayout) -> Self {
        Self { spec, layout }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// First attempt. The returned attempt is Running, or already terminal
    /// when the tool could not be launched at all.
    pub fn start(&self) -> Attempt<'a> {
        Attempt::launch(self.spec, self.layout, 1)
    }

    /// A fresh attempt after `prior` failed or timed out. The prior log stays.
    pub fn retry(&self, prior: &ToolRun) -> Result<Attempt<'a>> {
        if prior.tool != self.spec.name {
            bail!(
                "Cannot retry {} with the runner for {}",
                prior.tool,
                self.spec.name
            );
        }
        if !prior.status.is_retryable() {
            bail!(
                "Only failed or timed out runs can be retried. {} attempt {} is {}",
                prior.tool,
                prior.attempt,
                prior.status
            );
        }
        Ok(Attempt::launch(self.spec, self.layout, prior.attempt + 1))
    }
}

struct Invocation {
    child: Child,
    input: PathBuf,
    deadline: Option<Instant>,
}

/// Accumulated outcome of the invocations made so far.
#[derive(Debug, Default)]
struct BatchOutcome {
    timed_out: bool,
    first_failure: Option<i32>,
}

pub struct Attempt<'a> {
    spec: &'a ToolSpec,
    layout: &'a CaseLayout,
    run: ToolRun,
    log: Option<File>,
    pending: VecDeque<PathBuf>,
    current: Option<Invocation>,
    outcome: BatchOutcome,
    started: Instant,
}

impl<'a> Attempt<'a> {
    fn launch(spec: &'a ToolSpec, layout: &'a CaseLayout, attempt: u32) -> Self {
        let log_path = layout.log_path(&spec.name, attempt);
        let mut run = ToolRun::new(&spec.name, attempt, log_path, spec.program.clone());
        run.timeout_secs = spec.timeout.map_or(0, |t| t.as_secs());

        let mut this = Self {
            spec,
            layout,
            run,
            log: None,
            pending: VecDeque::new(),
            current: None,
            outcome: BatchOutcome::default(),
            started: Instant::now(),
        };

        if let Some(missing) = this.missing_executable() {
            warn!(tool = %spec.name, path = %missing.display(), "executable not found");
            this.open_log();
            this.note(format_args!(
                "# {} attempt {attempt}: executable not found: {}",
                spec.name,
                missing.display()
            ));
            this.run.program = missing;
            this.close(RunStatus::Failed, Some(EXIT_NOT_FOUND), Some(FailureKind::NotFound));
            return this;
        }

        if !this.open_log() {
            this.close(RunStatus::Failed, Some(EXIT_SPAWN_FAILED), Some(FailureKind::Io));
            return this;
        }

        match spec.qualifying_inputs(layout.target()) {
            Ok(inputs) => this.pending = inputs.into(),
            Err(err) => {
                warn!(tool = %spec.name, "failed to enumerate inputs: {err}");
                this.note(format_args!("# failed to enumerate inputs: {err}"));
                this.close(RunStatus::Failed, Some(EXIT_SPAWN_FAILED), Some(FailureKind::Io));
                return this;
            }
        }

        this.note(format_args!(
            "# {} attempt {attempt} started {} ({} invocation(s))",
            spec.name,
            Timestamp::now(),
            this.pending.len()
        ));
        if spec.is_per_file() && this.pending.is_empty() {
            warn!(tool = %spec.name, "no qualifying input files in {}", layout.target().display());
            this.note(format_args!("# no qualifying input files"));
        }

        this.run.mark_running();
        this.poll();
        this
    }

    pub fn run(&self) -> &ToolRun {
        &self.run
    }

    pub fn is_terminal(&self) -> bool {
        self.run.is_terminal()
    }

    /// Advance without blocking. Returns true once the attempt is terminal.
    pub fn poll(&mut self) -> bool {
        while !self.run.is_terminal() {
            if let Some(invocation) = self.current.as_mut() {
                match invocation.child.try_wait() {
                    Ok(Some(status)) => {
                        let input = invocation.input.clone();
                        if let Err(err) = signal_group(&mut invocation.child) {
                            debug!(tool = %self.spec.name, "sweeping process group failed: {err}");
                        }
                        self.current = None;
                        self.record_exit(&input, status);
                    }
                    Ok(None) => {
                        let expired = invocation
                            .deadline
                            .is_some_and(|deadline| Instant::now() >= deadline);
                        if !expired {
                            return false;
                        }
                        self.kill_current("timed out");
                        self.outcome.timed_out = true;
                    }
                    Err(err) => {
                        warn!(tool = %self.spec.name, "failed to poll child: {err}");
                        self.kill_current("lost track of process");
                        self.outcome.first_failure.get_or_insert(EXIT_KILLED);
                    }
                }
                continue;
            }

            match self.pending.pop_front() {
                Some(input) => self.spawn(input),
                None => self.finalize(),
            }
        }
        true
    }

    /// Block until the attempt is terminal, checking every `tick`.
    pub fn wait(mut self, tick: Duration) -> ToolRun {
        while !self.poll() {
            thread::sleep(tick);
        }
        self.finish()
    }

    /// Kill whatever is still running and mark the attempt interrupted.
    pub fn abort(&mut self) {
        if self.run.is_terminal() {
            return;
        }
        self.kill_current("interrupted");
        self.pending.clear();
        self.close(RunStatus::Failed, Some(EXIT_KILLED), Some(FailureKind::Interrupted));
    }

    /// The finished record. Aborts first if the attempt is still running.
    pub fn finish(mut self) -> ToolRun {
        self.abort();
        self.run.clone()
    }

    fn missing_executable(&self) -> Option<PathBuf> {
        if !is_executable(&self.spec.program) {
            return Some(self.spec.program.clone());
        }
        self.spec
            .script
            .as_ref()
            .filter(|script| !script.is_file())
            .cloned()
    }

    fn open_log(&mut self) -> bool {
        let opened = fs::create_dir_all(self.layout.log_dir()).and_then(|()| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.run.log_path)
        });
        match opened {
            Ok(file) => {
                self.log = Some(file);
                true
            }
            Err(err) => {
                warn!(
                    tool = %self.spec.name,
                    "failed to open log {}: {err}",
                    self.run.log_path.display()
                );
                false
            }
        }
    }

    fn note(&self, line: std::fmt::Arguments<'_>) {
        if let Some(mut log) = self.log.as_ref() {
            if let Err(err) = writeln!(log, "{line}") {
                warn!(tool = %self.spec.name, "failed to write log: {err}");
            }
        }
    }

    fn spawn(&mut self, input: PathBuf) {
        let output = if self.spec.is_per_file() {
            let dir = self.spec.per_file_dir(self.layout);
            if let Err(err) = fs::create_dir_all(&dir) {
                warn!(tool = %self.spec.name, "failed to create {}: {err}", dir.display());
            }
            self.note(format_args!("==> {} <==", input.display()));
            self.spec.per_file_output(self.layout, &input)
        } else {
            self.spec.output_path(self.layout)
        };

        let bindings = Bindings {
            input: &input,
            target: self.layout.target(),
            output: &output,
            case: self.layout.case(),
            script: self.spec.script.as_deref(),
        };
        let args = self.spec.render_args(&bindings);
        let command_line = std::iter::once(self.spec.program.as_os_str())
            .chain(args.iter().map(|a| a.as_os_str()))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(tool = %self.spec.name, attempt = self.run.attempt, "launching: {command_line}");
        self.note(format_args!("$ {command_line}"));

        let spawned = self.redirect_target().and_then(|(stdout, stderr)| {
            let mut command = Command::new(&self.spec.program);
            command
                .args(&args)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr);
            own_process_group(&mut command);
            command.spawn()
        });

        match spawned {
            Ok(child) => {
                self.run.pid = Some(child.id());
                self.run.invocations += 1;
                self.current = Some(Invocation {
                    child,
                    input,
                    deadline: self.spec.timeout.map(|t| Instant::now() + t),
                });
            }
            Err(err) => self.record_spawn_error(&err),
        }
    }

    fn redirect_target(&self) -> io::Result<(Stdio, Stdio)> {
        let log = self
            .log
            .as_ref()
            .ok_or_else(|| io::Error::other("log file is not open"))?;
        Ok((Stdio::from(log.try_clone()?), Stdio::from(log.try_clone()?)))
    }

    /// The executable itself is unusable, so the rest of a batch is skipped.
    fn record_spawn_error(&mut self, err: &io::Error) {
        self.pending.clear();
        let (code, failure, message) = if err.raw_os_error() == Some(EXEC_FORMAT_ERROR) {
            (
                EXIT_SPAWN_FAILED,
                FailureKind::Incompatible,
                format!(
                    "{} is not built for this host architecture",
                    self.spec.program.display()
                ),
            )
        } else if err.kind() == io::ErrorKind::NotFound {
            (EXIT_NOT_FOUND, FailureKind::NotFound, format!("not found: {err}"))
        } else {
            (EXIT_SPAWN_FAILED, FailureKind::Spawn, format!("failed to start: {err}"))
        };
        warn!(tool = %self.spec.name, "{message}");
        self.note(format_args!("# {message}"));
        self.close(RunStatus::Failed, Some(code), Some(failure));
    }

    fn record_exit(&mut self, input: &Path, status: ExitStatus) {
        let code = status.code().unwrap_or(EXIT_KILLED);
        debug!(tool = %self.spec.name, input = %input.display(), code, "invocation exited");
        if code != 0 {
            self.outcome.first_failure.get_or_insert(code);
        }
        if self.spec.is_per_file() {
            self.note(format_args!("# {} exited with code {code}", input.display()));
        }
    }

    fn kill_current(&mut self, reason: &str) {
        let Some(mut invocation) = self.current.take() else {
            return;
        };
        if let Err(err) = signal_group(&mut invocation.child) {
            debug!(tool = %self.spec.name, "kill failed: {err}");
        }
        if let Err(err) = invocation.child.wait() {
            debug!(tool = %self.spec.name, "reap failed: {err}");
        }
        warn!(tool = %self.spec.name, input = %invocation.input.display(), "{reason}");
        self.note(format_args!("# {}: {reason}", invocation.input.display()));
    }

    fn finalize(&mut self) {
        let (status, code, failure) = if self.outcome.timed_out {
            (RunStatus::TimedOut, Some(EXIT_KILLED), Some(FailureKind::Timeout))
        } else if let Some(code) = self.outcome.first_failure {
            (RunStatus::Failed, Some(code), Some(FailureKind::ExitCode))
        } else {
            (RunStatus::Succeeded, Some(0), None)
        };
        self.close(status, code, failure);
    }

    fn close(&mut self, status: RunStatus, code: Option<i32>, failure: Option<FailureKind>) {
        self.run.elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.run.finish(status, code, failure);
        self.note(format_args!(
            "# {} attempt {} finished: {} (exit {}) after {}ms",
            self.spec.name,
            self.run.attempt,
            status,
            code.map_or_else(|| "-".to_owned(), |c| c.to_string()),
            self.run.elapsed_ms
        ));
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if let Some(mut invocation) = self.current.take() {
            let _ = signal_group(&mut invocation.child);
            let _ = invocation.child.wait();
        }
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// SIGKILL every process in the child's group. The group outlives its
/// leader while any member is alive; an empty group is not an error.
#[cfg(unix)]
fn signal_group(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).map_err(io::Error::other)?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            let _ = child.kill();
            Err(io::Error::from(err))
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child) -> io::Result<()> {
    match child.try_wait()? {
        Some(_) => Ok(()),
        None => child.kill(),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
