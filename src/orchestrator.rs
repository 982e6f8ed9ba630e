use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::id::generate_id;
use crate::layout::CaseLayout;
use crate::models::{FailureKind, RunResult, RunStatus, ToolRun, ToolSpec};
use crate::runner::{Attempt, ToolRunner};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Shared flag that asks a running orchestration to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub retry_failed: bool,
    pub poll_interval: Duration,
    pub cancel: CancelFlag,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry_failed: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel: CancelFlag::default(),
        }
    }
}

/// Emitted once per attempt, as soon as it reaches a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub tool: String,
    pub attempt: u32,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub elapsed: Duration,
    /// True only when this attempt failed and the retry wave will rerun it.
    pub retry_pending: bool,
}

impl From<&ToolRun> for StatusEvent {
    fn from(run: &ToolRun) -> Self {
        Self {
            tool: run.tool.clone(),
            attempt: run.attempt,
            status: run.status,
            exit_code: run.exit_code,
            failure: run.failure,
            elapsed: Duration::from_millis(run.elapsed_ms),
            retry_pending: false,
        }
    }
}

pub trait StatusSink {
    fn on_status(&mut self, event: &StatusEvent);
}

impl<F: FnMut(&StatusEvent)> StatusSink for F {
    fn on_status(&mut self, event: &StatusEvent) {
        self(event);
    }
}

/// Runs every enabled tool against one case and collects the attempts.
pub struct Orchestrator<'a> {
    layout: &'a CaseLayout,
    options: RunOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(layout: &'a CaseLayout, options: RunOptions) -> Self {
        Self { layout, options }
    }

    /// Start every tool at once, wait for all of them, then issue one retry
    /// wave for failed or timed out tools when asked to.
    pub fn run(&self, specs: &[ToolSpec], sink: &mut dyn StatusSink) -> Result<RunResult> {
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                bail!("Tool configured twice: {}", spec.name);
            }
        }
        self.layout.ensure_dirs()?;

        let mut result = RunResult::new(generate_id());
        let runners: Vec<ToolRunner<'_>> = specs
            .iter()
            .map(|spec| ToolRunner::new(spec, self.layout))
            .collect();

        info!(run_id = %result.run_id, tools = runners.len(), case = self.layout.case(), "starting tools");
        let first_wave = runners.iter().map(ToolRunner::start).collect();
        for run in self.drive(first_wave, self.options.retry_failed, sink) {
            result.record(run);
        }

        if self.options.retry_failed && !self.options.cancel.is_cancelled() {
            let retries: Vec<Attempt<'_>> = runners
                .iter()
                .filter_map(|runner| {
                    let prior = result.final_run(runner.name())?;
                    runner.retry(prior).ok()
                })
                .collect();
            if !retries.is_empty() {
                info!(run_id = %result.run_id, tools = retries.len(), "retrying failed tools");
                for run in self.drive(retries, false, sink) {
                    result.record(run);
                }
            }
        }

        Ok(result)
    }

    /// Poll every attempt until all are terminal, reporting each as it ends.
    /// `retry_follows` says whether a retry wave comes after this one.
    fn drive(
        &self,
        mut active: Vec<Attempt<'_>>,
        retry_follows: bool,
        sink: &mut dyn StatusSink,
    ) -> Vec<ToolRun> {
        let mut done = Vec::with_capacity(active.len());

        while !active.is_empty() {
            if self.options.cancel.is_cancelled() {
                for mut attempt in active.drain(..) {
                    attempt.abort();
                    let run = attempt.finish();
                    sink.on_status(&StatusEvent::from(&run));
                    done.push(run);
                }
                break;
            }

            let mut i = 0;
            while i < active.len() {
                if active[i].poll() {
                    let run = active.swap_remove(i).finish();
                    debug!(tool = %run.tool, attempt = run.attempt, status = %run.status, "attempt finished");
                    let mut event = StatusEvent::from(&run);
                    event.retry_pending = retry_follows
                        && run.status.is_retryable()
                        && !self.options.cancel.is_cancelled();
                    sink.on_status(&event);
                    done.push(run);
                } else {
                    i += 1;
                }
            }

            if !active.is_empty() {
                thread::sleep(self.options.poll_interval);
            }
        }

        done
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Case {
        _dir: TempDir,
        scripts: PathBuf,
        layout: CaseLayout,
    }

    #[fixture]
    fn case() -> Case {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("DC01");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("Security.evtx"), b"evtx").unwrap();
        let scripts = dir.path().join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        let layout = CaseLayout::new(&target).unwrap();
        Case {
            _dir: dir,
            scripts,
            layout,
        }
    }

    fn tool(case: &Case, name: &str, body: &str) -> ToolSpec {
        let script = case.scripts.join(format!("{name}.sh"));
        fs::write(&script, body).unwrap();
        ToolSpec::new(name, "/bin/sh")
            .with_args([script.to_string_lossy().into_owned(), "{output}".into()])
            .with_output(format!("{{case}}_{name}.out"))
    }

    fn options(retry_failed: bool) -> RunOptions {
        RunOptions {
            retry_failed,
            poll_interval: Duration::from_millis(20),
            cancel: CancelFlag::default(),
        }
    }

    // Every enabled tool gets exactly one attempt and one status event.
    #[rstest]
    fn runs_each_tool_once(case: Case) {
        let specs = vec![
            tool(&case, "a", "echo a > \"$1\"\n"),
            tool(&case, "b", "echo b > \"$1\"\n"),
            tool(&case, "c", "echo c > \"$1\"\n"),
        ];
        let mut events = Vec::new();
        let result = Orchestrator::new(&case.layout, options(false))
            .run(&specs, &mut |e: &StatusEvent| events.push(e.clone()))
            .unwrap();

        assert_eq!(result.tool_count(), 3);
        assert!(result.overall_success());
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.status == RunStatus::Succeeded));
    }

    // A failing tool never stops its siblings, and tools run side by side.
    #[rstest]
    fn failures_are_isolated_and_concurrent(case: Case) {
        let specs = vec![
            tool(&case, "slow1", "sleep 1; echo x > \"$1\"\n"),
            tool(&case, "slow2", "sleep 1; echo x > \"$1\"\n"),
            tool(&case, "broken", "exit 2\n"),
        ];
        let started = Instant::now();
        let result = Orchestrator::new(&case.layout, options(false))
            .run(&specs, &mut |_: &StatusEvent| {})
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(1900));
        assert!(!result.overall_success());
        assert_eq!(result.status_of("slow1"), Some(RunStatus::Succeeded));
        assert_eq!(result.status_of("broken"), Some(RunStatus::Failed));
        assert_eq!(result.attempts("broken").len(), 1);
    }

    // The retry wave reruns only failed tools, once each.
    #[rstest]
    fn retry_wave_targets_failures_only(case: Case) {
        let specs = vec![
            tool(&case, "good", "echo ok > \"$1\"\n"),
            tool(&case, "bad", "exit 1\n"),
        ];
        let mut events = Vec::new();
        let result = Orchestrator::new(&case.layout, options(true))
            .run(&specs, &mut |e: &StatusEvent| events.push((e.tool.clone(), e.attempt)))
            .unwrap();

        assert_eq!(result.attempts("good").len(), 1);
        let bad: Vec<u32> = result.attempts("bad").iter().map(|r| r.attempt).collect();
        assert_eq!(bad, vec![1, 2]);
        assert!(!result.overall_success());
        assert_eq!(events.last(), Some(&("bad".to_owned(), 2)));
    }

    // Only a failure that the retry wave will pick up is announced as pending.
    #[rstest]
    #[case::retrying(true, vec![("bad".to_owned(), 1, true), ("bad".to_owned(), 2, false)])]
    #[case::not_retrying(false, vec![("bad".to_owned(), 1, false)])]
    fn retry_pending_only_when_a_retry_follows(
        case: Case,
        #[case] retry_failed: bool,
        #[case] expected: Vec<(String, u32, bool)>,
    ) {
        let specs = vec![tool(&case, "bad", "exit 4\n")];
        let mut events = Vec::new();
        Orchestrator::new(&case.layout, options(retry_failed))
            .run(&specs, &mut |e: &StatusEvent| {
                events.push((e.tool.clone(), e.attempt, e.retry_pending));
            })
            .unwrap();

        assert_eq!(events, expected);
    }

    #[rstest]
    fn duplicate_tool_names_are_rejected(case: Case) {
        let specs = vec![tool(&case, "dup", "exit 0\n"), tool(&case, "dup", "exit 0\n")];
        let err = Orchestrator::new(&case.layout, options(false))
            .run(&specs, &mut |_: &StatusEvent| {})
            .unwrap_err();
        assert!(err.to_string().contains("dup"));
    }

    // Cancellation kills running children and leaves nothing Running.
    #[rstest]
    fn cancellation_interrupts_running_tools(case: Case) {
        let specs = vec![tool(&case, "hang", "sleep 10\n")];
        let opts = options(true);
        let cancel = opts.cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });

        let started = Instant::now();
        let result = Orchestrator::new(&case.layout, opts)
            .run(&specs, &mut |_: &StatusEvent| {})
            .unwrap();
        canceller.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        let run = result.final_run("hang").unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(result.attempts("hang").len(), 1);
    }
}
