//! Runs every work item in its own re-executed child and judges the results.

use std::{
    collections::{HashMap, HashSet},
    ffi::OsStr,
    fmt::Write as _,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    children::{ChildProcess, Process},
    command::{ChildTemplate, Invocation},
    config::BatchConfig,
    error::Error,
    output::Sink,
    pool::{Lifecycle, Pool},
};

/// Environment variable holding the work item of a child.
pub const WORK_ITEM_ENV: &str = "RSFANOUT_WORK_ITEM";

const RULE_WIDTH: usize = 72;

/// Turns invocations into processes ready to be started.
pub trait Launcher {
    type Process: Process;

    fn prepare(&mut self, invocation: &Invocation, timeout: Duration) -> Self::Process;
}

/// Launches invocations as real OS processes.
pub struct ReExec;

impl Launcher for ReExec {
    type Process = ChildProcess;

    fn prepare(&mut self, invocation: &Invocation, timeout: Duration) -> ChildProcess {
        ChildProcess::new(OsStr::new(&invocation.program), &invocation.args, Some(timeout))
    }
}

/// What is known about the child running one work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcDescriptor {
    pub command_line: String,
    pub work_item_id: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub reached_timeout: bool,
    pub time_start: Option<Instant>,
    pub time_end: Option<Instant>,
}

impl ProcDescriptor {
    fn new(work_item_id: &str, command_line: &str) -> Self {
        Self {
            command_line: command_line.to_owned(),
            work_item_id: work_item_id.to_owned(),
            exit_code: None,
            stdout: None,
            stderr: None,
            reached_timeout: false,
            time_start: None,
            time_end: None,
        }
    }

    fn has_stderr(&self) -> bool {
        self.stderr.as_deref().map_or(false, |s| !s.is_empty())
    }

    /// Timed out, or failed and said something about it.
    pub fn is_error(&self) -> bool {
        self.reached_timeout || (self.exit_code.map_or(false, |c| c > 0) && self.has_stderr())
    }

    /// Succeeded but wrote diagnostics.
    pub fn is_warning(&self) -> bool {
        self.exit_code == Some(0) && self.has_stderr()
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.time_start, self.time_end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

/// Fills descriptors from pool callbacks.
struct Tracker<'s, S> {
    descriptors: Vec<ProcDescriptor>,
    by_command: HashMap<String, usize>,
    sink: &'s mut S,
}

impl<'s, S: Sink> Tracker<'s, S> {
    fn new(sink: &'s mut S) -> Self {
        Self {
            descriptors: Vec::new(),
            by_command: HashMap::new(),
            sink,
        }
    }

    fn register(&mut self, work_item: &str, command_line: &str) {
        self.by_command.insert(command_line.to_owned(), self.descriptors.len());
        self.descriptors.push(ProcDescriptor::new(work_item, command_line));
    }

    fn descriptor<P: Process>(&mut self, process: &P) -> anyhow::Result<&mut ProcDescriptor> {
        let index = *self
            .by_command
            .get(process.command_line())
            .ok_or_else(|| Error::UnknownProcess(process.command_line().to_owned()))?;
        Ok(&mut self.descriptors[index])
    }
}

impl<P: Process, S: Sink> Lifecycle<P> for Tracker<'_, S> {
    fn on_start(&mut self, process: &P) -> anyhow::Result<()> {
        self.descriptor(process)?.time_start = Some(Instant::now());
        Ok(())
    }

    fn on_finish(&mut self, process: &P) -> anyhow::Result<()> {
        let descriptor = self.descriptor(process)?;
        descriptor.time_end = Some(Instant::now());
        descriptor.exit_code = process.exit_code();
        descriptor.stdout = Some(process.stdout());
        descriptor.stderr = Some(process.stderr());
        if descriptor.exit_code != Some(0) || descriptor.has_stderr() {
            debug!(
                item = %descriptor.work_item_id,
                code = ?descriptor.exit_code,
                stderr_bytes = descriptor.stderr.as_ref().map_or(0, String::len),
                "child needs review"
            );
        }
        debug!(item = %descriptor.work_item_id, elapsed = ?descriptor.duration(), "child finished");
        self.sink.progress_advance(1)?;
        Ok(())
    }

    fn on_timeout(&mut self, process: &P) -> anyhow::Result<()> {
        let descriptor = self.descriptor(process)?;
        if !descriptor.reached_timeout {
            warn!(item = %descriptor.work_item_id, "child reached its timeout");
        }
        descriptor.reached_timeout = true;
        Ok(())
    }
}

/// Fans work items out to children and turns their results into a verdict.
pub struct Batch<L, S> {
    config: BatchConfig,
    template: ChildTemplate,
    launcher: L,
    sink: S,
}

impl<L: Launcher, S: Sink> Batch<L, S> {
    pub fn new(config: BatchConfig, template: ChildTemplate, launcher: L, sink: S) -> Self {
        Self {
            config,
            template,
            launcher,
            sink,
        }
    }

    #[cfg(test)]
    fn into_sink(self) -> S {
        self.sink
    }

    /// Runs all `work_items` and fails if any child timed out or failed.
    ///
    /// Children that succeeded with diagnostics are reported as warnings.
    pub fn run<I>(&mut self, work_items: I) -> anyhow::Result<Vec<ProcDescriptor>>
    where
        I: IntoIterator<Item = String>,
    {
        let descriptors = self.execute(work_items)?;

        let errors: Vec<&ProcDescriptor> = descriptors.iter().filter(|d| d.is_error()).collect();
        if !errors.is_empty() {
            return Err(Error::BatchFailed {
                failed: errors.len(),
                total: descriptors.len(),
                report: error_report(&errors, self.config.timeout),
            }
            .into());
        }

        for descriptor in &descriptors {
            if descriptor.is_warning() {
                let message = format!(
                    "{}\n{}",
                    descriptor.command_line,
                    descriptor.stderr.as_deref().unwrap_or_default().trim_end()
                );
                self.sink.warning(&message)?;
            } else if descriptor.exit_code.map_or(false, |c| c > 0) {
                warn!(
                    item = %descriptor.work_item_id,
                    code = ?descriptor.exit_code,
                    "child failed without diagnostics"
                );
            }
        }
        Ok(descriptors)
    }

    /// Runs every distinct, non-empty work item to completion.
    fn execute<I>(&mut self, work_items: I) -> anyhow::Result<Vec<ProcDescriptor>>
    where
        I: IntoIterator<Item = String>,
    {
        for warning in &self.config.warnings {
            self.sink.warning(warning)?;
        }

        let mut seen = HashSet::new();
        let items: Vec<String> = work_items
            .into_iter()
            .filter(|item| !item.is_empty() && seen.insert(item.clone()))
            .collect();

        let mut tracker = Tracker::new(&mut self.sink);
        let mut processes = Vec::with_capacity(items.len());
        for item in &items {
            let invocation = self.template.invocation(item);
            let process = self.launcher.prepare(&invocation, self.config.timeout);
            tracker.register(item, process.command_line());
            processes.push((item, process));
        }

        info!(
            items = items.len(),
            concurrency = self.config.pool.concurrency,
            "starting batch"
        );
        tracker.sink.progress_start(items.len())?;
        let mut pool = Pool::new(self.config.pool, tracker);
        for (item, process) in processes {
            pool.submit(process, None, vec![(WORK_ITEM_ENV.to_owned(), item.clone())])?;
        }
        pool.wait_for_all()?;

        let tracker = pool.into_hooks();
        tracker.sink.progress_finish()?;
        Ok(tracker.descriptors)
    }
}

/// Everything needed to reproduce and understand each failed child.
fn error_report(errors: &[&ProcDescriptor], timeout: Duration) -> String {
    let rule = "-".repeat(RULE_WIDTH);
    let mut report = String::new();
    for (i, descriptor) in errors.iter().enumerate() {
        if i > 0 {
            let _ = write!(report, "\n{}\n", rule);
        }
        let _ = writeln!(report, "Command: {}", descriptor.command_line);
        if descriptor.reached_timeout {
            let _ = writeln!(report, "Reached the timeout of {} seconds", timeout.as_secs());
        }
        match descriptor.exit_code {
            Some(code) => {
                let _ = writeln!(report, "Exit code: {}", code);
            }
            None => {
                let _ = writeln!(report, "Exit code: unknown");
            }
        }
        let _ = write!(
            report,
            "\nError output:\n{}\n\nOutput:\n{}\n",
            descriptor.stderr.as_deref().unwrap_or_default().trim_end(),
            descriptor.stdout.as_deref().unwrap_or_default().trim_end(),
        );
    }
    report
}
