//! Bounded pool of polled processes.
//!
//! The pool runs on a single thread. Parallelism comes from the OS running
//! several child processes at once; the pool only starts them, sleeps, and
//! looks at them again. Lifecycle callbacks therefore never overlap.

use std::{
    collections::{BTreeMap, VecDeque},
    thread,
    time::Duration,
};

use tracing::{debug, trace};

use crate::children::{OutputCallback, Process};

/// Scheduling parameters of a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of processes running at once.
    pub concurrency: usize,
    /// Pause between two observation passes.
    pub poll_interval: Duration,
    /// Pause before each process start.
    pub start_delay: Duration,
}

/// Key of a running process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessKey {
    /// OS process identifier.
    Pid(u32),
    /// Placeholder for a process without a usable identifier.
    Local(u64),
}

/// Callbacks invoked by the pool, all on the polling thread.
///
/// An error returned by any of them aborts the pool operation in progress and
/// is returned to the caller as is.
pub trait Lifecycle<P: ?Sized> {
    /// Called right before `process` is started.
    fn on_start(&mut self, _process: &P) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once `process` is known to have stopped running.
    fn on_finish(&mut self, _process: &P) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when `process` reports it exceeded its deadline.
    ///
    /// The process stays in the pool until it actually stops, at which point
    /// `on_finish` is called as usual.
    fn on_timeout(&mut self, _process: &P) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for every running process on every observation pass.
    fn on_check(&mut self, _process: &P) -> anyhow::Result<()> {
        Ok(())
    }
}

type Hook<P> = Box<dyn FnMut(&P) -> anyhow::Result<()>>;

/// [`Lifecycle`] made of optional closures.
pub struct Hooks<P> {
    pub on_start: Option<Hook<P>>,
    pub on_finish: Option<Hook<P>>,
    pub on_timeout: Option<Hook<P>>,
    pub on_check: Option<Hook<P>>,
}

impl<P> Default for Hooks<P> {
    fn default() -> Self {
        Self {
            on_start: None,
            on_finish: None,
            on_timeout: None,
            on_check: None,
        }
    }
}

fn call<P>(hook: &mut Option<Hook<P>>, process: &P) -> anyhow::Result<()> {
    match hook {
        Some(hook) => hook(process),
        None => Ok(()),
    }
}

impl<P> Lifecycle<P> for Hooks<P> {
    fn on_start(&mut self, process: &P) -> anyhow::Result<()> {
        call(&mut self.on_start, process)
    }

    fn on_finish(&mut self, process: &P) -> anyhow::Result<()> {
        call(&mut self.on_finish, process)
    }

    fn on_timeout(&mut self, process: &P) -> anyhow::Result<()> {
        call(&mut self.on_timeout, process)
    }

    fn on_check(&mut self, process: &P) -> anyhow::Result<()> {
        call(&mut self.on_check, process)
    }
}

/// A submitted process waiting for a free slot.
struct PendingEntry<P> {
    process: P,
    output: Option<OutputCallback>,
    env: Vec<(String, String)>,
}

/// Starts submitted processes, at most `concurrency` at a time, in submission
/// order, and reports their lifecycle to `L`.
pub struct Pool<P, L> {
    config: PoolConfig,
    hooks: L,
    pending: VecDeque<PendingEntry<P>>,
    running: BTreeMap<ProcessKey, P>,
    next_local: u64,
}

impl<P: Process, L: Lifecycle<P>> Pool<P, L> {
    pub fn new(config: PoolConfig, hooks: L) -> Self {
        debug_assert!(config.concurrency > 0);
        Self {
            config: PoolConfig {
                concurrency: config.concurrency.max(1),
                ..config
            },
            hooks,
            pending: VecDeque::new(),
            running: BTreeMap::new(),
            next_local: 0,
        }
    }

    /// Queues `process`, then starts whatever fits and looks at running processes.
    ///
    /// `output` receives the process output as it is collected. `env` is added
    /// to the process environment.
    pub fn submit(
        &mut self,
        process: P,
        output: Option<OutputCallback>,
        env: Vec<(String, String)>,
    ) -> anyhow::Result<()> {
        self.pending.push_back(PendingEntry { process, output, env });
        self.dispatch()?;
        self.check_running()
    }

    /// Polls until no process is pending or running.
    ///
    /// Free slots are filled on every pass, so a dispatch cut short by an
    /// error resumes on the next call.
    pub fn wait_for_all(&mut self) -> anyhow::Result<()> {
        while self.has_unfinished() {
            thread::sleep(self.config.poll_interval);
            self.dispatch()?;
            self.check_running()?;
        }
        Ok(())
    }

    pub fn has_unfinished(&self) -> bool {
        !self.pending.is_empty() || !self.running.is_empty()
    }

    /// Changes the concurrency limit and fills any slot it frees.
    pub fn set_concurrency(&mut self, concurrency: usize) -> anyhow::Result<()> {
        self.config.concurrency = concurrency.max(1);
        self.dispatch()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Consumes the pool and returns its callbacks.
    pub fn into_hooks(self) -> L {
        self.hooks
    }

    /// Starts pending processes while there are free slots.
    fn dispatch(&mut self) -> anyhow::Result<()> {
        while self.running.len() < self.config.concurrency && !self.pending.is_empty() {
            thread::sleep(self.config.start_delay);
            let PendingEntry { mut process, output, env } = match self.pending.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.hooks.on_start(&process)?;
            process.start(output, &env)?;
            let key = match process.pid() {
                // A reaped child can keep its slot while its output drains,
                // and the OS may hand its pid to the next one.
                Some(pid) if !self.running.contains_key(&ProcessKey::Pid(pid)) => ProcessKey::Pid(pid),
                Some(_) => self.local_key(),
                None => {
                    // Finished before its pid could be read.
                    if observe(&mut self.hooks, &mut process)? {
                        continue;
                    }
                    self.local_key()
                }
            };
            debug!(?key, command = process.command_line(), "dispatched");
            self.running.insert(key, process);
        }
        Ok(())
    }

    fn local_key(&mut self) -> ProcessKey {
        self.next_local += 1;
        ProcessKey::Local(self.next_local)
    }

    /// Looks at every running process once, refilling slots as they free up.
    fn check_running(&mut self) -> anyhow::Result<()> {
        let keys: Vec<ProcessKey> = self.running.keys().copied().collect();
        for key in keys {
            let process = match self.running.get_mut(&key) {
                Some(process) => process,
                None => continue,
            };
            if observe(&mut self.hooks, process)? {
                self.running.remove(&key);
                self.dispatch()?;
            }
        }
        Ok(())
    }
}

/// Runs the check, timeout and finish callbacks for `process`.
///
/// Returns whether the process has finished.
fn observe<P, L>(hooks: &mut L, process: &mut P) -> anyhow::Result<bool>
where
    P: Process,
    L: Lifecycle<P>,
{
    trace!(command = process.command_line(), "check");
    hooks.on_check(process)?;
    if process.check_timeout() {
        debug!(command = process.command_line(), "timeout reached");
        hooks.on_timeout(process)?;
    }
    if process.is_running() {
        return Ok(false);
    }
    debug!(command = process.command_line(), code = ?process.exit_code(), "finished");
    hooks.on_finish(process)?;
    Ok(true)
}
