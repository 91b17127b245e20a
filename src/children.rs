//! subprocesses observed by polling

use anyhow::Context;
use std::{
    ffi::{OsStr, OsString},
    io::{self, Read},
    os::unix::process::ExitStatusExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::error::Error;

/// Output stream of a child process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives output chunks of a single process as they are collected.
pub type OutputCallback = Box<dyn FnMut(Stream, &[u8])>;

/// An external process the pool observes without ever blocking on it.
pub trait Process {
    /// Human-readable command line, also used to identify the process.
    fn command_line(&self) -> &str;

    /// Starts the process with `env` added to its environment.
    fn start(&mut self, output: Option<OutputCallback>, env: &[(String, String)]) -> anyhow::Result<()>;

    /// OS process identifier, `None` when the process is not running.
    fn pid(&mut self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Returns whether the process has exceeded its deadline.
    ///
    /// Implementations may terminate the process as a side effect.
    fn check_timeout(&mut self) -> bool;

    /// Exit code once the process is known to have exited.
    fn exit_code(&self) -> Option<i32>;

    fn stdout(&self) -> String;

    fn stderr(&self) -> String;
}

type Chunk = (Stream, Vec<u8>);

/// How long output pipes are still read after the child exited past its deadline.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A real OS child process with piped and captured stdout/stderr.
///
/// Each output pipe is drained by a reader thread into a channel. Chunks are
/// only moved into the buffers (and handed to the output callback) when the
/// process is polled, so all observation happens on the polling thread. The
/// process counts as running until it has exited and both pipes hit EOF.
///
/// `check_timeout()` kills the child once its deadline has passed.
pub struct ChildProcess {
    program: OsString,
    args: Vec<OsString>,
    command_line: String,
    timeout: Option<Duration>,
    child: Option<Child>,
    started_at: Option<Instant>,
    exit_code: Option<i32>,
    exited_at: Option<Instant>,
    chunks: Option<Receiver<Chunk>>,
    output: Option<OutputCallback>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

impl ChildProcess {
    /// Creates a not yet started process running `program` with `args`.
    pub fn new<I>(program: &OsStr, args: I, timeout: Option<Duration>) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command_line = shell_words::join(
            std::iter::once(program.to_string_lossy()).chain(args.iter().map(|a| a.to_string_lossy())),
        );
        Self {
            program: program.to_owned(),
            args,
            command_line,
            timeout,
            child: None,
            started_at: None,
            exit_code: None,
            exited_at: None,
            chunks: None,
            output: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            timed_out: false,
        }
    }

    /// Moves every chunk received so far into the buffers.
    fn pump(&mut self) {
        loop {
            let next = match &self.chunks {
                Some(rx) => rx.try_recv(),
                None => return,
            };
            match next {
                Ok((stream, data)) => {
                    match stream {
                        Stream::Stdout => self.stdout.extend_from_slice(&data),
                        Stream::Stderr => self.stderr.extend_from_slice(&data),
                    }
                    if let Some(output) = self.output.as_mut() {
                        output(stream, &data);
                    }
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.chunks = None;
                    return;
                }
            }
        }
    }

    /// Records the exit code if the child has exited.
    fn reap(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return,
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                debug!(pid = child.id(), code, "child exited");
                self.exit_code = Some(code);
                self.exited_at = Some(Instant::now());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(pid = child.id(), error = %e, "cannot query child status, treating it as failed");
                self.exit_code = Some(1);
                self.exited_at = Some(Instant::now());
            }
        }
    }
}

impl Process for ChildProcess {
    fn command_line(&self) -> &str {
        &self.command_line
    }

    fn start(&mut self, output: Option<OutputCallback>, env: &[(String, String)]) -> anyhow::Result<()> {
        if self.child.is_some() {
            anyhow::bail!("process already started: {}", self.command_line);
        }
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            command.env(key, value);
        }
        let child = command.spawn().map_err(|source| Error::Spawn {
            command: self.command_line.clone(),
            source,
        })?;
        debug!(pid = child.id(), command = %self.command_line, "spawned child");
        self.started_at = Some(Instant::now());
        self.output = output;
        let child = self.child.insert(child);

        let (tx, rx) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            spawn_reader(out, Stream::Stdout, tx.clone())?;
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, Stream::Stderr, tx)?;
        }
        self.chunks = Some(rx);
        Ok(())
    }

    fn pid(&mut self) -> Option<u32> {
        if self.is_running() {
            self.child.as_ref().map(Child::id)
        } else {
            None
        }
    }

    fn is_running(&mut self) -> bool {
        if self.child.is_none() {
            return false;
        }
        self.reap();
        self.pump();
        !(self.exit_code.is_some() && self.chunks.is_none())
    }

    fn check_timeout(&mut self) -> bool {
        let (timeout, started_at) = match (self.timeout, self.started_at) {
            (Some(timeout), Some(started_at)) => (timeout, started_at),
            _ => return false,
        };
        if started_at.elapsed() <= timeout {
            return false;
        }
        // An exit seen only now may still have happened in time.
        self.reap();
        if !self.timed_out && self.exit_code.is_none() {
            self.timed_out = true;
            if let Some(child) = self.child.as_mut() {
                debug!(pid = child.id(), ?timeout, "killing child past its deadline");
                if let Err(e) = child.kill() {
                    debug!(pid = child.id(), error = %e, "kill failed");
                }
            }
        }
        // Descendants may keep the pipes open after the child itself is gone.
        if self.exited_at.map_or(false, |at| at.elapsed() > DRAIN_GRACE) {
            self.pump();
            if self.chunks.take().is_some() {
                debug!(command = %self.command_line, "abandoning output pipes held by descendants");
            }
        }
        self.timed_out
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Forwards everything read from `source` to `tx` until EOF.
fn spawn_reader<R>(mut source: R, stream: Stream, tx: Sender<Chunk>) -> anyhow::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("rsfanout-{:?}", stream).to_lowercase())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send((stream, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
        .context("Can not start output reader thread")?;
    Ok(())
}

/// Shell-style exit code: the status code, or 128 + signal number.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn sh(script: &str, timeout: Option<Duration>) -> ChildProcess {
        ChildProcess::new(OsStr::new("/bin/sh"), &["-c", script], timeout)
    }

    /// Polls `p` until it stops running.
    fn poll_to_end(p: &mut ChildProcess) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while p.is_running() {
            assert!(Instant::now() < deadline, "child did not finish: {}", p.command_line());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn command_line_is_shell_quoted() {
        let p = sh("echo 'a b'", None);
        assert_eq!(p.command_line(), r#"/bin/sh -c 'echo '\''a b'\'''"#);
    }

    #[test]
    fn not_running_before_start() {
        let mut p = sh("true", None);
        assert!(!p.is_running());
        assert_eq!(p.pid(), None);
        assert_eq!(p.exit_code(), None);
        assert!(!p.check_timeout());
    }

    #[test]
    fn captures_output_and_exit_code() -> anyhow::Result<()> {
        let mut p = sh("echo out; echo err >&2; exit 3", None);
        p.start(None, &[])?;
        poll_to_end(&mut p);
        assert_eq!(p.exit_code(), Some(3));
        assert_eq!(p.stdout(), "out\n");
        assert_eq!(p.stderr(), "err\n");
        Ok(())
    }

    #[test]
    fn large_output_does_not_block_child() -> anyhow::Result<()> {
        let mut p = sh("head -c 300000 /dev/zero", None);
        p.start(None, &[])?;
        poll_to_end(&mut p);
        assert_eq!(p.exit_code(), Some(0));
        assert_eq!(p.stdout().len(), 300000);
        Ok(())
    }

    #[test]
    fn output_callback_receives_chunks() -> anyhow::Result<()> {
        let seen = Rc::new(RefCell::new(Vec::<(Stream, Vec<u8>)>::new()));
        let sink = Rc::clone(&seen);
        let mut p = sh("printf hello; printf oops >&2", None);
        p.start(Some(Box::new(move |stream: Stream, data: &[u8]| sink.borrow_mut().push((stream, data.to_vec())))), &[])?;
        poll_to_end(&mut p);
        let seen = seen.borrow();
        let joined = |wanted: Stream| -> Vec<u8> {
            seen.iter().filter(|(s, _)| *s == wanted).flat_map(|(_, d)| d.clone()).collect()
        };
        assert_eq!(joined(Stream::Stdout), b"hello");
        assert_eq!(joined(Stream::Stderr), b"oops");
        Ok(())
    }

    #[test]
    fn env_overrides_reach_child() -> anyhow::Result<()> {
        let mut p = sh("printf %s \"$RSFANOUT_TEST_VALUE\"", None);
        p.start(None, &[("RSFANOUT_TEST_VALUE".to_owned(), "42".to_owned())])?;
        poll_to_end(&mut p);
        assert_eq!(p.stdout(), "42");
        Ok(())
    }

    #[test]
    fn check_timeout_kills_child_past_deadline() -> anyhow::Result<()> {
        let mut p = sh("exec sleep 30", Some(Duration::from_millis(50)));
        p.start(None, &[])?;
        assert!(p.pid().is_some());
        let deadline = Instant::now() + Duration::from_secs(10);
        while !p.check_timeout() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
        poll_to_end(&mut p);
        assert_eq!(p.exit_code(), Some(128 + libc::SIGKILL));
        assert!(p.check_timeout());
        Ok(())
    }

    #[test]
    fn exit_seen_after_deadline_is_not_a_timeout() -> anyhow::Result<()> {
        let mut p = sh("printf done", Some(Duration::from_millis(200)));
        p.start(None, &[])?;
        thread::sleep(Duration::from_millis(600));
        assert!(!p.check_timeout());
        poll_to_end(&mut p);
        assert!(!p.check_timeout());
        assert_eq!(p.exit_code(), Some(0));
        assert_eq!(p.stdout(), "done");
        Ok(())
    }

    #[test]
    fn descendant_holding_pipes_does_not_keep_child_running() -> anyhow::Result<()> {
        let mut p = sh("sleep 10 & echo started", Some(Duration::from_secs(1)));
        p.start(None, &[])?;
        let deadline = Instant::now() + Duration::from_secs(8);
        loop {
            assert!(!p.check_timeout());
            if !p.is_running() {
                break;
            }
            assert!(Instant::now() < deadline, "child kept running on inherited pipes");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(p.exit_code(), Some(0));
        assert_eq!(p.stdout(), "started\n");
        Ok(())
    }

    #[test]
    fn starting_twice_fails() -> anyhow::Result<()> {
        let mut p = sh("true", None);
        p.start(None, &[])?;
        assert!(p.start(None, &[]).is_err());
        poll_to_end(&mut p);
        Ok(())
    }

    #[test]
    fn spawn_failure_names_command() {
        let mut p = ChildProcess::new(OsStr::new("/nonexistent/rsfanout-test"), &["x"], None);
        let err = p.start(None, &[]).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::Spawn { command, .. }) => assert_eq!(command, "/nonexistent/rsfanout-test x"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
