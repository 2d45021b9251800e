//! Subprocess Stream - feeds a payload to a child while draining its output
//!
//! The child runs through `/bin/sh -c` with three pipes. A single `poll(2)`
//! loop watches stdout/stderr (always) and stdin (only while payload remains),
//! with a short timeout so liveness is rechecked even when nothing is ready.
//!
//! Priorities inside the loop:
//!   1. drain any available output before anything else
//!   2. check for exit only when no output was read
//!   3. hand control back for the next payload chunk when stdin is writable

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use swu_common::config::HandlerConfig;
use swu_common::error::IoContext;
use swu_common::{ExitOutcome, SwuError, SwuResult};
use tracing::{debug, error, trace, Level};

use crate::line_router::{LineRouter, LogSink, TracingSink};

/// Payload read size per copy step
const COPY_CHUNK: usize = 16 * 1024;

/// Cap on output collected after exit, for grandchildren that keep pipes open
const MAX_FINAL_DRAIN: usize = 64 * 1024;

/// Tuning for one subprocess run
#[derive(Clone)]
pub struct StreamOptions {
    pub poll_interval: Duration,
    pub line_buffer_size: usize,
    pub sink: Arc<dyn LogSink>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&HandlerConfig::default())
    }
}

impl From<&HandlerConfig> for StreamOptions {
    fn from(config: &HandlerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            line_buffer_size: config.line_buffer_size,
            sink: Arc::new(TracingSink),
        }
    }
}

impl StreamOptions {
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// What a polling step ended on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// stdin can take the next chunk
    Writable,
    /// The child is gone
    Exited(ExitOutcome),
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
    Stdin,
}

/// One spawned command with its three pipe endpoints
pub struct ChildProcess {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_router: LineRouter,
    stderr_router: LineRouter,
    outcome: Option<ExitOutcome>,
    poll_interval: Duration,
    finished: bool,
}

impl ChildProcess {
    /// Spawn `command` through the shell. If the command cannot be executed
    /// the shell exits non-zero and that is seen by the normal exit path.
    pub fn spawn(command: &str, options: &StreamOptions) -> SwuResult<Self> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .io_context(format!("Could not spawn {}", command))?;

        let (stdin, stdout, stderr) = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        if let Some(stdin) = &stdin {
            set_nonblocking(stdin.as_raw_fd()).io_context("Could not set stdin non-blocking")?;
        }

        debug!("Spawned pid {} for {}", child.id(), command);

        Ok(Self {
            command: command.to_string(),
            child,
            stdin,
            stdout,
            stderr,
            stdout_router: LineRouter::new(options.line_buffer_size, Level::TRACE, options.sink.clone()),
            stderr_router: LineRouter::new(options.line_buffer_size, Level::ERROR, options.sink.clone()),
            outcome: None,
            poll_interval: options.poll_interval,
            finished: false,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    /// Run the polling loop until the child exits or, with `want_write`,
    /// until stdin is writable.
    pub fn poll_process(&mut self, want_write: bool) -> SwuResult<PollEvent> {
        if let Some(outcome) = self.outcome {
            return Ok(PollEvent::Exited(outcome));
        }
        let want_write = want_write && self.stdin.is_some();
        let timeout_ms = i32::try_from(self.poll_interval.as_millis()).unwrap_or(i32::MAX);

        loop {
            let mut watched: Vec<(Stream, libc::pollfd)> = Vec::with_capacity(3);
            if let Some(stdout) = &self.stdout {
                watched.push((Stream::Stdout, pollfd(stdout.as_raw_fd(), libc::POLLIN)));
            }
            if let Some(stderr) = &self.stderr {
                watched.push((Stream::Stderr, pollfd(stderr.as_raw_fd(), libc::POLLIN)));
            }
            if want_write {
                if let Some(stdin) = &self.stdin {
                    watched.push((Stream::Stdin, pollfd(stdin.as_raw_fd(), libc::POLLOUT)));
                }
            }

            match poll_fds(&mut watched, timeout_ms) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poll failed: {}", e);
                    return Err(SwuError::io("poll failed", e));
                }
            }

            let mut read = 0;
            let mut writable = false;
            for (stream, fd) in &watched {
                if fd.revents == 0 {
                    continue;
                }
                match stream {
                    Stream::Stdout => read += self.drain(Stream::Stdout)?,
                    Stream::Stderr => read += self.drain(Stream::Stderr)?,
                    Stream::Stdin => writable = true,
                }
            }

            // keep reading from stdout/stderr if there was anything
            if read > 0 {
                continue;
            }

            if let Some(outcome) = self.try_reap()? {
                return Ok(PollEvent::Exited(outcome));
            }

            if writable {
                return Ok(PollEvent::Writable);
            }
        }
    }

    /// Write a whole chunk to the child's stdin, draining output in between
    pub fn write_chunk(&mut self, mut chunk: &[u8]) -> SwuResult<()> {
        while !chunk.is_empty() {
            if let PollEvent::Exited(outcome) = self.poll_process(true)? {
                return Err(self.exited_early(outcome));
            }
            let stdin = self
                .stdin
                .as_mut()
                .ok_or_else(|| SwuError::Internal("stdin already closed".to_string()))?;
            match stdin.write(chunk) {
                Ok(0) => {
                    return Err(SwuError::io(
                        "Could not write to pipe",
                        io::Error::from(io::ErrorKind::WriteZero),
                    ))
                }
                Ok(n) => chunk = &chunk[n..],
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // reader is gone: report how the child ended
                    let outcome = self.wait_exit()?;
                    return Err(self.exited_early(outcome));
                }
                Err(e) => return Err(SwuError::io("Could not write to pipe", e)),
            }
        }
        Ok(())
    }

    /// Copy the whole payload into the child. Returns the bytes copied.
    pub fn copy_from<R: Read>(&mut self, payload: &mut R) -> SwuResult<u64> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = match payload.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SwuError::io("Could not read payload", e)),
            };
            self.write_chunk(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Close stdin so the child sees end of input
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Keep draining output until the child exits
    pub fn wait_exit(&mut self) -> SwuResult<ExitOutcome> {
        match self.poll_process(false)? {
            PollEvent::Exited(outcome) => Ok(outcome),
            PollEvent::Writable => Err(SwuError::Internal(
                "poll returned writable without write interest".to_string(),
            )),
        }
    }

    /// Teardown: close every endpoint after a final drain and flush both
    /// routers. Runs once, also from `Drop`.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stdin = None;

        if let Err(e) = self.final_drain() {
            debug!("Final drain of {} stopped: {}", self.command, e);
        }
        self.stdout = None;
        self.stderr = None;
        self.stdout_router.flush();
        self.stderr_router.flush();

        if self.outcome.is_none() {
            // reap if it already exited, never block here
            let _ = self.try_reap();
        }
    }

    fn final_drain(&mut self) -> SwuResult<()> {
        let mut drained = 0;
        while drained < MAX_FINAL_DRAIN {
            let mut watched: Vec<(Stream, libc::pollfd)> = Vec::with_capacity(2);
            if let Some(stdout) = &self.stdout {
                watched.push((Stream::Stdout, pollfd(stdout.as_raw_fd(), libc::POLLIN)));
            }
            if let Some(stderr) = &self.stderr {
                watched.push((Stream::Stderr, pollfd(stderr.as_raw_fd(), libc::POLLIN)));
            }
            if watched.is_empty() {
                break;
            }
            match poll_fds(&mut watched, 0) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SwuError::io("poll failed", e)),
            }
            for (stream, fd) in &watched {
                if fd.revents != 0 {
                    drained += self.drain(*stream)?;
                }
            }
        }
        Ok(())
    }

    /// Read once from a ready stream. End of stream closes it.
    fn drain(&mut self, stream: Stream) -> SwuResult<usize> {
        let (pipe, router, name) = match stream {
            Stream::Stdout => (
                self.stdout.as_mut().map(|p| p as &mut dyn Read),
                &mut self.stdout_router,
                "stdout",
            ),
            Stream::Stderr => (
                self.stderr.as_mut().map(|p| p as &mut dyn Read),
                &mut self.stderr_router,
                "stderr",
            ),
            Stream::Stdin => return Ok(0),
        };
        let Some(mut pipe) = pipe else {
            return Ok(0);
        };

        match router.read_from(&mut pipe) {
            Ok(0) => {
                trace!("{} of {} closed", name, self.command);
                match stream {
                    Stream::Stdout => self.stdout = None,
                    _ => self.stderr = None,
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => {
                error!("Could not read {}: {}", name, e);
                Err(SwuError::io(format!("Could not read {}", name), e))
            }
        }
    }

    fn try_reap(&mut self) -> SwuResult<Option<ExitOutcome>> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let outcome = outcome_from(status);
                self.outcome = Some(outcome);
                Ok(Some(outcome))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("Could not waitpid: {}", e);
                Err(SwuError::io("Could not waitpid", e))
            }
        }
    }

    fn exited_early(&self, outcome: ExitOutcome) -> SwuError {
        if outcome.success() {
            SwuError::io(
                "Command exited before reading all input",
                io::Error::from(io::ErrorKind::BrokenPipe),
            )
        } else {
            self.failure(outcome)
        }
    }

    fn failure(&self, outcome: ExitOutcome) -> SwuError {
        match outcome {
            ExitOutcome::WaitError => {
                SwuError::Internal(format!("wait for {} returned no status", self.command))
            }
            _ => SwuError::ChildFailed {
                command: self.command.clone(),
                outcome,
            },
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Spawn `command`, stream `payload` into it and wait for it to exit.
///
/// Output is routed line by line to the sink (stdout at TRACE, stderr at
/// ERROR) and fully flushed before this returns. Exit code 0 is the only
/// success; a copy error takes precedence over the exit status.
pub fn run<R: Read>(command: &str, payload: &mut R, options: &StreamOptions) -> SwuResult<ExitOutcome> {
    let mut child = ChildProcess::spawn(command, options)?;

    let copied = child.copy_from(payload);
    if let Err(e) = &copied {
        error!("Error copying data to pipe: {}", e);
    }

    child.close_stdin();
    let waited = match child.outcome() {
        Some(outcome) => Ok(outcome),
        None => child.wait_exit(),
    };
    child.finish();

    copied?;
    let outcome = waited?;
    if outcome.success() {
        Ok(outcome)
    } else {
        Err(child.failure(outcome))
    }
}

fn outcome_from(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        trace!("Command returned {}", code);
        ExitOutcome::Exited(code)
    } else if let Some(signal) = status.signal() {
        match Signal::try_from(signal) {
            Ok(name) => trace!("Command killed by signal {}", name),
            Err(_) => trace!("Command killed by signal {}", signal),
        }
        ExitOutcome::Killed(signal)
    } else {
        error!("wait returned but no exit code nor signal?");
        ExitOutcome::WaitError
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn poll_fds(watched: &mut [(Stream, libc::pollfd)], timeout_ms: i32) -> io::Result<usize> {
    let mut fds: Vec<libc::pollfd> = watched.iter().map(|(_, fd)| *fd).collect();
    // SAFETY: fds is a valid, exclusively borrowed array of nfds pollfd entries
    // whose descriptors stay open for the duration of the call.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    for ((_, slot), fd) in watched.iter_mut().zip(fds) {
        slot.revents = fd.revents;
    }
    Ok(ret as usize)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own, with flag arguments only.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
