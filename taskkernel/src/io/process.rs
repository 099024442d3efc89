//! Child processes with a hard deadline and bounded capture.
//!
//! stdout and stderr are drained on their own threads while the parent waits,
//! so a chatty child can never block on a full pipe. Only the first
//! `limit` bytes of each stream are kept; the rest is counted and dropped.
//!
//! On unix the child leads its own process group. When the deadline passes
//! the whole group is killed, so processes the command started cannot keep
//! the run alive by holding its output pipes open. Drains that still have not
//! finished a short grace period after the kill are abandoned with what they
//! captured so far.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::exit_codes;

/// How long drains may keep reading once the process group is dead.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// One captured stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub dropped: u64,
}

/// `Write` sink that keeps a prefix and counts the overflow. The capture is
/// shared so an abandoned drain still hands back what it read.
struct BoundedSink {
    limit: usize,
    capture: Arc<Mutex<Capture>>,
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| io::Error::other("capture lock poisoned"))?;
        let room = self.limit.saturating_sub(capture.bytes.len());
        let keep = room.min(buf.len());
        capture.bytes.extend_from_slice(&buf[..keep]);
        capture.dropped += (buf.len() - keep) as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Recorded exit code: [`exit_codes::TIMEOUT`] after a kill, `128 + signal`
    /// for a signal death, otherwise the child's own code.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return exit_codes::TIMEOUT;
        }
        self.status
            .code()
            .unwrap_or_else(|| signal_exit_code(&self.status))
    }
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map_or(exit_codes::EXECUTOR_EXCEPTION, |sig| 128 + sig)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> i32 {
    exit_codes::EXECUTOR_EXCEPTION
}

/// A stream being read on its own thread.
struct Drain {
    stream: &'static str,
    capture: Arc<Mutex<Capture>>,
    handle: JoinHandle<io::Result<u64>>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(stream: &'static str, mut reader: R, limit: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let mut sink = BoundedSink {
            limit,
            capture: Arc::clone(&capture),
        };
        let handle = thread::spawn(move || io::copy(&mut reader, &mut sink));
        Self {
            stream,
            capture,
            handle,
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Join a finished drain, or take what an unfinished one has read.
    fn finish(self) -> Result<Capture> {
        if self.is_finished() {
            self.handle
                .join()
                .map_err(|_| anyhow!("{} reader panicked", self.stream))?
                .with_context(|| format!("read {}", self.stream))?;
        } else {
            warn!(stream = self.stream, "output still open after kill, abandoning reader");
        }
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| anyhow!("{} capture lock poisoned", self.stream))?;
        Ok(std::mem::take(&mut *capture))
    }
}

/// Poll until every drain is done or `until` passes. `true` when all finished.
fn drains_finish_by(drains: &[&Drain], until: Instant) -> bool {
    loop {
        if drains.iter().all(|drain| drain.is_finished()) {
            return true;
        }
        if Instant::now() >= until {
            return false;
        }
        thread::sleep(DRAIN_POLL);
    }
}

#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}

/// Kill the child's process group. A group that is already gone is fine.
#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).map_err(|_| io::Error::other("pid out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

/// Wait for `child` until `deadline`, killing its group if the deadline passes.
fn wait_or_kill(child: &mut Child, deadline: Instant) -> Result<(ExitStatus, bool)> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if let Some(status) = child.wait_timeout(remaining).context("wait for child")? {
        return Ok((status, false));
    }
    warn!("deadline passed, killing process group");
    kill_group(child).context("kill process group")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

/// Spawn `cmd` with stdin closed, wait at most `timeout`, and keep at most
/// `limit` bytes of each output stream.
///
/// The deadline covers the output as well as the child: if the child exits
/// but something it left behind keeps a pipe open past the deadline, the
/// group is killed and the run counts as timed out.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), limit))]
pub fn run_bounded(mut cmd: Command, timeout: Duration, limit: usize) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate(&mut cmd);
    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr not captured"))?;
    let stdout = Drain::spawn("stdout", stdout, limit);
    let stderr = Drain::spawn("stderr", stderr, limit);

    let (status, mut timed_out) = wait_or_kill(&mut child, deadline)?;
    if !timed_out && !drains_finish_by(&[&stdout, &stderr], deadline) {
        warn!("output held open past the deadline, killing process group");
        kill_group(&mut child).context("kill process group")?;
        timed_out = true;
    }
    if timed_out {
        drains_finish_by(&[&stdout, &stderr], Instant::now() + DRAIN_GRACE);
    }

    let stdout = stdout.finish()?;
    let stderr = stderr.finish()?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output exceeded limit"
        );
    }

    debug!(code = ?status.code(), timed_out, "child finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}
