//! Child process execution for allow-listed tools.
//!
//! `ProcessRunner` spawns one tool per call with an explicit argv (never a
//! shell), in its own process group, with stdin closed. A supervisor task
//! owns the child and races its exit against the family timeout and a
//! cancel signal; two reader tasks stream stdout and stderr line by line.
//!
//! Stopping a child is always SIGTERM to the whole group, a bounded grace
//! period, then SIGKILL, so descendants never outlive the scan.

use std::collections::HashSet;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use desktop_agent_common::{CompletionStatus, OutputStream, Target, TimeoutPolicy, ToolDefinition};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::SpawnError;
use crate::session::SessionState;

/// Buffered run events per child before the readers wait on the broker.
const EVENT_BUFFER: usize = 256;

/// Upper bound on waiting for the pipes to close after the child is gone.
/// A descendant that escaped the process group may hold them open forever.
/// Readers waiting on a slow consumer are not subject to it.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest line forwarded as one event; longer runs are split.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Something a running tool produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Line { stream: OutputStream, line: String },
    /// Always the last event on the channel.
    Finished(RunOutcome),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this code.
    Exited { code: i32 },
    /// Killed by a signal the agent did not send.
    Signaled { signal: i32 },
    /// Stopped by the agent after the family timeout.
    TimedOut,
    /// Stopped by the agent on cancel or disconnect.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub termination: Termination,
    pub duration: Duration,
}

impl RunOutcome {
    /// Exit code, or -1 when the child did not exit on its own.
    #[must_use]
    pub fn return_code(&self) -> i32 {
        match self.termination {
            Termination::Exited { code } => code,
            _ => -1,
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited { code: 0 }
    }

    #[must_use]
    pub fn status(&self) -> CompletionStatus {
        match self.termination {
            Termination::Exited { .. } => CompletionStatus::Completed,
            Termination::Signaled { .. } => CompletionStatus::Failed,
            Termination::TimedOut => CompletionStatus::TimedOut,
            Termination::Cancelled => CompletionStatus::Cancelled,
        }
    }

    /// Terminal scan-session state for this outcome.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        match self.termination {
            Termination::Exited { .. } => SessionState::Completed,
            Termination::Signaled { .. } | Termination::TimedOut => SessionState::Failed,
            Termination::Cancelled => SessionState::Cancelled,
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Owning handle to a running child.
///
/// Dropping the handle cancels the child, so a session that goes away for
/// any reason takes its process with it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    cancel: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// OS pid of the direct child, which is also its process group id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the supervisor to stop the child. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// Process groups with a supervisor still attached.
type LiveGroups = Arc<Mutex<HashSet<i32>>>;

/// Membership of one group in [`LiveGroups`], released on drop.
struct LiveGroup {
    groups: LiveGroups,
    pgid: i32,
}

impl LiveGroup {
    fn enter(groups: &LiveGroups, pgid: i32) -> Self {
        groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pgid);
        Self {
            groups: Arc::clone(groups),
            pgid,
        }
    }
}

impl Drop for LiveGroup {
    fn drop(&mut self) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pgid);
    }
}

/// Spawns and supervises tool processes.
#[derive(Debug)]
pub struct ProcessRunner {
    timeouts: TimeoutPolicy,
    grace_period: Duration,
    spawned: AtomicU64,
    live: LiveGroups,
}

impl ProcessRunner {
    #[must_use]
    pub fn new(timeouts: TimeoutPolicy, grace_period: Duration) -> Self {
        Self {
            timeouts,
            grace_period,
            spawned: AtomicU64::new(0),
            live: Arc::default(),
        }
    }

    /// Number of children successfully spawned since startup.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Number of process groups not yet reaped and swept.
    #[must_use]
    pub fn live_groups(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stop every live process group: SIGTERM, up to the grace period for
    /// the supervisors to reap them, then SIGKILL whatever is left.
    ///
    /// Called on server shutdown, before the runtime drops the supervisors.
    pub async fn terminate_all(&self) {
        let groups = self.snapshot();
        if groups.is_empty() {
            return;
        }
        tracing::info!(count = groups.len(), "terminating running tools");
        for pgid in &groups {
            signal_group(Pid::from_raw(*pgid), Signal::SIGTERM);
        }
        let deadline = Instant::now() + self.grace_period;
        while self.live_groups() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for pgid in self.snapshot() {
            tracing::warn!(pgid, "tool outlived shutdown grace period; sending SIGKILL");
            signal_group(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }

    fn snapshot(&self) -> Vec<i32> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Start `tool` against an already-validated `target`.
    ///
    /// The returned receiver yields every output line and then exactly one
    /// [`RunEvent::Finished`]. Must be called inside a tokio runtime.
    pub fn start(
        &self,
        tool: &ToolDefinition,
        target: &Target,
    ) -> Result<(ProcessHandle, mpsc::Receiver<RunEvent>), SpawnError> {
        let mut child = Command::new(tool.executable)
            .args(tool.argv(target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError {
                executable: tool.executable.to_string(),
                source,
            })?;
        let started = Instant::now();
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let pid = child.id();
        tracing::info!(tool = tool.name, target = %target, pid, "tool process spawned");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            handles.push(spawn_reader(stdout, OutputStream::Stdout, events_tx.clone(), stop_rx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            handles.push(spawn_reader(stderr, OutputStream::Stderr, events_tx.clone(), stop_rx));
        }
        let readers = Readers {
            handles,
            stop: stop_tx,
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let pgid = pid.and_then(|p| i32::try_from(p).ok());
        let supervisor = Supervisor {
            tool: tool.name,
            pgid: pgid.map(Pid::from_raw),
            timeout: tool.timeout(&self.timeouts),
            grace_period: self.grace_period,
            started,
            live: pgid.map(|pgid| LiveGroup::enter(&self.live, pgid)),
        };
        tokio::spawn(supervisor.run(child, cancel_rx, readers, events_tx));

        Ok((
            ProcessHandle {
                pid,
                cancel: Some(cancel_tx),
            },
            events_rx,
        ))
    }
}

/// The two pipe readers of one child.
struct Readers {
    handles: Vec<JoinHandle<()>>,
    /// Tells readers idle on an open pipe to give up.
    stop: watch::Sender<bool>,
}

impl Readers {
    /// Wait for both pipes to reach EOF. Pipes still open after
    /// `READER_DRAIN_TIMEOUT` are abandoned; lines already read are still
    /// delivered, however long the consumer takes.
    async fn drain(self, tool: &str) {
        let Self { mut handles, stop } = self;
        let all = futures::future::join_all(handles.iter_mut());
        tokio::pin!(all);
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut all).await.is_err() {
            tracing::debug!(tool, "output not drained after exit; readers stop at the next idle pipe");
            let _ = stop.send(true);
            all.await;
        }
    }
}

struct Supervisor {
    tool: &'static str,
    pgid: Option<Pid>,
    timeout: Duration,
    grace_period: Duration,
    started: Instant,
    live: Option<LiveGroup>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut child: Child,
        mut cancel: oneshot::Receiver<()>,
        readers: Readers,
        events: mpsc::Sender<RunEvent>,
    ) {
        let termination = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => termination_of(status),
                Err(e) => {
                    tracing::warn!(tool = self.tool, error = %e, "failed to wait for tool process");
                    self.stop(&mut child).await;
                    Termination::Signaled { signal: Signal::SIGKILL as i32 }
                }
            },
            () = tokio::time::sleep(self.timeout) => {
                tracing::warn!(
                    tool = self.tool,
                    timeout_secs = self.timeout.as_secs(),
                    "tool exceeded its maximum run time",
                );
                self.stop(&mut child).await;
                Termination::TimedOut
            }
            // Fires on an explicit cancel and when the handle is dropped.
            _ = &mut cancel => {
                tracing::info!(tool = self.tool, "cancelling tool process");
                self.stop(&mut child).await;
                Termination::Cancelled
            }
        };
        let duration = self.started.elapsed();

        // Leftover group members would keep the pipes open.
        if let Some(pgid) = self.pgid {
            signal_group(pgid, Signal::SIGKILL);
        }
        self.live.take();
        readers.drain(self.tool).await;

        let outcome = RunOutcome {
            termination,
            duration,
        };
        tracing::info!(
            tool = self.tool,
            exit_code = outcome.return_code(),
            status = ?outcome.status(),
            duration_ms = outcome.duration_ms(),
            "tool process finished",
        );
        let _ = events.send(RunEvent::Finished(outcome)).await;
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL.
    async fn stop(&self, child: &mut Child) {
        let Some(pgid) = self.pgid else {
            let _ = child.kill().await;
            return;
        };
        signal_group(pgid, Signal::SIGTERM);
        if tokio::time::timeout(self.grace_period, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(
            tool = self.tool,
            pid = pgid.as_raw(),
            grace_secs = self.grace_period.as_secs(),
            "tool ignored SIGTERM; sending SIGKILL",
        );
        signal_group(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited { code },
        (None, Some(signal)) => Termination::Signaled { signal },
        (None, None) => Termination::Exited { code: -1 },
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pgid.as_raw(), ?signal, error = %e, "killpg failed"),
    }
}

/// Forward lines from one pipe until EOF, until told to stop while the pipe
/// is idle, or until nobody is listening.
fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    events: mpsc::Sender<RunEvent>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            // Buffered data wins over the stop signal.
            let read = tokio::select! {
                biased;
                read = read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES) => read,
                _ = stop.wait_for(|stop| *stop) => Ok(0),
            };
            let last = match read {
                Ok(0) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::debug!(?stream, error = %e, "output pipe read failed");
                    true
                }
            };
            let delivered = match clean_line(&buf) {
                Some(line) => events.send(RunEvent::Line { stream, line }).await.is_ok(),
                None => true,
            };
            if last || !delivered {
                break;
            }
        }
    })
}

/// Append bytes up to and including the next newline, or until `buf` holds
/// `cap` bytes. Returns the number of bytes appended; 0 only at EOF.
///
/// Bytes consumed before a cancellation stay in `buf`.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut appended = 0;
    while buf.len() < cap {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let room = cap - buf.len();
        let window = &available[..available.len().min(room)];
        let (taken, done) = match window.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), false),
        };
        buf.extend_from_slice(&window[..taken]);
        reader.consume(taken);
        appended += taken;
        if done {
            break;
        }
    }
    Ok(appended)
}

/// Lossy UTF-8, trailing whitespace removed, blank lines dropped.
fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
