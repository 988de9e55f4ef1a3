//! Managed Redis process lifecycle.
//!
//! A [`ProcessHandle`] moves `Stopped -> Starting -> Running -> Stopped`.
//! `start()` returns only after a ready pattern matched on stdout; the
//! output streams keep being drained for the life of the process so a
//! chatty server never blocks on a full pipe.

use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::instance::{InstanceKind, LaunchCommand, ReadyPatterns};
use crate::topology::Topology;
use crate::{Error, Result};

/// Lifecycle state of a [`ProcessHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process. The initial state, and the state after `stop()` or a
    /// failed `start()`.
    Stopped,
    /// Spawned, waiting for a ready line.
    Starting,
    /// Ready line seen; the process is serving.
    Running,
}

impl ProcessState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ProcessState::Starting,
            2 => ProcessState::Running,
            _ => ProcessState::Stopped,
        }
    }
}

/// Everything a handle needs to launch its process. Filled in by the
/// instance builders.
#[derive(Debug)]
pub(crate) struct LaunchSpec {
    pub name: String,
    pub kind: InstanceKind,
    pub command: LaunchCommand,
    pub ports: Vec<u16>,
    pub ready: ReadyPatterns,
    pub ready_timeout: Option<Duration>,
    /// How long `stop()` waits after SIGTERM before killing.
    pub stop_grace: Duration,
    /// Generated config file, removed when the handle drops.
    pub config_file: Option<TempPath>,
}

struct RunningProcess {
    child: Child,
    drains: Vec<JoinHandle<()>>,
}

/// A single `redis-server` or sentinel process.
///
/// Created by [`ServerConfig::build`](crate::ServerConfig::build) or
/// [`SentinelConfig::build`](crate::SentinelConfig::build).
pub struct ProcessHandle {
    name: String,
    kind: InstanceKind,
    command: LaunchCommand,
    ports: Vec<u16>,
    ready: ReadyPatterns,
    ready_timeout: Option<Duration>,
    stop_grace: Duration,
    state: AtomicU8,
    running: Mutex<Option<RunningProcess>>,
    _config_file: Option<TempPath>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resets `Starting` back to `Stopped` unless disarmed, so a cancelled
/// `start()` never leaves the handle stuck.
struct StartGuard<'a> {
    state: &'a AtomicU8,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .store(ProcessState::Stopped as u8, Ordering::SeqCst);
        }
    }
}

impl ProcessHandle {
    pub(crate) fn new(spec: LaunchSpec) -> Self {
        Self {
            name: spec.name,
            kind: spec.kind,
            command: spec.command,
            ports: spec.ports,
            ready: spec.ready,
            ready_timeout: spec.ready_timeout,
            stop_grace: spec.stop_grace,
            state: AtomicU8::new(ProcessState::Stopped as u8),
            running: Mutex::new(None),
            _config_file: spec.config_file,
        }
    }

    /// Instance name used in logs and errors, e.g. `redis-server:6379`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server or sentinel.
    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// The argv this handle launches.
    pub fn command(&self) -> &LaunchCommand {
        &self.command
    }

    /// The first bound port.
    pub fn port(&self) -> u16 {
        self.ports.first().copied().unwrap_or_default()
    }

    /// Current lifecycle state. Never blocks.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Launches the process and waits for a ready line.
    ///
    /// Fails with [`Error::AlreadyRunning`] if the handle is running. When
    /// the process exits or times out before becoming ready it is killed
    /// and reaped, and the handle returns to `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }

        self.set_state(ProcessState::Starting);
        let mut guard = StartGuard {
            state: &self.state,
            armed: true,
        };

        info!(instance = %self.name, argv = ?self.command.argv(), "starting");

        let mut cmd = Command::new(self.command.program());
        cmd.args(self.command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.command.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| Error::ProcessSpawnFailed {
            instance: self.name.clone(),
            source,
        })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut drains = Vec::with_capacity(2);
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain(
                self.name.clone(),
                "stderr",
                BufReader::new(stderr),
                None,
            )));
        }
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain(
                self.name.clone(),
                "stdout",
                BufReader::new(stdout),
                Some((self.ready.clone(), ready_tx)),
            )));
        }

        let outcome = match self.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, ready_rx).await.map_err(|_| {
                Error::ReadyTimeout {
                    instance: self.name.clone(),
                    waited: limit,
                }
            }),
            None => Ok(ready_rx.await),
        };

        match outcome {
            Ok(Ok(line)) => {
                debug!(instance = %self.name, line, "ready");
                *slot = Some(RunningProcess { child, drains });
                guard.armed = false;
                self.set_state(ProcessState::Running);
                info!(instance = %self.name, "running");
                Ok(())
            }
            Ok(Err(_)) => {
                reap(&self.name, child, drains, self.stop_grace).await;
                Err(Error::StartupStreamEnded(self.name.clone()))
            }
            Err(timeout) => {
                warn!(instance = %self.name, "not ready in time, killing");
                reap(&self.name, child, drains, self.stop_grace).await;
                Err(timeout)
            }
        }
    }

    /// Terminates the process and waits for it to exit. A no-op when
    /// already stopped.
    ///
    /// Sends SIGTERM so the server can shut down cleanly, and kills it if it
    /// is still alive after the stop grace period.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.running.lock().await;
        let Some(mut running) = slot.take() else {
            return Ok(());
        };

        info!(instance = %self.name, "stopping");
        if let Err(e) = terminate(&mut running.child) {
            // Already exited on its own; wait() below reaps it.
            debug!(instance = %self.name, error = %e, "termination not delivered");
        }
        let exited = match tokio::time::timeout(self.stop_grace, running.child.wait()).await {
            Ok(exited) => exited,
            Err(_) => {
                warn!(instance = %self.name, grace = ?self.stop_grace, "still running, killing");
                if let Err(e) = running.child.start_kill() {
                    debug!(instance = %self.name, error = %e, "kill not delivered");
                }
                running.child.wait().await
            }
        };
        if let Err(source) = exited {
            *slot = Some(running);
            return Err(Error::StopInterrupted {
                instance: self.name.clone(),
                source,
            });
        }

        join_drains(&self.name, running.drains, self.stop_grace).await;
        self.set_state(ProcessState::Stopped);
        info!(instance = %self.name, "stopped");
        Ok(())
    }

    /// `true` while the process is running. Never blocks.
    pub fn is_active(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Ports the process listens on.
    pub fn ports(&self) -> Vec<u16> {
        self.ports.clone()
    }
}

#[async_trait]
impl Topology for ProcessHandle {
    async fn start(&self) -> Result<()> {
        ProcessHandle::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        ProcessHandle::stop(self).await
    }

    fn is_active(&self) -> bool {
        ProcessHandle::is_active(self)
    }

    fn ports(&self) -> Vec<u16> {
        ProcessHandle::ports(self)
    }
}

/// Asks the process to exit: SIGTERM on unix, a hard kill elsewhere.
fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
        return match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno.into()),
        };
    }
    child.start_kill()
}

/// Kills a process that never became ready.
async fn reap(name: &str, mut child: Child, drains: Vec<JoinHandle<()>>, grace: Duration) {
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!(instance = %name, error = %e, "failed to reap process");
    }
    join_drains(name, drains, grace).await;
}

/// Waits for drain tasks to hit EOF, aborting any still running after `grace`.
async fn join_drains(name: &str, drains: Vec<JoinHandle<()>>, grace: Duration) {
    for mut task in drains {
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!(instance = %name, "output drain still open, aborting");
            task.abort();
        }
    }
}

/// Logs every line of `reader`. When `ready` is given, the line number
/// of the first match is sent on the channel; dropping the sender without
/// sending signals EOF before readiness.
async fn drain<R>(
    name: String,
    stream: &'static str,
    mut reader: R,
    ready: Option<(ReadyPatterns, oneshot::Sender<usize>)>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some((patterns, tx)) = ready {
        let found = await_ready(&mut reader, &mut buf, &patterns, |line| {
            log_line(&name, stream, line);
        })
        .await;
        match found {
            Some(line) => {
                let _ = tx.send(line);
            }
            None => return,
        }
    }

    while let Ok(Some(line)) = read_text_line(&mut reader, &mut buf).await {
        log_line(&name, stream, &line);
    }
}

fn log_line(name: &str, stream: &'static str, line: &str) {
    match stream {
        "stderr" => info!(instance = %name, stream, "{line}"),
        _ => debug!(instance = %name, stream, "{line}"),
    }
}

/// Reads lines until one matches `patterns`, returning how many lines were
/// consumed. `None` means the stream ended (or failed) first. Lines after
/// the match are left in `reader`.
pub(crate) async fn await_ready<R, F>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    patterns: &ReadyPatterns,
    mut on_line: F,
) -> Option<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    let mut consumed = 0;
    loop {
        let line = read_text_line(reader, buf).await.ok()??;
        consumed += 1;
        on_line(&line);
        if patterns.matches(&line) {
            return Some(consumed);
        }
    }
}

/// One line without its terminator, decoded lossily. `None` at EOF.
async fn read_text_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
