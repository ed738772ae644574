//! Child process control.
//!
//! A [`ProcessController`] owns one pty pair and the child running on its
//! slave side. [`PtyController`] is the real implementation on top of
//! `portable-pty`; tests swap in fakes through a [`ControllerSpawner`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::EngineConfig;

/// Read size of the blocking pty reader.
const READ_BUF_SIZE: usize = 8192;

/// Capacity of the reader -> read loop queue, in chunks.
const OUTPUT_QUEUE: usize = 256;

/// Capacity of the input queue feeding the pty writer thread, in writes.
const INPUT_QUEUE: usize = 64;

/// Step between exit checks while waiting out the termination grace period.
const TERMINATE_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[source] std::io::Error),

    #[error("controller already started")]
    AlreadyStarted,

    #[error("controller is not running")]
    NotRunning,

    #[error("no agent program configured")]
    NoAgentProgram,
}

/// What kind of program a session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Interactive shell, optionally as a login shell or another user.
    #[default]
    Shell,
    /// A configured agent launcher.
    Agent,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Shell => "shell",
            BackendKind::Agent => "agent",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Resolve a backend to a concrete command line and environment.
    ///
    /// `overlay` is applied last so callers can override anything.
    pub fn resolve(
        kind: BackendKind,
        config: &EngineConfig,
        session_id: &str,
        cwd: Option<PathBuf>,
        overlay: &HashMap<String, String>,
    ) -> Result<Self, PtyError> {
        let (program, args, mut env) = match kind {
            BackendKind::Shell => {
                let shell = &config.shell;
                match &shell.switch_user {
                    Some(user) if !shell.switch_user_command.is_empty() => {
                        let mut parts = shell
                            .switch_user_command
                            .iter()
                            .map(|part| part.replace("{user}", user));
                        // Non-empty, checked by the match guard.
                        let program = parts.next().unwrap_or_default();
                        (program, parts.collect(), Vec::new())
                    }
                    _ => {
                        let program = shell
                            .program
                            .clone()
                            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
                            .unwrap_or_else(|| "/bin/sh".to_string());
                        let args = if shell.login { vec!["-l".to_string()] } else { Vec::new() };
                        (program, args, Vec::new())
                    }
                }
            }
            BackendKind::Agent => {
                let agent = &config.agent;
                let program = agent.program.clone().ok_or(PtyError::NoAgentProgram)?;
                let mut env: Vec<(String, String)> =
                    agent.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                env.sort();
                (program, agent.args.clone(), env)
            }
        };

        let mut base = vec![
            ("TERM".to_string(), config.term.clone()),
            ("SHELLGUARD_SESSION_ID".to_string(), session_id.to_string()),
            ("SHELLGUARD_BACKEND".to_string(), kind.as_str().to_string()),
        ];
        base.append(&mut env);
        let mut extra: Vec<(String, String)> =
            overlay.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        extra.sort();
        base.extend(extra);

        Ok(Self {
            program,
            args,
            env: base,
            cwd: cwd.or_else(|| config.cwd.clone()),
        })
    }

    pub fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }

    /// Display form of the command line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Capability set of one child process behind a pty.
///
/// All methods may block and are called from the blocking worker pool.
/// `terminate` must be idempotent.
pub trait ProcessController: Send + Sync {
    /// Allocate the pty, spawn the child and start the reader. Output arrives
    /// on the returned queue, which closes at EOF.
    fn start(&self, cols: u16, rows: u16) -> Result<mpsc::Receiver<Bytes>, PtyError>;

    /// Queue `data` for the child. Blocks while the child is not reading;
    /// call it from a blocking context.
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// `Some(exit code)` once the child has exited.
    fn try_wait(&self) -> Result<Option<u32>, PtyError>;

    /// Close the descriptor, then stop the child: graceful signal, bounded
    /// wait, forceful kill, reap.
    fn terminate(&self, grace: Duration);

    fn pid(&self) -> Option<u32>;
}

/// Builds the controller for a new session.
pub trait ControllerSpawner: Send + Sync {
    fn spawn(&self, launch: &LaunchSpec) -> Arc<dyn ProcessController>;
}

/// Spawner for real pty-backed children.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ControllerSpawner for PtySpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Arc<dyn ProcessController> {
        Arc::new(PtyController::new(launch.clone()))
    }
}

struct Handles {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

/// A child process on a `portable-pty` pty pair.
pub struct PtyController {
    launch: LaunchSpec,
    handles: Mutex<Option<Handles>>,
    /// Feeds the writer thread. Taking it is all `terminate` does to input,
    /// so a write stuck on a full pty never holds up teardown.
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Why the writer thread stopped, if it hit an error.
    write_failure: Arc<Mutex<Option<std::io::ErrorKind>>>,
    pid: AtomicU32,
    started: AtomicBool,
    terminated: AtomicBool,
}

impl std::fmt::Debug for PtyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyController")
            .field("command", &self.launch.display())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl PtyController {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            handles: Mutex::new(None),
            input_tx: Mutex::new(None),
            write_failure: Arc::new(Mutex::new(None)),
            pid: AtomicU32::new(0),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Send `signal` to the child's process group.
    ///
    /// portable-pty calls setsid() in the child, so the child leads its own
    /// group and the negative pid reaches everything it started.
    fn signal_group(&self, signal: libc::c_int) {
        let Some(pid) = self.pid() else { return };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        // SAFETY: kill() has no memory-safety preconditions.
        let ret = unsafe { libc::kill(-(pid as i32), signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid, signal, ?err, "failed to signal child process group");
            }
        }
    }
}

impl ProcessController for PtyController {
    fn start(&self, cols: u16, rows: u16) -> Result<mpsc::Receiver<Bytes>, PtyError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PtyError::AlreadyStarted);
        }

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system().openpty(size).map_err(PtyError::OpenPty)?;

        // On failure both halves are dropped here, before the error leaves.
        let child = match pair.slave.spawn_command(self.launch.command()) {
            Ok(child) => child,
            Err(e) => {
                drop(pair);
                return Err(PtyError::SpawnCommand(e));
            }
        };
        // The parent keeps only the master side.
        drop(pair.slave);
        let master = pair.master;

        let pid = child.process_id().unwrap_or(0);
        self.pid.store(pid, Ordering::Release);

        let reader = master.try_clone_reader().map_err(PtyError::CloneReader);
        let writer = master.take_writer().map_err(PtyError::TakeWriter);
        let (reader, writer) = match (reader, writer) {
            (Ok(r), Ok(w)) => (r, w),
            (Err(e), _) | (_, Err(e)) => {
                *self.handles.lock() = Some(Handles {
                    master: Some(master),
                    child,
                });
                self.terminate(Duration::ZERO);
                return Err(e);
            }
        };

        *self.handles.lock() = Some(Handles {
            master: Some(master),
            child,
        });

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        *self.input_tx.lock() = Some(input_tx);
        let failure = Arc::clone(&self.write_failure);
        tokio::task::spawn_blocking(move || write_loop(writer, input_rx, failure, pid));

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        tokio::task::spawn_blocking(move || read_loop(reader, tx, pid));

        tracing::info!(pid, command = %self.launch.display(), "child spawned");
        Ok(rx)
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        // Clone out so the lock is not held while the queue is full.
        let tx = self.input_tx.lock().clone().ok_or(PtyError::NotRunning)?;
        tx.blocking_send(Bytes::copy_from_slice(data)).map_err(|_| {
            if self.terminated.load(Ordering::Acquire) {
                return PtyError::NotRunning;
            }
            let kind = (*self.write_failure.lock()).unwrap_or(std::io::ErrorKind::BrokenPipe);
            PtyError::Write(std::io::Error::new(kind, "pty writer stopped"))
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = self.handles.lock();
        let master = guard
            .as_ref()
            .and_then(|h| h.master.as_ref())
            .ok_or(PtyError::NotRunning)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    fn try_wait(&self) -> Result<Option<u32>, PtyError> {
        let mut guard = self.handles.lock();
        match guard.as_mut() {
            Some(handles) => Ok(handles
                .child
                .try_wait()
                .map_err(PtyError::Wait)?
                .map(|status| status.exit_code())),
            // Already torn down.
            None if self.terminated.load(Ordering::Acquire) => Ok(Some(0)),
            None => Err(PtyError::NotRunning),
        }
    }

    fn terminate(&self, grace: Duration) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        // Descriptor first: closing the master hangs up the slave side. The
        // writer thread lets go of its copy once the child is gone.
        drop(self.input_tx.lock().take());
        let Some(mut handles) = self.handles.lock().take() else {
            return;
        };
        drop(handles.master.take());

        let pid = self.pid().unwrap_or(0);
        match handles.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, code = status.exit_code(), "child already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(pid, ?err, "try_wait failed before terminate"),
        }

        self.signal_group(libc::SIGTERM);
        let deadline = Instant::now() + grace;
        loop {
            match handles.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid, code = status.exit_code(), "child exited after SIGTERM");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(pid, ?err, "try_wait failed during terminate");
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(TERMINATE_POLL.min(deadline - now));
        }

        tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, killing");
        self.signal_group(libc::SIGKILL);
        if let Err(err) = handles.child.kill() {
            tracing::debug!(pid, ?err, "direct kill failed");
        }
        match handles.child.wait() {
            Ok(status) => tracing::debug!(pid, code = status.exit_code(), "child reaped"),
            Err(err) => tracing::warn!(pid, ?err, "failed to reap child"),
        }
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

impl Drop for PtyController {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.terminated.load(Ordering::Acquire) {
            self.terminate(Duration::ZERO);
        }
    }
}

/// Blocking writer: drains the input queue into the pty until the queue
/// closes or a write fails.
fn write_loop(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Bytes>,
    failure: Arc<Mutex<Option<std::io::ErrorKind>>>,
    pid: u32,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        while let Some(data) = input.blocking_recv() {
            if let Err(err) = writer.write_all(&data).and_then(|()| writer.flush()) {
                tracing::debug!(pid, ?err, "pty write ended");
                *failure.lock() = Some(err.kind());
                break;
            }
        }
    }));
    if let Err(panic) = result {
        tracing::error!(pid, ?panic, "pty writer panicked");
        *failure.lock() = Some(std::io::ErrorKind::Other);
    }
}

/// Blocking reader: forwards pty output until EOF, an error, or the
/// consumer goes away.
fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>, pid: u32) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is how Linux reports a hung-up slave.
                Err(e) => {
                    tracing::debug!(pid, ?e, "pty read ended");
                    break;
                }
            }
        }
    }));
    if let Err(panic) = result {
        tracing::error!(pid, ?panic, "pty reader panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.shell.program = Some("/bin/sh".into());
        config
    }

    #[test]
    fn shell_launch_has_engine_env() {
        let launch = LaunchSpec::resolve(BackendKind::Shell, &config(), "s1", None, &HashMap::new())
            .unwrap();
        assert_eq!(launch.program, "/bin/sh");
        assert!(launch.args.is_empty());
        assert!(launch.env.contains(&("TERM".into(), "xterm-256color".into())));
        assert!(launch.env.contains(&("SHELLGUARD_SESSION_ID".into(), "s1".into())));
        assert!(launch.env.contains(&("SHELLGUARD_BACKEND".into(), "shell".into())));
    }

    #[test]
    fn login_shell_adds_flag() {
        let mut config = config();
        config.shell.login = true;
        let launch = LaunchSpec::resolve(BackendKind::Shell, &config, "s1", None, &HashMap::new())
            .unwrap();
        assert_eq!(launch.args, vec!["-l".to_string()]);
        assert_eq!(launch.display(), "/bin/sh -l");
    }

    #[test]
    fn switch_user_substitutes_name() {
        let mut config = config();
        config.shell.switch_user = Some("deploy".into());
        let launch = LaunchSpec::resolve(BackendKind::Shell, &config, "s1", None, &HashMap::new())
            .unwrap();
        assert_eq!(launch.program, "sudo");
        assert_eq!(launch.args, vec!["-u", "deploy", "-i"]);
    }

    #[test]
    fn agent_requires_program() {
        let err = LaunchSpec::resolve(BackendKind::Agent, &config(), "s1", None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, PtyError::NoAgentProgram));
    }

    #[test]
    fn agent_gets_backend_env_and_overlay_wins() {
        let mut config = config();
        config.agent.program = Some("/usr/bin/agent".into());
        config.agent.args = vec!["--pty".into()];
        config.agent.env.insert("AGENT_MODE".into(), "pty".into());
        let mut overlay = HashMap::new();
        overlay.insert("TERM".to_string(), "dumb".to_string());

        let launch = LaunchSpec::resolve(
            BackendKind::Agent,
            &config,
            "a1",
            Some(PathBuf::from("/tmp")),
            &overlay,
        )
        .unwrap();
        assert_eq!(launch.display(), "/usr/bin/agent --pty");
        assert!(launch.env.contains(&("SHELLGUARD_BACKEND".into(), "agent".into())));
        assert!(launch.env.contains(&("AGENT_MODE".into(), "pty".into())));
        // The overlay comes last, so it overrides TERM when applied in order.
        assert_eq!(launch.env.last(), Some(&("TERM".to_string(), "dumb".to_string())));
        assert_eq!(launch.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn cwd_falls_back_to_config() {
        let mut config = config();
        config.cwd = Some(PathBuf::from("/var/tmp"));
        let launch = LaunchSpec::resolve(BackendKind::Shell, &config, "s1", None, &HashMap::new())
            .unwrap();
        assert_eq!(launch.cwd, Some(PathBuf::from("/var/tmp")));
    }

    #[test]
    fn unstarted_controller_is_not_running() {
        let controller = PtyController::new(
            LaunchSpec::resolve(BackendKind::Shell, &config(), "s1", None, &HashMap::new()).unwrap(),
        );
        assert!(controller.pid().is_none());
        assert!(matches!(controller.write(b"x"), Err(PtyError::NotRunning)));
        assert!(matches!(controller.try_wait(), Err(PtyError::NotRunning)));
        // Idempotent, even before start.
        controller.terminate(Duration::ZERO);
        controller.terminate(Duration::ZERO);
    }
}
