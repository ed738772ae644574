//! Local watch mode.
//!
//! Monitors an arbitrary log stream (a followed file, a command's stdout or
//! piped stdin) with the same scanner and block policy the sessions use.
//! Keystrokes are read straight from the controlling terminal in raw mode,
//! ahead of any shell. While the policy is not open, stream output is held
//! back and flushed on unlock. Ctrl+C always exits.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::buffer::SessionBuffer;
use crate::channel::ChannelEvent;
use crate::input::Gesture;
use crate::policy::{BlockPolicy, BlockState, InputDecision};
use crate::scanner::{ScanWindow, ThreatScanner};
use crate::terminal::{self, RawModeGuard, TerminalError};

const CTRL_C: u8 = 0x03;
const READ_BUF_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start command {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open controlling terminal: {0}")]
    Tty(#[source] std::io::Error),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),
}

/// Where the watched stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSource {
    /// Follow a file like `tail -f`, starting at its current end.
    File(PathBuf),
    /// Run a command through `sh -c` and watch its stdout.
    Command(String),
    /// Piped stdin.
    Stdin,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub source: WatchSource,
    pub gesture: Gesture,
    pub carry_limit: usize,
    /// Cap on output held back while blocked; the oldest is dropped first.
    pub hold_limit: usize,
    /// How often a followed file is checked for growth.
    pub poll_interval: Duration,
}

/// How a watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    SourceEnded,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub exit: WatchExit,
    pub blocks: usize,
    pub bytes: u64,
}

/// What to do after a keystroke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Exit,
    Write(Vec<u8>),
    Nothing,
}

/// The terminal-free part of watch mode: scanning, the policy and the
/// held-back output.
#[derive(Debug)]
pub struct Watcher {
    scanner: Arc<ThreatScanner>,
    window: ScanWindow,
    policy: BlockPolicy,
    gesture: Gesture,
    held: SessionBuffer,
    blocks: usize,
    bytes: u64,
}

impl Watcher {
    pub fn new(scanner: Arc<ThreatScanner>, gesture: Gesture, carry_limit: usize, hold_limit: usize) -> Self {
        Self {
            scanner,
            window: ScanWindow::new(carry_limit),
            policy: BlockPolicy::new(),
            gesture,
            held: SessionBuffer::new(hold_limit),
            blocks: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> BlockState {
        self.policy.state()
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn held_bytes(&self) -> usize {
        self.held.len()
    }

    /// Process a stream chunk; returns what to write to the terminal now.
    pub fn on_output(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.bytes += chunk.len() as u64;
        let (text, from) = self.window.feed(chunk);

        if !self.policy.state().is_open() {
            self.held.append(chunk);
            return Vec::new();
        }

        let verdict = self.scanner.scan_from(&text, from);
        let mut out = to_crlf(chunk);
        if let Some(ChannelEvent::Blocked { banner, .. }) = self.policy.on_verdict(&verdict, &self.gesture) {
            self.blocks += 1;
            tracing::warn!(severity = %verdict.severity, reason = ?verdict.reason, "watched stream blocked");
            out.extend_from_slice(banner.as_bytes());
        }
        out
    }

    /// Process one keystroke chunk.
    pub fn on_key(&mut self, data: &[u8]) -> KeyAction {
        if data.contains(&CTRL_C) {
            return KeyAction::Exit;
        }
        match self.policy.handle_input(data, &self.gesture) {
            InputDecision::Forward => KeyAction::Nothing,
            InputDecision::Reject { banner } => KeyAction::Write(banner.into_bytes()),
            InputDecision::Transition { event: ChannelEvent::Blocked { banner, .. }, .. } => {
                KeyAction::Write(banner.into_bytes())
            }
            InputDecision::Transition { to: BlockState::Open, .. } => {
                let mut out = b"\r\n[unlocked]\r\n".to_vec();
                out.extend_from_slice(&to_crlf(&self.held.snapshot()));
                self.held.clear();
                KeyAction::Write(out)
            }
            InputDecision::Transition { .. } => KeyAction::Nothing,
        }
    }

    pub fn summary(&self, exit: WatchExit) -> WatchSummary {
        WatchSummary {
            exit,
            blocks: self.blocks,
            bytes: self.bytes,
        }
    }
}

/// Raw mode turns off output post-processing, so bare `\n` must become
/// `\r\n` to keep log lines left-aligned.
fn to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Run watch mode until the source ends (while open) or Ctrl+C.
pub async fn run_watch(options: WatchOptions, scanner: Arc<ThreatScanner>) -> Result<WatchSummary, WatchError> {
    let mut watcher = Watcher::new(scanner, options.gesture.clone(), options.carry_limit, options.hold_limit);
    let mut stream = open_source(&options).await?;
    let mut keys = open_keys()?;
    let _raw = RawModeGuard::new()?;
    tracing::info!(source = ?options.source, gesture = %options.gesture.label(), "watching");

    let mut source_done = false;
    let exit = loop {
        if source_done && watcher.state().is_open() {
            break WatchExit::SourceEnded;
        }
        tokio::select! {
            chunk = stream.recv(), if !source_done => match chunk {
                Some(chunk) => {
                    let out = watcher.on_output(&chunk);
                    if !out.is_empty() {
                        terminal::write_stdout(&out)?;
                    }
                }
                None => source_done = true,
            },
            key = keys.recv() => match key {
                Some(key) => match watcher.on_key(&key) {
                    KeyAction::Exit => break WatchExit::Interrupted,
                    KeyAction::Write(out) => terminal::write_stdout(&out)?,
                    KeyAction::Nothing => {}
                },
                None => break WatchExit::Interrupted,
            },
        }
    };

    Ok(watcher.summary(exit))
}

async fn open_source(options: &WatchOptions) -> Result<mpsc::Receiver<Bytes>, WatchError> {
    let (tx, rx) = mpsc::channel(64);
    match &options.source {
        WatchSource::File(path) => {
            let mut file = tokio::fs::File::open(path).await.map_err(|source| WatchError::Open {
                path: path.clone(),
                source,
            })?;
            let start = file
                .seek(std::io::SeekFrom::End(0))
                .await
                .map_err(|source| WatchError::Open {
                    path: path.clone(),
                    source,
                })?;
            tokio::spawn(follow_file(file, path.clone(), start, options.poll_interval, tx));
        }
        WatchSource::Command(command) => {
            let mut child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| WatchError::Spawn {
                    command: command.clone(),
                    source,
                })?;
            let stdout = child.stdout.take().ok_or_else(|| WatchError::Spawn {
                command: command.clone(),
                source: std::io::Error::other("stdout not captured"),
            })?;
            tokio::spawn(async move {
                forward(stdout, tx).await;
                match child.wait().await {
                    Ok(status) => tracing::debug!(%status, "watched command exited"),
                    Err(err) => tracing::warn!(?err, "failed to wait for watched command"),
                }
            });
        }
        WatchSource::Stdin => {
            tokio::spawn(forward(tokio::io::stdin(), tx));
        }
    }
    Ok(rx)
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(?err, "watched stream read failed");
                break;
            }
        }
    }
}

/// Poll a file for appended data, starting over if it is truncated.
async fn follow_file(
    mut file: tokio::fs::File,
    path: PathBuf,
    mut pos: u64,
    poll: Duration,
    tx: mpsc::Sender<Bytes>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(poll).await;
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() < pos => {
                        tracing::info!(path = %path.display(), "file truncated, following from start");
                        match file.seek(std::io::SeekFrom::Start(0)).await {
                            Ok(p) => pos = p,
                            Err(err) => {
                                tracing::warn!(?err, "seek after truncation failed");
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), ?err, "followed file is gone");
                        break;
                    }
                }
            }
            Ok(n) => {
                pos += n as u64;
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), ?err, "followed file read failed");
                break;
            }
        }
    }
}

/// Keystrokes from the controlling terminal, independent of stdin.
fn open_keys() -> Result<mpsc::Receiver<Bytes>, WatchError> {
    let mut tty = std::fs::File::open("/dev/tty").map_err(WatchError::Tty)?;
    let (tx, rx) = mpsc::channel(16);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 64];
        loop {
            match tty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    Ok(rx)
}
