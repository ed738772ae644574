#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use shellguard::channel::{ChannelEvent, ChannelReceiver};
use shellguard::config::EngineConfig;
use shellguard::pty::{ControllerSpawner, LaunchSpec, ProcessController, PtyError};
use shellguard::session::SessionFactory;
use tokio::sync::mpsc;

pub const FAKE_PID: u32 = 4242;

/// In-memory stand-in for a pty child. Records every byte written to it and
/// lets the test inject output or simulate the child exiting.
#[derive(Default)]
pub struct FakeController {
    written: Mutex<Vec<u8>>,
    output_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    exited: AtomicBool,
    fail_start: bool,
    exit_on_start: bool,
    fail_writes: AtomicBool,
    pub terminate_calls: AtomicUsize,
}

impl FakeController {
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// A child that is gone by the time `start` returns.
    pub fn short_lived() -> Self {
        Self {
            exit_on_start: true,
            ..Self::default()
        }
    }

    /// Make every later write fail as if the pty had broken.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    /// Pretend the child printed `data`.
    pub fn emit(&self, data: &[u8]) {
        let guard = self.output_tx.lock();
        let tx = guard.as_ref().expect("controller not started");
        tx.try_send(Bytes::copy_from_slice(data)).expect("output queue full");
    }

    /// Pretend the child exited on its own.
    pub fn exit(&self) {
        self.exited.store(true, Ordering::Release);
        self.output_tx.lock().take();
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminate_calls.load(Ordering::Acquire)
    }
}

impl ProcessController for FakeController {
    fn start(&self, _cols: u16, _rows: u16) -> Result<mpsc::Receiver<Bytes>, PtyError> {
        if self.fail_start {
            return Err(PtyError::SpawnCommand(anyhow::anyhow!("no such program")));
        }
        let (tx, rx) = mpsc::channel(256);
        if self.exit_on_start {
            self.exited.store(true, Ordering::Release);
        } else {
            *self.output_tx.lock() = Some(tx);
        }
        Ok(rx)
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(PtyError::NotRunning);
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PtyError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pty went away",
            )));
        }
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }

    fn try_wait(&self) -> Result<Option<u32>, PtyError> {
        Ok(self.exited.load(Ordering::Acquire).then_some(0))
    }

    fn terminate(&self, _grace: Duration) {
        self.terminate_calls.fetch_add(1, Ordering::AcqRel);
        self.exited.store(true, Ordering::Release);
        self.output_tx.lock().take();
    }

    fn pid(&self) -> Option<u32> {
        Some(FAKE_PID)
    }
}

/// Hands out [`FakeController`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeSpawner {
    controllers: Mutex<Vec<Arc<FakeController>>>,
    launches: Mutex<Vec<LaunchSpec>>,
    fail_next: AtomicBool,
    short_lived: AtomicBool,
}

impl FakeSpawner {
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Every later child exits as soon as it starts.
    pub fn short_lived(&self) {
        self.short_lived.store(true, Ordering::Release);
    }

    pub fn spawned(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn controller(&self, index: usize) -> Arc<FakeController> {
        Arc::clone(&self.controllers.lock()[index])
    }

    pub fn last(&self) -> Arc<FakeController> {
        let controllers = self.controllers.lock();
        Arc::clone(controllers.last().expect("nothing spawned"))
    }

    pub fn launch(&self, index: usize) -> LaunchSpec {
        self.launches.lock()[index].clone()
    }
}

impl ControllerSpawner for FakeSpawner {
    fn spawn(&self, launch: &LaunchSpec) -> Arc<dyn ProcessController> {
        let controller = if self.fail_next.swap(false, Ordering::AcqRel) {
            Arc::new(FakeController::failing())
        } else if self.short_lived.load(Ordering::Acquire) {
            Arc::new(FakeController::short_lived())
        } else {
            Arc::new(FakeController::default())
        };
        self.controllers.lock().push(Arc::clone(&controller));
        self.launches.lock().push(launch.clone());
        controller
    }
}

/// Config suited to fakes: fast liveness ticks and no termination grace.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll_interval_ms = 10;
    config.termination_grace_ms = 0;
    config.shell.program = Some("/bin/sh".into());
    config
}

pub fn fake_factory() -> (SessionFactory, Arc<FakeSpawner>) {
    fake_factory_with(test_config())
}

pub fn fake_factory_with(config: EngineConfig) -> (SessionFactory, Arc<FakeSpawner>) {
    let spawner = Arc::new(FakeSpawner::default());
    let factory = SessionFactory::builder(config)
        .spawner(spawner.clone())
        .build()
        .expect("valid config");
    (factory, spawner)
}

/// Everything currently queued on a channel.
pub fn drain(rx: &mut ChannelReceiver) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Ok(message) = rx.try_recv() {
        events.push(message.event);
    }
    events
}

/// Receive events until `done` returns true for one of them, or panic after
/// `timeout`. Returns every event seen, the matching one last.
pub async fn recv_until<F>(rx: &mut ChannelReceiver, timeout: Duration, mut done: F) -> Vec<ChannelEvent>
where
    F: FnMut(&ChannelEvent) -> bool,
{
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(message)) => {
                let finished = done(&message.event);
                events.push(message.event);
                if finished {
                    return events;
                }
            }
            Ok(None) => panic!("channel closed; events so far: {events:?}"),
            Err(_) => panic!("timed out; events so far: {events:?}"),
        }
    }
}

/// Poll `cond` until it holds, or panic after `timeout`.
pub async fn wait_for<F>(timeout: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Concatenate the bytes of output and replay events.
pub fn output_bytes(events: &[ChannelEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        match event {
            ChannelEvent::Output(data) => out.extend_from_slice(data),
            ChannelEvent::Replay(pieces) => pieces.iter().for_each(|p| out.extend_from_slice(p)),
            _ => {}
        }
    }
    out
}
