//! Terminal sessions and the factory that owns them.
//!
//! A [`TerminalSession`] ties one [`ProcessController`] to one
//! [`OutputBroadcaster`]. The [`SessionFactory`] is the engine's entry point:
//! it creates sessions on demand, routes channel requests to them and
//! remembers who owned the sessions that have closed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Advisory, BroadcastError, InputRoute, OutputBroadcaster};
use crate::buffer::SessionBuffer;
use crate::channel::{AttachAck, ChannelId, ChannelSink, CloseReason};
use crate::config::{ConfigError, EngineConfig};
use crate::input::Gesture;
use crate::membership::Departure;
use crate::policy::BlockState;
use crate::pty::{BackendKind, ControllerSpawner, LaunchSpec, ProcessController, PtyError, PtySpawner};
use crate::scanner::{AdvisoryScanner, ScanWindow, ThreatScanner};

/// Upper bound on waiting for the read loop to stop during close.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long output still arriving after child exit is collected.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Allowance on top of the termination grace before close stops waiting
/// for the controller.
const TERMINATE_SLACK: Duration = Duration::from_secs(5);

/// Validate a session id. Ids must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 64 {
        return Err(format!("session id too long ({} chars, max 64)", id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!("session id contains invalid characters: {id}"));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session is closed: {0}")]
    Closed(String),
    #[error("channel {channel} is not attached to session {session}")]
    NotAttached { session: String, channel: ChannelId },
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("session {0} belongs to someone else and cannot be resumed")]
    NotYourSession(String),
    #[error("session {0} has already closed and cannot be resumed")]
    AlreadyClosed(String),
    #[error("failed to start session: {0}")]
    Spawn(#[from] PtyError),
    #[error("pty i/o failed on session {session}: {source}")]
    Io {
        session: String,
        #[source]
        source: PtyError,
    },
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

/// Best-effort identity of whoever created a session. Only used to tell a
/// returning owner apart from a stranger when a closed id is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnerInfo {
    pub remote_addr: Option<String>,
    pub label: Option<String>,
}

impl OwnerInfo {
    /// Exact match of `token` against the label or the address. No token
    /// never matches.
    pub fn matches(&self, token: Option<&str>) -> bool {
        let Some(token) = token else { return false };
        self.label.as_deref() == Some(token) || self.remote_addr.as_deref() == Some(token)
    }
}

/// What the channel's write turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Written to the child.
    Delivered,
    /// The channel is an observer; nothing was written.
    Dropped,
    /// Held back by the block policy.
    Intercepted,
}

/// Parameters of [`SessionFactory::get_or_create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    pub backend: BackendKind,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub owner: OwnerInfo,
    /// Identity presented for resuming a closed session.
    pub identity: Option<String>,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            id: None,
            backend: BackendKind::Shell,
            cols: 80,
            rows: 24,
            cwd: None,
            env: HashMap::new(),
            owner: OwnerInfo::default(),
            identity: None,
        }
    }
}

impl CreateRequest {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Factory-level lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String, backend: BackendKind },
    Destroyed { id: String, reason: CloseReason },
}

/// Read-only view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub backend: BackendKind,
    pub command: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub created_at: u64,
    pub cols: u16,
    pub rows: u16,
    pub channels: usize,
    pub primary: Option<ChannelId>,
    pub buffer_bytes: usize,
    pub total_bytes: u64,
    pub block_state: BlockState,
    pub block_reason: Option<String>,
}

type ClosedHook = Box<dyn FnOnce(&str, &OwnerInfo, CloseReason) + Send>;

/// One pty-backed process shared by any number of channels.
pub struct TerminalSession {
    id: String,
    backend: BackendKind,
    command: String,
    cwd: Option<PathBuf>,
    owner: OwnerInfo,
    created_at: SystemTime,
    controller: Arc<dyn ProcessController>,
    broadcaster: Arc<OutputBroadcaster>,
    state: RwLock<SessionState>,
    size: Mutex<(u16, u16)>,
    /// Serializes writes so concurrent writers never interleave bytes.
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    on_closed: Mutex<Option<ClosedHook>>,
    /// Bumped on every attach and every keep-alive arm, so a pending
    /// keep-alive timer can tell whether it is still current.
    keep_alive_generation: AtomicU64,
    keep_alive: Option<Duration>,
    grace: Duration,
    poll: Duration,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    fn new(
        launch: &LaunchSpec,
        id: String,
        backend: BackendKind,
        owner: OwnerInfo,
        controller: Arc<dyn ProcessController>,
        broadcaster: Arc<OutputBroadcaster>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            id,
            backend,
            command: launch.display(),
            cwd: launch.cwd.clone(),
            owner,
            created_at: SystemTime::now(),
            controller,
            broadcaster,
            state: RwLock::new(SessionState::Starting),
            size: Mutex::new((0, 0)),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pump: Mutex::new(None),
            on_closed: Mutex::new(None),
            keep_alive_generation: AtomicU64::new(0),
            keep_alive: config.keep_alive(),
            grace: config.termination_grace(),
            poll: config.poll_interval(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    pub fn owner(&self) -> &OwnerInfo {
        &self.owner
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.controller.pid()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn block_state(&self) -> BlockState {
        self.broadcaster.block_state()
    }

    pub fn channel_count(&self) -> usize {
        self.broadcaster.channel_count()
    }

    pub fn is_primary(&self, channel: &ChannelId) -> bool {
        self.broadcaster.is_primary(channel)
    }

    /// Current history contents.
    pub fn history(&self) -> Bytes {
        self.broadcaster.history()
    }

    fn set_on_closed(&self, hook: ClosedHook) {
        *self.on_closed.lock() = Some(hook);
    }

    /// Spawn the child and start the read loop. On failure everything
    /// already allocated is released before the error is returned.
    async fn start(self: &Arc<Self>, cols: u16, rows: u16) -> Result<(), SessionError> {
        *self.size.lock() = (cols, rows);
        let controller = Arc::clone(&self.controller);
        let started = tokio::task::spawn_blocking(move || controller.start(cols, rows)).await;

        let output = match started {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.abandon().await;
                return Err(SessionError::Spawn(err));
            }
            Err(join_err) => {
                self.abandon().await;
                return Err(SessionError::Worker(join_err.to_string()));
            }
        };

        *self.state.write() = SessionState::Running;
        let handle = tokio::spawn(Arc::clone(self).pump(output));
        *self.pump.lock() = Some(handle);
        tracing::info!(session = %self.id, backend = %self.backend, pid = ?self.pid(), "session started");
        Ok(())
    }

    /// Tear down a session that never got running.
    async fn abandon(&self) {
        self.closed.store(true, Ordering::Release);
        let controller = Arc::clone(&self.controller);
        if let Err(err) = tokio::task::spawn_blocking(move || controller.terminate(Duration::ZERO)).await {
            tracing::warn!(session = %self.id, %err, "cleanup after failed start panicked");
        }
        self.broadcaster.close(CloseReason::IoFailure);
        *self.state.write() = SessionState::Closed;
    }

    /// Read loop: publish output until the child goes away or the session
    /// is cancelled.
    async fn pump(self: Arc<Self>, mut output: mpsc::Receiver<Bytes>) {
        let mut liveness = tokio::time::interval(self.poll);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                chunk = output.recv() => match chunk {
                    Some(chunk) => self.broadcaster.publish(chunk),
                    None => {
                        tracing::debug!(session = %self.id, "pty output reached EOF");
                        break CloseReason::ChildExited;
                    }
                },
                _ = liveness.tick() => match self.controller.try_wait() {
                    Ok(Some(code)) => {
                        tracing::info!(session = %self.id, code, "child exited");
                        self.drain_after_exit(&mut output).await;
                        break CloseReason::ChildExited;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(session = %self.id, %err, "child liveness check failed");
                        break CloseReason::IoFailure;
                    }
                },
            }

            // The broker dropped the last channel for falling behind.
            if self.broadcaster.take_emptied() {
                match self.keep_alive {
                    None => break CloseReason::LastChannelDetached,
                    Some(grace) => self.start_keep_alive(grace),
                }
            }
        };

        self.shutdown(reason, true).await;
    }

    /// Collect output the child wrote just before exiting.
    async fn drain_after_exit(&self, output: &mut mpsc::Receiver<Bytes>) {
        let drain = async {
            while let Some(chunk) = output.recv().await {
                self.broadcaster.publish(chunk);
            }
        };
        if tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!(session = %self.id, "output still open after child exit");
        }
    }

    /// Attach a channel. History, if any, is replayed to it alone.
    pub fn attach(&self, channel: ChannelId, sink: ChannelSink) -> Result<AttachAck, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.keep_alive_generation.fetch_add(1, Ordering::AcqRel);
        let attached = self
            .broadcaster
            .attach(channel.clone(), sink)
            .map_err(|_| SessionError::Closed(self.id.clone()))?;
        tracing::info!(
            session = %self.id,
            channel = %channel,
            primary = attached.primary,
            replayed = attached.replayed,
            "channel attached"
        );
        Ok(AttachAck {
            session: self.id.clone(),
            channel,
            primary: attached.primary,
            replayed: attached.replayed,
            block_state: attached.block_state,
        })
    }

    pub fn detach(&self, channel: &ChannelId) -> Option<Departure> {
        let departure = self.broadcaster.detach(channel)?;
        tracing::info!(session = %self.id, channel = %channel, remaining = self.channel_count(), "channel detached");
        Some(departure)
    }

    pub fn focus(&self, channel: &ChannelId) -> Result<(), SessionError> {
        self.broadcaster.focus(channel).map_err(|e| self.broadcast_error(e, channel))?;
        tracing::info!(session = %self.id, channel = %channel, "focus changed");
        Ok(())
    }

    /// Write input from `channel`. Only the primary channel reaches the
    /// child, and only while input is not blocked.
    pub async fn write(&self, channel: &ChannelId, data: Bytes) -> Result<WriteOutcome, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let route = self
            .broadcaster
            .route_input(channel, &data)
            .map_err(|e| self.broadcast_error(e, channel))?;
        match route {
            InputRoute::Dropped => return Ok(WriteOutcome::Dropped),
            InputRoute::Intercepted => return Ok(WriteOutcome::Intercepted),
            InputRoute::Forward => {}
        }

        let result = {
            let _guard = self.write_lock.lock().await;
            let controller = Arc::clone(&self.controller);
            tokio::task::spawn_blocking(move || controller.write(&data)).await
        };
        match result {
            Ok(Ok(())) => Ok(WriteOutcome::Delivered),
            Ok(Err(_)) if self.is_closed() => Err(SessionError::Closed(self.id.clone())),
            Ok(Err(err)) => {
                tracing::warn!(session = %self.id, %err, "pty write failed, closing session");
                self.close(CloseReason::IoFailure).await;
                Err(SessionError::Io {
                    session: self.id.clone(),
                    source: err,
                })
            }
            Err(join_err) => Err(SessionError::Worker(join_err.to_string())),
        }
    }

    /// Resize the pty. Failures are logged, never returned.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        *self.size.lock() = (cols, rows);
        if let Err(err) = self.controller.resize(cols, rows) {
            tracing::warn!(session = %self.id, cols, rows, %err, "resize failed");
        }
        Ok(())
    }

    pub fn unlock_gesture(&self, actor: &ChannelId) -> Result<BlockState, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.broadcaster
            .unlock_gesture(actor)
            .map_err(|e| self.broadcast_error(e, actor))
    }

    /// Close the session. Returns `false` if it was already closing.
    pub async fn close(&self, reason: CloseReason) -> bool {
        self.shutdown(reason, false).await
    }

    /// Teardown: stop the read loop, release the pty and the child, update
    /// the registry, then tell the channels. Runs once.
    async fn shutdown(&self, reason: CloseReason, from_pump: bool) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.write() = SessionState::Closing;
        tracing::info!(session = %self.id, %reason, "closing session");

        self.cancel.cancel();
        if !from_pump {
            let handle = self.pump.lock().take();
            if let Some(handle) = handle {
                match tokio::time::timeout(PUMP_JOIN_TIMEOUT, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(session = %self.id, %err, "read loop panicked"),
                    Err(_) => tracing::warn!(session = %self.id, "read loop did not stop in time"),
                }
            }
        }

        let controller = Arc::clone(&self.controller);
        let grace = self.grace;
        let terminate = tokio::task::spawn_blocking(move || controller.terminate(grace));
        match tokio::time::timeout(grace + TERMINATE_SLACK, terminate).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(session = %self.id, %err, "terminate task panicked"),
            Err(_) => tracing::warn!(session = %self.id, "child teardown still running, not waiting"),
        }

        let hook = self.on_closed.lock().take();
        if let Some(hook) = hook {
            hook(&self.id, &self.owner, reason);
        }

        self.broadcaster.close(reason);
        *self.state.write() = SessionState::Closed;
        tracing::info!(session = %self.id, %reason, "session closed");
        true
    }

    fn arm_keep_alive(&self) -> u64 {
        self.keep_alive_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Close after `grace` unless a channel attaches first.
    fn start_keep_alive(self: &Arc<Self>, grace: Duration) {
        let generation = self.arm_keep_alive();
        tracing::debug!(session = %self.id, grace_secs = grace.as_secs(), "no channels left, keeping alive");
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if session.keep_alive_expired(generation) {
                session.close(CloseReason::LastChannelDetached).await;
            }
        });
    }

    fn keep_alive_expired(&self, generation: u64) -> bool {
        self.keep_alive_generation.load(Ordering::Acquire) == generation && self.channel_count() == 0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let stats = self.broadcaster.stats();
        let (cols, rows) = *self.size.lock();
        SessionSnapshot {
            id: self.id.clone(),
            backend: self.backend,
            command: self.command.clone(),
            pid: self.pid(),
            state: self.state(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            cols,
            rows,
            channels: stats.channels,
            primary: stats.primary,
            buffer_bytes: stats.buffer_bytes,
            total_bytes: stats.total_bytes,
            block_state: stats.block_state,
            block_reason: stats.block_reason,
        }
    }

    fn broadcast_error(&self, err: BroadcastError, channel: &ChannelId) -> SessionError {
        match err {
            BroadcastError::Closed => SessionError::Closed(self.id.clone()),
            BroadcastError::NotAttached => SessionError::NotAttached {
                session: self.id.clone(),
                channel: channel.clone(),
            },
        }
    }
}

struct Registry {
    sessions: HashMap<String, Arc<TerminalSession>>,
    closed: HashMap<String, OwnerInfo>,
    closed_order: VecDeque<String>,
    retention: usize,
}

impl Registry {
    fn remember_closed(&mut self, id: &str, owner: OwnerInfo) {
        if self.retention == 0 {
            return;
        }
        if self.closed.insert(id.to_string(), owner).is_none() {
            self.closed_order.push_back(id.to_string());
        }
        while self.closed_order.len() > self.retention {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

struct FactoryInner {
    config: EngineConfig,
    gesture: Gesture,
    scanner: Option<Arc<ThreatScanner>>,
    advisory: Option<Advisory>,
    spawner: Arc<dyn ControllerSpawner>,
    registry: RwLock<Registry>,
    /// Per-id creation locks, so concurrent requests for one id spawn once.
    creating: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl FactoryInner {
    fn retire(&self, id: &str, owner: &OwnerInfo, reason: CloseReason) {
        {
            let mut registry = self.registry.write();
            registry.sessions.remove(id);
            registry.remember_closed(id, owner.clone());
        }
        let _ = self.events_tx.send(SessionEvent::Destroyed {
            id: id.to_string(),
            reason,
        });
    }
}

/// Builder for [`SessionFactory`].
pub struct FactoryBuilder {
    config: EngineConfig,
    spawner: Arc<dyn ControllerSpawner>,
    advisor: Option<Arc<dyn AdvisoryScanner>>,
}

impl FactoryBuilder {
    /// Replace the controller spawner (tests use fakes).
    pub fn spawner(mut self, spawner: Arc<dyn ControllerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Install an external advisory scanner. Only consulted when
    /// `scanner.advisory` is enabled.
    pub fn advisor(mut self, advisor: Arc<dyn AdvisoryScanner>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn build(self) -> Result<SessionFactory, ConfigError> {
        self.config.validate()?;
        let gesture = self.config.gesture()?;
        let scanner = if self.config.scanner.enabled {
            let scanner = ThreatScanner::from_config(&self.config.scanner)?;
            tracing::debug!(rules = scanner.rule_count(), "threat scanner ready");
            Some(Arc::new(scanner))
        } else {
            tracing::warn!("output scanning disabled");
            None
        };
        let advisory = match self.advisor {
            Some(scanner) if self.config.scanner.enabled && self.config.scanner.advisory => Some(Advisory {
                scanner,
                timeout: self.config.advisory_timeout(),
            }),
            _ => None,
        };
        let (events_tx, _) = broadcast::channel(64);
        let retention = self.config.closed_retention;

        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                config: self.config,
                gesture,
                scanner,
                advisory,
                spawner: self.spawner,
                registry: RwLock::new(Registry {
                    sessions: HashMap::new(),
                    closed: HashMap::new(),
                    closed_order: VecDeque::new(),
                    retention,
                }),
                creating: Mutex::new(HashMap::new()),
                events_tx,
            }),
        })
    }
}

/// Creates, finds and retires sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn builder(config: EngineConfig) -> FactoryBuilder {
        FactoryBuilder {
            config,
            spawner: Arc::new(PtySpawner),
            advisor: None,
        }
    }

    /// Factory with real pty children and no advisory scanner.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn gesture(&self) -> &Gesture {
        &self.inner.gesture
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.inner.registry.read().sessions.get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.registry.read().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` belongs to a session that has closed.
    pub fn is_retired(&self, id: &str) -> bool {
        self.inner.registry.read().closed.contains_key(id)
    }

    /// Return the open session for the request's id, or spawn it.
    pub async fn get_or_create(&self, request: CreateRequest) -> Result<Arc<TerminalSession>, SessionError> {
        let id = match &request.id {
            Some(id) => {
                validate_session_id(id).map_err(SessionError::InvalidId)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        if let Some(session) = self.lookup_for_create(&id, request.identity.as_deref())? {
            return Ok(session);
        }

        let lock = {
            let mut creating = self.inner.creating.lock();
            Arc::clone(creating.entry(id.clone()).or_default())
        };
        let guard = lock.lock().await;
        let result = match self.lookup_for_create(&id, request.identity.as_deref()) {
            Ok(Some(session)) => Ok(session),
            Ok(None) => self.spawn_session(id.clone(), request).await,
            Err(err) => Err(err),
        };
        drop(guard);

        {
            let mut creating = self.inner.creating.lock();
            // Map entry plus ours: nobody else is waiting on it.
            let ours = creating.get(&id).is_some_and(|l| Arc::ptr_eq(l, &lock));
            if ours && Arc::strong_count(&lock) <= 2 {
                creating.remove(&id);
            }
        }
        result
    }

    fn lookup_for_create(&self, id: &str, identity: Option<&str>) -> Result<Option<Arc<TerminalSession>>, SessionError> {
        let registry = self.inner.registry.read();
        let owner = match registry.sessions.get(id) {
            Some(session) if !session.is_closed() => return Ok(Some(Arc::clone(session))),
            // Closing but not yet retired.
            Some(session) => session.owner(),
            None => match registry.closed.get(id) {
                Some(owner) => owner,
                None => return Ok(None),
            },
        };
        Err(if owner.matches(identity) {
            SessionError::AlreadyClosed(id.to_string())
        } else {
            SessionError::NotYourSession(id.to_string())
        })
    }

    async fn spawn_session(&self, id: String, request: CreateRequest) -> Result<Arc<TerminalSession>, SessionError> {
        let config = &self.inner.config;
        let launch = LaunchSpec::resolve(request.backend, config, &id, request.cwd.clone(), &request.env)?;
        let controller = self.inner.spawner.spawn(&launch);

        let mut broadcaster = OutputBroadcaster::new(
            id.clone(),
            SessionBuffer::new(config.history_limit),
            ScanWindow::new(config.scanner.carry_limit),
            config.chunk_size,
            self.inner.gesture.clone(),
        );
        if let Some(scanner) = &self.inner.scanner {
            broadcaster = broadcaster.with_scanner(scanner.clone());
        }
        if let Some(advisory) = &self.inner.advisory {
            broadcaster = broadcaster.with_advisory(advisory.clone());
        }

        let session = Arc::new(TerminalSession::new(
            &launch,
            id.clone(),
            request.backend,
            request.owner,
            controller,
            Arc::new(broadcaster),
            config,
        ));

        // Installed before start so an instant child exit still retires the id.
        let factory: Weak<FactoryInner> = Arc::downgrade(&self.inner);
        session.set_on_closed(Box::new(move |id, owner, reason| {
            if let Some(inner) = factory.upgrade() {
                inner.retire(id, owner, reason);
            }
        }));

        if let Err(err) = session.start(request.cols, request.rows).await {
            tracing::warn!(session = %id, %err, "session failed to start");
            return Err(err);
        }

        let registered = {
            let mut registry = self.inner.registry.write();
            // The closed flag is set before the retire hook runs, so checking
            // it under the registry lock never resurrects a retired id.
            // Retiring takes the same lock, so Created always precedes
            // Destroyed.
            let open = !session.is_closed();
            if open {
                registry.sessions.insert(id.clone(), Arc::clone(&session));
                let _ = self.inner.events_tx.send(SessionEvent::Created {
                    id: id.clone(),
                    backend: request.backend,
                });
            }
            open
        };
        if !registered {
            tracing::info!(session = %id, "session closed before it was registered");
            return Err(SessionError::Closed(id));
        }
        Ok(session)
    }

    fn session(&self, id: &str) -> Result<Arc<TerminalSession>, SessionError> {
        let registry = self.inner.registry.read();
        match registry.sessions.get(id) {
            Some(session) => Ok(Arc::clone(session)),
            None if registry.closed.contains_key(id) => Err(SessionError::Closed(id.to_string())),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub fn attach(&self, id: &str, channel: ChannelId, sink: ChannelSink) -> Result<AttachAck, SessionError> {
        self.session(id)?.attach(channel, sink)
    }

    pub async fn write(&self, id: &str, channel: &ChannelId, data: Bytes) -> Result<WriteOutcome, SessionError> {
        let session = self.session(id)?;
        session.write(channel, data).await
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.session(id)?.resize(cols, rows)
    }

    pub fn focus(&self, id: &str, channel: &ChannelId) -> Result<(), SessionError> {
        self.session(id)?.focus(channel)
    }

    pub fn unlock_gesture(&self, id: &str, actor: &ChannelId) -> Result<BlockState, SessionError> {
        self.session(id)?.unlock_gesture(actor)
    }

    /// Detach a channel. When it was the last one the session closes, or,
    /// with a keep-alive configured, closes once the grace period passes
    /// without a new attach.
    pub async fn detach(&self, id: &str, channel: &ChannelId) -> Result<(), SessionError> {
        let session = self.session(id)?;
        let departure = session.detach(channel).ok_or_else(|| SessionError::NotAttached {
            session: id.to_string(),
            channel: channel.clone(),
        })?;
        if !departure.now_empty {
            return Ok(());
        }

        match session.keep_alive {
            None => {
                session.close(CloseReason::LastChannelDetached).await;
            }
            Some(grace) => session.start_keep_alive(grace),
        }
        Ok(())
    }

    /// Close a session. Closing an already closed session is a no-op.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        match self.session(id) {
            Ok(session) => {
                session.close(CloseReason::Requested).await;
                Ok(())
            }
            Err(SessionError::Closed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<TerminalSession>> =
            self.inner.registry.read().sessions.values().cloned().collect();
        let mut snapshots: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Close every session concurrently.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<TerminalSession>> =
            self.inner.registry.read().sessions.values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "shutting down all sessions");
        futures::future::join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id("build-42_a.b").is_ok());
        assert!(validate_session_id(&"x".repeat(64)).is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("café").is_err());
    }

    #[test]
    fn test_owner_matching_is_exact() {
        let owner = OwnerInfo {
            remote_addr: Some("10.0.0.5".into()),
            label: Some("alice".into()),
        };
        assert!(owner.matches(Some("alice")));
        assert!(owner.matches(Some("10.0.0.5")));
        assert!(!owner.matches(Some("Alice")));
        assert!(!owner.matches(Some("10.0.0")));
        assert!(!owner.matches(None));
        assert!(!OwnerInfo::default().matches(None));
    }

    #[test]
    fn test_closed_retention_evicts_oldest() {
        let mut registry = Registry {
            sessions: HashMap::new(),
            closed: HashMap::new(),
            closed_order: VecDeque::new(),
            retention: 2,
        };
        registry.remember_closed("a", OwnerInfo::default());
        registry.remember_closed("b", OwnerInfo::default());
        registry.remember_closed("a", OwnerInfo::default());
        registry.remember_closed("c", OwnerInfo::default());
        assert!(!registry.closed.contains_key("a"));
        assert!(registry.closed.contains_key("b"));
        assert!(registry.closed.contains_key("c"));
        assert_eq!(registry.closed_order.len(), 2);
    }

    #[test]
    fn test_builder_rejects_bad_gesture() {
        let mut config = EngineConfig::default();
        config.scanner.unlock_gesture = "meta+x".into();
        assert!(matches!(SessionFactory::new(config), Err(ConfigError::Gesture(_))));
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let factory = SessionFactory::new(EngineConfig::default()).unwrap();
        let c = ChannelId::from("c1");
        assert!(matches!(factory.resize("nope", 80, 24), Err(SessionError::NotFound(_))));
        assert!(matches!(
            factory.write("nope", &c, Bytes::from_static(b"x")).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(factory.close("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(
            factory.get_or_create(CreateRequest::with_id("bad id")).await,
            Err(SessionError::InvalidId(_))
        ));
    }
}
