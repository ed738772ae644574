//! Output fan-out for one session.
//!
//! The [`OutputBroadcaster`] owns everything the read loop and the attach
//! path must agree on: the history buffer, the channel membership and sinks,
//! the scan window and the block policy. All of it sits behind one lock, so
//! an attaching channel sees its replay strictly before any live chunk
//! produced after it, and every channel sees chunks in production order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

use crate::buffer::SessionBuffer;
use crate::channel::{split_chunks, ChannelEvent, ChannelId, ChannelMessage, ChannelSink, CloseReason};
use crate::input::Gesture;
use crate::membership::{ChannelMembership, Departure};
use crate::policy::{BlockPolicy, BlockState, InputDecision};
use crate::scanner::{merge_verdicts, AdvisoryScanner, OutputClassifier, ScanVerdict, ScanWindow};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("session is closed")]
    Closed,
    #[error("channel is not attached")]
    NotAttached,
}

/// Where a chunk of channel input should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRoute {
    /// Deliver to the child.
    Forward,
    /// Sender is an observer; accepted and discarded.
    Dropped,
    /// Consumed by the block policy.
    Intercepted,
}

/// Outcome of an attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub primary: bool,
    pub replayed: usize,
    pub block_state: BlockState,
}

/// Point-in-time view for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub channels: usize,
    pub primary: Option<ChannelId>,
    pub buffer_bytes: usize,
    pub total_bytes: u64,
    pub block_state: BlockState,
    pub block_reason: Option<String>,
}

/// Optional external classifier and its time budget.
#[derive(Clone)]
pub struct Advisory {
    pub scanner: Arc<dyn AdvisoryScanner>,
    pub timeout: Duration,
}

impl std::fmt::Debug for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advisory").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct State {
    buffer: SessionBuffer,
    membership: ChannelMembership,
    sinks: HashMap<ChannelId, ChannelSink>,
    policy: BlockPolicy,
    window: ScanWindow,
    closed: bool,
    /// Set when dropping a stalled channel left nobody attached.
    emptied: bool,
}

#[derive(Debug)]
pub struct OutputBroadcaster {
    session: String,
    state: Mutex<State>,
    scanner: Option<Arc<dyn OutputClassifier>>,
    advisory: Option<Advisory>,
    gesture: Gesture,
    chunk_size: usize,
}

impl OutputBroadcaster {
    pub fn new(
        session: impl Into<String>,
        buffer: SessionBuffer,
        window: ScanWindow,
        chunk_size: usize,
        gesture: Gesture,
    ) -> Self {
        Self {
            session: session.into(),
            state: Mutex::new(State {
                buffer,
                membership: ChannelMembership::new(),
                sinks: HashMap::new(),
                policy: BlockPolicy::new(),
                window,
                closed: false,
                emptied: false,
            }),
            scanner: None,
            advisory: None,
            gesture,
            chunk_size,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn OutputClassifier>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_advisory(mut self, advisory: Advisory) -> Self {
        self.advisory = Some(advisory);
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn gesture(&self) -> &Gesture {
        &self.gesture
    }

    /// Append a chunk from the child, scan it and fan it out.
    pub fn publish(self: &Arc<Self>, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.buffer.append(&chunk);

        let mut scanned = None;
        let mut block_event = None;
        if let Some(scanner) = &self.scanner {
            let (text, from) = state.window.feed(&chunk);
            let verdict = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                scanner.classify(&text, from)
            }))
            .unwrap_or_else(|panic| {
                tracing::error!(session = %self.session, ?panic, "scanner panicked, passing output through");
                ScanVerdict::safe()
            });
            if !verdict.is_safe() {
                tracing::debug!(
                    session = %self.session,
                    severity = %verdict.severity,
                    markers = ?verdict.markers,
                    "scanner match"
                );
            }
            block_event = state.policy.on_verdict(&verdict, &self.gesture);
            scanned = Some((text, verdict));
        }

        for piece in split_chunks(&chunk, self.chunk_size) {
            self.fan_out(&mut state, ChannelEvent::Output(piece));
        }
        if let Some(event) = block_event {
            tracing::warn!(
                session = %self.session,
                reason = state.policy.reason().unwrap_or_default(),
                "input blocked"
            );
            self.fan_out(&mut state, event);
        }
        drop(state);

        if let (Some(advisory), Some((text, local))) = (&self.advisory, scanned) {
            // A local block already decides the outcome.
            if !local.should_block && !text.trim().is_empty() {
                self.request_advice(advisory.clone(), text, local);
            }
        }
    }

    /// Ask the external classifier off the hot path and apply its verdict
    /// when it arrives.
    fn request_advice(self: &Arc<Self>, advisory: Advisory, text: String, local: ScanVerdict) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::time::timeout(advisory.timeout, advisory.scanner.advise(&text)).await {
                Ok(Ok(external)) => {
                    let merged = merge_verdicts(&local, &external);
                    this.apply_verdict(&merged);
                }
                Ok(Err(err)) => {
                    tracing::warn!(session = %this.session, %err, "advisory scan failed");
                }
                Err(_) => {
                    tracing::warn!(
                        session = %this.session,
                        timeout_ms = advisory.timeout.as_millis() as u64,
                        "advisory scan timed out"
                    );
                }
            }
        });
    }

    /// Apply a verdict produced outside the read loop.
    pub fn apply_verdict(&self, verdict: &ScanVerdict) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(event) = state.policy.on_verdict(verdict, &self.gesture) {
            tracing::warn!(
                session = %self.session,
                reason = state.policy.reason().unwrap_or_default(),
                "input blocked by late verdict"
            );
            self.fan_out(&mut state, event);
        }
    }

    /// Attach a channel and deliver the history replay to it alone.
    ///
    /// Re-attaching an attached channel replaces its sink, as after a
    /// reconnect.
    pub fn attach(&self, channel: ChannelId, sink: ChannelSink) -> Result<Attached, BroadcastError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BroadcastError::Closed);
        }
        if !state.membership.attach(channel.clone()) {
            tracing::debug!(session = %self.session, channel = %channel, "channel re-attached");
        }

        let history = state.buffer.snapshot();
        let replayed = history.len();
        if !history.is_empty() {
            self.send(&sink, ChannelEvent::Replay(split_chunks(&history, self.chunk_size)));
        }
        if let Some(event) = state.policy.current_event(&self.gesture) {
            self.send(&sink, event);
        }
        state.sinks.insert(channel.clone(), sink);

        Ok(Attached {
            primary: state.membership.is_primary(&channel),
            replayed,
            block_state: state.policy.state(),
        })
    }

    pub fn detach(&self, channel: &ChannelId) -> Option<Departure> {
        let mut state = self.state.lock();
        state.sinks.remove(channel);
        let departure = state.membership.detach(channel)?;
        if let Some(primary) = &departure.new_primary {
            tracing::info!(session = %self.session, channel = %primary, "primary reassigned");
        }
        Some(departure)
    }

    pub fn focus(&self, channel: &ChannelId) -> Result<(), BroadcastError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BroadcastError::Closed);
        }
        if state.membership.focus(channel) {
            Ok(())
        } else {
            Err(BroadcastError::NotAttached)
        }
    }

    /// Decide what happens to input from `channel`.
    ///
    /// Observer input is dropped. Primary input goes through the block
    /// policy, which may swallow it and push banners.
    pub fn route_input(&self, channel: &ChannelId, data: &[u8]) -> Result<InputRoute, BroadcastError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BroadcastError::Closed);
        }
        if !state.membership.contains(channel) {
            return Err(BroadcastError::NotAttached);
        }
        if !state.membership.is_primary(channel) {
            return Ok(InputRoute::Dropped);
        }

        match state.policy.handle_input(data, &self.gesture) {
            InputDecision::Forward => Ok(InputRoute::Forward),
            InputDecision::Reject { .. } => {
                if let Some(event) = state.policy.current_event(&self.gesture) {
                    let stalled = state.sinks.get(channel).is_some_and(|sink| !self.send(sink, event));
                    if stalled {
                        self.evict(&mut state, channel);
                    }
                }
                Ok(InputRoute::Intercepted)
            }
            InputDecision::Transition { from, to, event } => {
                tracing::info!(session = %self.session, channel = %channel, %from, %to, "block state changed");
                self.fan_out(&mut state, event);
                Ok(InputRoute::Intercepted)
            }
        }
    }

    /// Feed the unlock gesture on behalf of `actor`.
    pub fn unlock_gesture(&self, actor: &ChannelId) -> Result<BlockState, BroadcastError> {
        let gesture = self.gesture.bytes().to_vec();
        self.route_input(actor, &gesture)?;
        Ok(self.block_state())
    }

    /// Send the closure sentinel to every channel and drop them all.
    /// Only the first call has any effect.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.fan_out(&mut state, ChannelEvent::Closed(reason));
        state.membership.clear();
        state.sinks.clear();
        state.window.reset();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn block_state(&self) -> BlockState {
        self.state.lock().policy.state()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().membership.len()
    }

    pub fn is_primary(&self, channel: &ChannelId) -> bool {
        self.state.lock().membership.is_primary(channel)
    }

    pub fn history(&self) -> Bytes {
        self.state.lock().buffer.snapshot()
    }

    pub fn stats(&self) -> BroadcastStats {
        let state = self.state.lock();
        BroadcastStats {
            channels: state.membership.len(),
            primary: state.membership.primary().cloned(),
            buffer_bytes: state.buffer.len(),
            total_bytes: state.buffer.total_appended(),
            block_state: state.policy.state(),
            block_reason: state.policy.reason().map(str::to_string),
        }
    }

    /// Whether dropping a stalled channel has left the session without
    /// channels since the last call.
    pub fn take_emptied(&self) -> bool {
        std::mem::take(&mut self.state.lock().emptied)
    }

    /// Send to members in attach order. Channels whose queue is full are
    /// dropped afterwards.
    fn fan_out(&self, state: &mut State, event: ChannelEvent) {
        let mut stalled = Vec::new();
        for channel in state.membership.members() {
            if let Some(sink) = state.sinks.get(channel) {
                if !self.send(sink, event.clone()) {
                    stalled.push(channel.clone());
                }
            }
        }
        for channel in stalled {
            self.evict(state, &channel);
        }
    }

    /// Drop a channel that stopped reading. Its receiver ends once the
    /// queued messages are consumed.
    fn evict(&self, state: &mut State, channel: &ChannelId) {
        state.sinks.remove(channel);
        let Some(departure) = state.membership.detach(channel) else {
            return;
        };
        tracing::warn!(session = %self.session, channel = %channel, "channel queue full, dropping channel");
        if let Some(primary) = &departure.new_primary {
            tracing::info!(session = %self.session, channel = %primary, "primary reassigned");
        }
        if departure.now_empty {
            state.emptied = true;
        }
    }

    /// Queue one message. Returns `false` only when the channel's queue is
    /// full; a dropped receiver is left for the transport to detach.
    fn send(&self, sink: &ChannelSink, event: ChannelEvent) -> bool {
        let message = ChannelMessage {
            session: self.session.clone(),
            event,
        };
        match sink.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session = %self.session, "channel receiver dropped");
                true
            }
        }
    }
}
