//! Client channels and the events the engine pushes to them.
//!
//! A channel is one client connection. The transport that owns the
//! connection hands the engine a [`ChannelSink`] when it attaches; every
//! outbound event for that channel (live output, history replay, block
//! banners, closure) arrives on the matching receiver tagged with the session
//! it belongs to, since one channel may be attached to several sessions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::policy::BlockState;

/// Opaque identifier for a client channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random channel id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called explicitly.
    Requested,
    /// The child process exited on its own.
    ChildExited,
    /// The last channel detached under the close-on-empty policy (or its
    /// keep-alive grace period ran out).
    LastChannelDetached,
    /// Writing to or reading from the pty failed.
    IoFailure,
    /// The engine is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Requested => "requested",
            CloseReason::ChildExited => "child exited",
            CloseReason::LastChannelDetached => "last channel detached",
            CloseReason::IoFailure => "pty i/o failure",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An outbound event for one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Live output, at most one fan-out chunk in size.
    Output(Bytes),
    /// The session history at attach time, split into transport-safe pieces.
    /// Sent at most once per attach, before any live output.
    Replay(Vec<Bytes>),
    /// Input is suspended until the unlock gesture is performed.
    Blocked {
        reason: String,
        markers: Vec<String>,
        required_gesture: String,
        /// `true` once the first gesture was seen and a confirming second one
        /// is expected.
        awaiting_confirmation: bool,
        /// Human-readable banner, ready to be written to a terminal.
        banner: String,
    },
    /// Input delivery resumed.
    Unblocked,
    /// Sentinel: the session is gone and no further events will follow.
    Closed(CloseReason),
}

/// An event tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub session: String,
    pub event: ChannelEvent,
}

/// Messages a channel may have queued before it counts as stalled.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Sending half handed to the engine on attach.
///
/// Bounded; the engine only ever `try_send`s under the session lock, and a
/// channel whose queue is full is dropped from the session.
pub type ChannelSink = mpsc::Sender<ChannelMessage>;

/// Receiving half kept by the transport. Yields `None` once the engine has
/// let go of the channel.
pub type ChannelReceiver = mpsc::Receiver<ChannelMessage>;

/// Create a connected sink/receiver pair for a new channel.
pub fn channel_pair() -> (ChannelSink, ChannelReceiver) {
    channel_pair_with_capacity(CHANNEL_CAPACITY)
}

pub fn channel_pair_with_capacity(capacity: usize) -> (ChannelSink, ChannelReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Result of an attach call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachAck {
    pub session: String,
    pub channel: ChannelId,
    /// Whether this channel now holds typing rights.
    pub primary: bool,
    /// Bytes delivered in the replay event (0 means no replay was sent).
    pub replayed: usize,
    pub block_state: BlockState,
}

/// Split `data` into pieces of at most `max` bytes, preserving order.
///
/// Cut points are moved back (by at most three bytes) when they would land
/// inside a UTF-8 sequence, so text-decoding clients see whole characters.
pub fn split_chunks(data: &Bytes, max: usize) -> Vec<Bytes> {
    if max == 0 || data.len() <= max {
        return vec![data.clone()];
    }
    let mut pieces = Vec::with_capacity(data.len() / max + 1);
    let mut start = 0;
    while start < data.len() {
        let mut end = (start + max).min(data.len());
        if end < data.len() {
            let mut back = 0;
            while back < 3 && end - back > start + 1 && (data[end - back] & 0xC0) == 0x80 {
                back += 1;
            }
            if (data[end - back] & 0xC0) != 0x80 {
                end -= back;
            }
        }
        pieces.push(data.slice(start..end));
        start = end;
    }
    pieces
}
