//! Input block policy.
//!
//! A per-session state machine that suspends input delivery when the
//! scanner flags dangerous output:
//!
//! ```text
//!   OPEN --blocking verdict--> BLOCKED --gesture--> AWAITING_UNLOCK --gesture--> OPEN
//!                                 ^                        |
//!                                 +------other input-------+
//! ```
//!
//! No other transition exists. The same machine drives both the server-side
//! sessions and the local watch mode.

use std::time::SystemTime;

use serde::Serialize;

use crate::channel::ChannelEvent;
use crate::input::Gesture;
use crate::scanner::ScanVerdict;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    #[default]
    Open,
    Blocked,
    AwaitingUnlock,
}

impl BlockState {
    pub fn is_open(self) -> bool {
        self == BlockState::Open
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockState::Open => "open",
            BlockState::Blocked => "blocked",
            BlockState::AwaitingUnlock => "awaiting_unlock",
        };
        f.write_str(s)
    }
}

/// What to do with one chunk of input from the authorized actor.
#[derive(Debug, Clone, PartialEq)]
pub enum InputDecision {
    /// Deliver to the child.
    Forward,
    /// Swallow the input and show `banner` to the actor only.
    Reject { banner: String },
    /// The input was (part of) the unlock gesture. Swallow it and broadcast
    /// `event` to every channel.
    Transition { from: BlockState, to: BlockState, event: ChannelEvent },
}

#[derive(Debug, Default)]
pub struct BlockPolicy {
    state: BlockState,
    reason: Option<String>,
    markers: Vec<String>,
    since: Option<SystemTime>,
}

impl BlockPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// When the current block began.
    pub fn blocked_since(&self) -> Option<SystemTime> {
        self.since
    }

    /// Feed a scanner verdict. Only `OPEN` reacts: returns the `Blocked`
    /// event to broadcast when the verdict asks for a block.
    pub fn on_verdict(&mut self, verdict: &ScanVerdict, gesture: &Gesture) -> Option<ChannelEvent> {
        if !verdict.should_block || self.state != BlockState::Open {
            return None;
        }
        self.state = BlockState::Blocked;
        self.reason = Some(
            verdict
                .reason
                .clone()
                .unwrap_or_else(|| format!("{} severity output", verdict.severity)),
        );
        self.markers = verdict.markers.clone();
        self.since = Some(SystemTime::now());
        Some(self.blocked_event(gesture))
    }

    /// Route one chunk of input from the authorized actor.
    pub fn handle_input(&mut self, data: &[u8], gesture: &Gesture) -> InputDecision {
        let is_gesture = gesture.matches(data);
        match (self.state, is_gesture) {
            (BlockState::Open, _) => InputDecision::Forward,
            (BlockState::Blocked, true) => {
                self.state = BlockState::AwaitingUnlock;
                InputDecision::Transition {
                    from: BlockState::Blocked,
                    to: BlockState::AwaitingUnlock,
                    event: self.blocked_event(gesture),
                }
            }
            (BlockState::Blocked, false) => InputDecision::Reject {
                banner: self.banner(gesture),
            },
            (BlockState::AwaitingUnlock, true) => {
                self.state = BlockState::Open;
                self.reason = None;
                self.markers.clear();
                self.since = None;
                InputDecision::Transition {
                    from: BlockState::AwaitingUnlock,
                    to: BlockState::Open,
                    event: ChannelEvent::Unblocked,
                }
            }
            (BlockState::AwaitingUnlock, false) => {
                self.state = BlockState::Blocked;
                InputDecision::Transition {
                    from: BlockState::AwaitingUnlock,
                    to: BlockState::Blocked,
                    event: self.blocked_event(gesture),
                }
            }
        }
    }

    /// The event describing the current block, or `None` when open.
    pub fn current_event(&self, gesture: &Gesture) -> Option<ChannelEvent> {
        (!self.state.is_open()).then(|| self.blocked_event(gesture))
    }

    pub fn banner(&self, gesture: &Gesture) -> String {
        render_banner(
            self.reason.as_deref().unwrap_or("dangerous output"),
            &self.markers,
            &gesture.label(),
            self.state == BlockState::AwaitingUnlock,
        )
    }

    fn blocked_event(&self, gesture: &Gesture) -> ChannelEvent {
        ChannelEvent::Blocked {
            reason: self.reason.clone().unwrap_or_default(),
            markers: self.markers.clone(),
            required_gesture: gesture.label(),
            awaiting_confirmation: self.state == BlockState::AwaitingUnlock,
            banner: self.banner(gesture),
        }
    }
}

const RED_BG: &str = "\x1b[1;37;41m";
const YELLOW: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Terminal banner shown while input is suspended.
pub fn render_banner(reason: &str, markers: &[String], gesture: &str, awaiting: bool) -> String {
    let mut out = String::new();
    out.push_str("\r\n");
    out.push_str(RED_BG);
    out.push_str(" INPUT BLOCKED ");
    out.push_str(RESET);
    out.push(' ');
    out.push_str(reason);
    out.push_str("\r\n");
    for marker in markers.iter().filter(|m| m.as_str() != reason) {
        out.push_str("  - ");
        out.push_str(marker);
        out.push_str("\r\n");
    }
    out.push_str(YELLOW);
    if awaiting {
        out.push_str(&format!("Press {gesture} again to confirm unlock, any other key to cancel."));
    } else {
        out.push_str(&format!("Press {gesture} to unlock input."));
    }
    out.push_str(RESET);
    out.push_str("\r\n");
    out
}
