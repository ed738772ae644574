//! shellguard: a terminal session engine.
//!
//! One pty-backed process per session, shared by any number of client
//! channels. Channels joining mid-stream get the history replayed, a single
//! primary channel holds typing rights, and a scanner over the output can
//! suspend input until the operator performs an unlock gesture.

pub mod broker;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod input;
pub mod membership;
pub mod policy;
pub mod pty;
pub mod scanner;
pub mod session;
pub mod terminal;
pub mod watch;

pub use channel::{ChannelEvent, ChannelId, ChannelMessage, CloseReason};
pub use config::EngineConfig;
pub use session::{CreateRequest, SessionError, SessionFactory, WriteOutcome};
