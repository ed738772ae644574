//! Local client: the controlling terminal as the primary channel of a
//! managed session.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{channel_pair, ChannelEvent, ChannelId, CloseReason};
use crate::session::{CreateRequest, SessionError, SessionFactory, WriteOutcome};
use crate::terminal::{self, RawModeGuard, TerminalError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),
}

/// Run a session in the foreground until it closes or stdin ends.
///
/// Returns why the session ended from this client's point of view.
pub async fn run_local(factory: &SessionFactory, mut request: CreateRequest) -> Result<CloseReason, ClientError> {
    let (cols, rows) = terminal::terminal_size_or_default();
    request.cols = cols;
    request.rows = rows;

    let session = factory.get_or_create(request).await?;
    let id = session.id().to_string();
    let channel = ChannelId::generate();
    let (sink, mut events) = channel_pair();

    let _raw = RawModeGuard::new()?;
    let ack = factory.attach(&id, channel.clone(), sink)?;
    tracing::debug!(session = %id, primary = ack.primary, replayed = ack.replayed, "attached local terminal");

    // Channel for stdin data from the blocking reader
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    // Channel for SIGWINCH signals
    let (winch_tx, mut winch_rx) = mpsc::channel::<(u16, u16)>(4);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(err) => {
                tracing::debug!(?err, "SIGWINCH handler unavailable");
                return;
            }
        };
        while sigwinch.recv().await.is_some() {
            if let Ok(size) = terminal::terminal_size() {
                if winch_tx.send(size).await.is_err() {
                    break;
                }
            }
        }
    });

    let reason = loop {
        tokio::select! {
            message = events.recv() => {
                let Some(message) = message else {
                    // No sentinel: the engine dropped this terminal for
                    // falling behind on output.
                    tracing::warn!(session = %id, "session stopped sending output to this terminal");
                    break CloseReason::LastChannelDetached;
                };
                match message.event {
                    ChannelEvent::Output(data) => terminal::write_stdout(&data)?,
                    ChannelEvent::Replay(pieces) => {
                        for piece in pieces {
                            terminal::write_stdout(&piece)?;
                        }
                    }
                    ChannelEvent::Blocked { banner, .. } => terminal::write_stdout(banner.as_bytes())?,
                    ChannelEvent::Unblocked => terminal::write_stdout(b"\r\n[input unlocked]\r\n")?,
                    ChannelEvent::Closed(reason) => break reason,
                }
            }

            input = stdin_rx.recv() => {
                let Some(data) = input else {
                    // stdin closed: leave the session to the detach policy.
                    if let Err(err) = factory.detach(&id, &channel).await {
                        tracing::debug!(session = %id, %err, "detach after stdin EOF");
                    }
                    break CloseReason::LastChannelDetached;
                };
                match factory.write(&id, &channel, data).await {
                    Ok(WriteOutcome::Delivered) | Ok(WriteOutcome::Intercepted) => {}
                    Ok(WriteOutcome::Dropped) => tracing::debug!(session = %id, "input dropped, not primary"),
                    Err(SessionError::Closed(_)) => {}
                    Err(err) => tracing::warn!(session = %id, %err, "write failed"),
                }
            }

            Some((cols, rows)) = winch_rx.recv() => {
                if let Err(err) = factory.resize(&id, cols, rows) {
                    tracing::debug!(session = %id, %err, "resize after SIGWINCH");
                }
            }
        }
    };

    tracing::info!(session = %id, %reason, "local session ended");
    Ok(reason)
}
