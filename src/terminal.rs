//! The local controlling terminal.

use std::io::Write;

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled, size};
use thiserror::Error;

/// Size used when the local terminal cannot be queried.
pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),

    #[error("failed to write to terminal: {0}")]
    Write(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Raw mode turns off line buffering and echo so every keystroke (Ctrl+C
/// included) reaches us first. Dropping the guard, even while unwinding,
/// restores cooked mode. If raw mode was already on, the guard leaves it on.
pub struct RawModeGuard {
    restore: bool,
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        let already = is_raw_mode_enabled().unwrap_or(false);
        if !already {
            enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        }
        Ok(Self { restore: !already })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.restore {
            if let Err(err) = disable_raw_mode() {
                tracing::warn!(?err, "failed to restore terminal mode");
            }
        }
    }
}

/// Current terminal size as `(cols, rows)`, the order the pty controller takes.
pub fn terminal_size() -> Result<(u16, u16), TerminalError> {
    let (cols, rows) = size().map_err(TerminalError::Size)?;
    Ok((cols, rows))
}

/// [`terminal_size`], or [`FALLBACK_SIZE`] when stdout is not a terminal or
/// reports a zero dimension.
pub fn terminal_size_or_default() -> (u16, u16) {
    match terminal_size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        Ok(_) => FALLBACK_SIZE,
        Err(err) => {
            tracing::debug!(%err, "using fallback terminal size");
            FALLBACK_SIZE
        }
    }
}

/// Write bytes to stdout and flush.
pub fn write_stdout(data: &[u8]) -> Result<(), TerminalError> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(data).map_err(TerminalError::Write)?;
    stdout.flush().map_err(TerminalError::Write)
}
