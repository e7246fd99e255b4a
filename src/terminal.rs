use crossterm::terminal::{disable_raw_mode, enable_raw_mode, is_raw_mode_enabled};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for console raw mode.
///
/// Used by the console keyboard source: while the guard lives, keys arrive
/// one at a time, unechoed, and Ctrl+C is delivered as a key instead of
/// being handled by the console. Dropping the guard (also during a panic)
/// puts the console back the way it was.
pub struct RawModeGuard {
    was_raw: bool,
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        let was_raw = is_raw_mode_enabled().unwrap_or(false);
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { was_raw })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if !self.was_raw {
            let _ = disable_raw_mode();
        }
    }
}
