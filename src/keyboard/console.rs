use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio_util::sync::CancellationToken;

use super::{CharSource, KeyboardError};
use crate::terminal::RawModeGuard;

/// Upper bound on how long a wait for input goes without checking `stop`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Keyboard source for consoles without a POSIX line discipline.
///
/// Puts the console in raw mode and turns key presses into the characters
/// a terminal would have sent. There is no attribute bookkeeping beyond the
/// raw-mode guard.
pub struct ConsoleCharSource {
    _raw: RawModeGuard,
}

impl ConsoleCharSource {
    pub fn open() -> Result<Self, KeyboardError> {
        Ok(Self {
            _raw: RawModeGuard::new()?,
        })
    }
}

impl CharSource for ConsoleCharSource {
    fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError> {
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }
            if !event::poll(POLL_INTERVAL).map_err(KeyboardError::Read)? {
                continue;
            }
            let event = event::read().map_err(KeyboardError::Read)?;
            if let Event::Key(key) = event {
                if key.kind == KeyEventKind::Release {
                    continue;
                }
                if let Some(ch) = key_to_char(&key) {
                    return Ok(Some(ch));
                }
            }
        }
    }
}

/// Map a key press to the character a terminal sends for it.
///
/// Enter yields `\r` like a console does; Ctrl+letter yields the matching
/// control code, so Ctrl+C is ETX. Keys without a single-character encoding
/// (arrows, function keys) map to `None`.
pub fn key_to_char(key: &KeyEvent) -> Option<char> {
    match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            if c.is_ascii_alphabetic() {
                Some(((c.to_ascii_lowercase() as u8) - b'a' + 1) as char)
            } else {
                Some(c)
            }
        }
        KeyCode::Char(c) => Some(c),
        KeyCode::Enter => Some('\r'),
        KeyCode::Tab => Some('\t'),
        KeyCode::Backspace => Some('\u{8}'),
        KeyCode::Esc => Some('\u{1b}'),
        _ => None,
    }
}
