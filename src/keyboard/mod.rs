//! Character-at-a-time keyboard input.
//!
//! A [`CharSource`] yields decoded characters from the local keyboard. There
//! are two implementations: [`PosixCharSource`] drives the termios line
//! discipline directly, [`ConsoleCharSource`] reads key events through
//! crossterm for consoles without one. [`open_char_source`] picks the right
//! one for the platform so nothing downstream has to care.
//!
//! [`KeyboardReader`] pulls from a source on a dedicated thread, paces the
//! characters, and feeds them into the relay's input queue.

mod console;
#[cfg(unix)]
mod posix;

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::interrupt::RelayInput;
use crate::terminal::TerminalError;

pub use console::{key_to_char, ConsoleCharSource};
#[cfg(unix)]
pub use posix::PosixCharSource;

#[derive(Error, Debug)]
pub enum KeyboardError {
    #[error("failed to switch terminal mode: {0}")]
    TerminalMode(#[source] io::Error),

    #[error("failed to read keyboard input: {0}")]
    Read(#[source] io::Error),

    #[error("keyboard input is not valid UTF-8: {0:02x?}")]
    InvalidUtf8(Vec<u8>),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),
}

/// A source of decoded keyboard characters.
///
/// Implementations own whatever terminal state they change and restore it
/// when dropped.
pub trait CharSource: Send {
    /// Block until the next character is available or `stop` is cancelled.
    ///
    /// `Ok(None)` means the input has been closed for good, or the caller
    /// asked to stop. Implementations check `stop` at least every few
    /// milliseconds while waiting.
    fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError>;
}

/// Open the keyboard source for this platform.
pub fn open_char_source() -> Result<Box<dyn CharSource>, KeyboardError> {
    #[cfg(unix)]
    {
        Ok(Box::new(PosixCharSource::open()?))
    }
    #[cfg(not(unix))]
    {
        Ok(Box::new(ConsoleCharSource::open()?))
    }
}

/// Length of the UTF-8 sequence introduced by `first`, or `None` if `first`
/// cannot start a sequence.
fn utf8_sequence_len(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

/// Assemble one character from a byte-at-a-time reader.
///
/// Returns `Ok(None)` if the reader is exhausted before the first byte. A
/// malformed or truncated sequence is an error carrying the bytes seen.
pub(crate) fn read_utf8_char<F>(mut next_byte: F) -> Result<Option<char>, KeyboardError>
where
    F: FnMut() -> Result<Option<u8>, KeyboardError>,
{
    let Some(first) = next_byte()? else {
        return Ok(None);
    };
    let len = utf8_sequence_len(first).ok_or_else(|| KeyboardError::InvalidUtf8(vec![first]))?;

    let mut bytes = Vec::with_capacity(len);
    bytes.push(first);
    while bytes.len() < len {
        match next_byte()? {
            Some(b) => bytes.push(b),
            None => return Err(KeyboardError::InvalidUtf8(bytes)),
        }
    }

    match std::str::from_utf8(&bytes) {
        Ok(s) => Ok(s.chars().next()),
        Err(_) => Err(KeyboardError::InvalidUtf8(bytes)),
    }
}

/// Pulls characters from a [`CharSource`] and forwards them to the relay.
pub struct KeyboardReader {
    source: Box<dyn CharSource>,
    character_delay: Duration,
}

impl KeyboardReader {
    pub fn new(source: Box<dyn CharSource>, character_delay: Duration) -> Self {
        Self {
            source,
            character_delay,
        }
    }

    /// Blocking read loop; run it on its own thread.
    ///
    /// Each character is queued as [`RelayInput::Typed`], then the loop
    /// sleeps for the character delay. Returns `Ok(())` when the source is
    /// exhausted, `stop` is cancelled, or the queue's receiver is gone. The
    /// source is dropped on every exit path, restoring the terminal.
    pub fn run(mut self, tx: mpsc::Sender<RelayInput>, stop: &CancellationToken) -> Result<(), KeyboardError> {
        loop {
            let next = match self.source.next_char(stop) {
                Ok(next) => next,
                // A sequence cut short by shutdown isn't worth reporting.
                Err(_) if stop.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(ch) = next else {
                tracing::debug!("keyboard input closed");
                return Ok(());
            };
            if tx.blocking_send(RelayInput::Typed(ch)).is_err() {
                tracing::debug!("input queue closed, stopping keyboard reader");
                return Ok(());
            }
            if !self.character_delay.is_zero() {
                std::thread::sleep(self.character_delay);
            }
        }
    }
}
