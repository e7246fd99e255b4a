use std::io::{self, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("received bytes are not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("failed to write to terminal: {0}")]
    Write(#[source] io::Error),
}

/// Writes text received from the board to the local terminal.
///
/// Every chunk is flushed immediately so partial lines (prompts, echo) show
/// up without waiting for a newline.
pub struct TerminalWriter<W: Write> {
    out: W,
}

impl TerminalWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Decode `data` as UTF-8 and write it out.
    ///
    /// Nothing is written if the chunk does not decode.
    pub fn board_input(&mut self, data: &[u8]) -> Result<(), OutputError> {
        let text = std::str::from_utf8(data)?;
        self.out.write_all(text.as_bytes()).map_err(OutputError::Write)?;
        self.out.flush().map_err(OutputError::Write)
    }

    #[cfg(test)]
    fn get_ref(&self) -> &W {
        &self.out
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
