//! Turns the local interrupt signal (Ctrl+C) into input for the board.
//!
//! The signal never terminates the relay. Instead the bridge enqueues one
//! [`RelayInput::Interrupt`] per signal on the same queue the keyboard
//! reader feeds, and the dispatcher sends it to every client as ETX.

use std::io;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// ASCII "end of text", what a terminal sends for Ctrl+C.
pub const ETX: char = '\u{3}';

/// One unit of input destined for the connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayInput {
    /// A character read from the keyboard.
    Typed(char),
    /// The local interrupt signal fired.
    Interrupt,
}

impl RelayInput {
    pub fn as_char(self) -> char {
        match self {
            Self::Typed(c) => c,
            Self::Interrupt => ETX,
        }
    }
}

#[cfg(unix)]
type SignalSource = tokio::signal::unix::Signal;

#[cfg(windows)]
type SignalSource = tokio::signal::windows::CtrlC;

pub struct InterruptBridge {
    signals: SignalSource,
    tx: mpsc::Sender<RelayInput>,
}

impl InterruptBridge {
    /// Install the interrupt handler. From this point on Ctrl+C no longer
    /// kills the process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(tx: mpsc::Sender<RelayInput>) -> io::Result<Self> {
        #[cfg(unix)]
        let signals = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        #[cfg(windows)]
        let signals = tokio::signal::windows::ctrl_c()?;

        Ok(Self { signals, tx })
    }

    /// Forward signals until `cancel` fires or the input queue closes.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = self.signals.recv() => {
                        if received.is_none() {
                            tracing::warn!("interrupt signal stream ended");
                            break;
                        }
                        tracing::debug!("interrupt intercepted, forwarding ETX");
                        if self.tx.send(RelayInput::Interrupt).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
