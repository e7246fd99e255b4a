//! Wiring for the two long-lived halves of the relay.
//!
//! ```text
//!  keyboard thread ──┐
//!                    ├─► input queue ─► dispatcher ─► Broadcaster ─► clients
//!  interrupt bridge ─┘
//!
//!  clients ─► SocketServer event loop ─► TerminalWriter ─► stdout
//! ```
//!
//! The only state shared between the halves is the [`ClientRegistry`].

use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::config::{ConfigError, RelayConfig};
use crate::interrupt::{InterruptBridge, RelayInput};
use crate::keyboard::{self, CharSource, KeyboardError, KeyboardReader};
use crate::output::TerminalWriter;
use crate::registry::ClientRegistry;
use crate::server::{ServerError, SocketServer};

/// Typed characters are tiny; this only needs to absorb short bursts while
/// a broadcast is in flight.
const INPUT_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("keyboard error: {0}")]
    Keyboard(#[from] KeyboardError),

    #[error("failed to install interrupt handler: {0}")]
    Signal(#[source] io::Error),

    #[error("failed to start keyboard thread: {0}")]
    Thread(#[source] io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] JoinError),
}

/// Whether the relay should take over the local interrupt signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupts {
    Intercept,
    Ignore,
}

pub struct Relay {
    server: SocketServer,
    broadcaster: Broadcaster,
    character_delay: Duration,
}

impl Relay {
    /// Bind the listening socket. Nothing runs until [`Relay::run`].
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let registry = ClientRegistry::new();
        let server = SocketServer::bind(config, registry.clone()).await?;
        Ok(Self {
            server,
            broadcaster: Broadcaster::new(registry),
            character_delay: config.character_delay,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &ClientRegistry {
        self.server.registry()
    }

    /// Run against the real keyboard and stdout with Ctrl+C intercepted.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RelayError> {
        let source = keyboard::open_char_source()?;
        self.run_with(source, TerminalWriter::stdout(), Interrupts::Intercept, cancel)
            .await
    }

    /// Run with an explicit keyboard source and output.
    ///
    /// Returns when `cancel` fires (`Ok`), or when the keyboard or the server
    /// task fails (`Err`). Every task is stopped and the keyboard source is
    /// dropped before this returns, so the terminal is restored.
    pub async fn run_with<W>(
        self,
        source: Box<dyn CharSource>,
        output: TerminalWriter<W>,
        interrupts: Interrupts,
        cancel: CancellationToken,
    ) -> Result<(), RelayError>
    where
        W: Write + Send + 'static,
    {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

        let bridge = match interrupts {
            Interrupts::Intercept => Some(
                InterruptBridge::install(input_tx.clone())
                    .map_err(RelayError::Signal)?
                    .spawn(cancel.clone()),
            ),
            Interrupts::Ignore => None,
        };

        let dispatcher = tokio::spawn(dispatch(input_rx, self.broadcaster.clone()));
        let mut server = tokio::spawn(self.server.run(output, cancel.clone()));

        let (keyboard_done_tx, mut keyboard_done) = oneshot::channel();
        let reader = KeyboardReader::new(source, self.character_delay);
        let keyboard_stop = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("keyboard".into())
            .spawn(move || {
                let result = reader.run(input_tx, &keyboard_stop);
                let _ = keyboard_done_tx.send(result);
            });
        if let Err(e) = spawned {
            cancel.cancel();
            if let Err(join) = server.await {
                tracing::debug!(error = %join, "server task failed during shutdown");
            }
            if let Some(bridge) = bridge {
                let _ = bridge.await;
            }
            dispatcher.abort();
            return Err(RelayError::Thread(e));
        }

        let mut outcome: Result<(), RelayError> = Ok(());
        let mut keyboard_finished = false;

        tokio::select! {
            result = &mut server => {
                outcome = server_outcome(result);
            }
            result = &mut keyboard_done => {
                keyboard_finished = true;
                match result {
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "keyboard reader failed");
                        outcome = Err(e.into());
                    }
                    _ => {
                        tracing::info!("keyboard input closed, relaying board output only");
                    }
                }
                if outcome.is_err() {
                    cancel.cancel();
                }
                let server_result = server_outcome(server.await);
                if outcome.is_ok() {
                    outcome = server_result;
                }
            }
        }

        cancel.cancel();
        if !keyboard_finished {
            if let Ok(Err(e)) = keyboard_done.await {
                tracing::debug!(error = %e, "keyboard reader failed during shutdown");
            }
        }
        if let Some(bridge) = bridge {
            let _ = bridge.await;
        }
        dispatcher.abort();

        outcome
    }
}

fn server_outcome(result: Result<Result<(), ServerError>, JoinError>) -> Result<(), RelayError> {
    result?.map_err(RelayError::from)
}

/// Drain the input queue into the broadcaster, one character at a time.
async fn dispatch(mut rx: mpsc::Receiver<RelayInput>, broadcaster: Broadcaster) {
    while let Some(input) = rx.recv().await {
        broadcaster.send_char(input.as_char()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Hands out characters pushed through a channel, as a keyboard would.
    struct ChannelSource(std::sync::mpsc::Receiver<Result<char, KeyboardError>>);

    impl CharSource for ChannelSource {
        fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError> {
            loop {
                if stop.is_cancelled() {
                    return Ok(None);
                }
                match self.0.recv_timeout(Duration::from_millis(5)) {
                    Ok(item) => return item.map(Some),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(None),
                }
            }
        }
    }

    /// Wraps a source and records when it is dropped.
    struct Tracked {
        inner: ChannelSource,
        dropped: Arc<AtomicBool>,
    }

    impl CharSource for Tracked {
        fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError> {
            self.inner.next_char(stop)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct PanickingWriter;

    impl Write for PanickingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            panic!("terminal went away");
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            port: 0,
            character_delay: Duration::ZERO,
            socket_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn wait_for_clients(registry: &ClientRegistry, expected: usize) {
        for _ in 0..200 {
            if registry.len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {expected} clients");
    }

    #[tokio::test]
    async fn keys_go_out_and_board_output_comes_back() {
        let relay = Relay::bind(&test_config()).await.unwrap();
        let addr = relay.local_addr();
        let registry = relay.registry().clone();
        let (keys, key_rx) = std::sync::mpsc::channel();
        let sink = SharedBuf::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(relay.run_with(
            Box::new(ChannelSource(key_rx)),
            TerminalWriter::new(sink.clone()),
            Interrupts::Ignore,
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&registry, 1).await;

        for ch in ['A', '\n', 'B'] {
            keys.send(Ok(ch)).unwrap();
        }
        let mut received = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"A\r\nB");

        client.write_all(b"OK\n").await.unwrap();
        for _ in 0..200 {
            if sink.0.lock().unwrap().as_slice() == b"OK\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"OK\n");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn keyboard_failure_stops_the_relay() {
        let relay = Relay::bind(&test_config()).await.unwrap();
        let (keys, key_rx) = std::sync::mpsc::channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(relay.run_with(
            Box::new(ChannelSource(key_rx)),
            TerminalWriter::new(Vec::new()),
            Interrupts::Ignore,
            cancel.clone(),
        ));

        keys.send(Err(KeyboardError::InvalidUtf8(vec![0xff]))).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::Keyboard(KeyboardError::InvalidUtf8(_)))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn keyboard_eof_keeps_server_running() {
        let relay = Relay::bind(&test_config()).await.unwrap();
        let addr = relay.local_addr();
        let registry = relay.registry().clone();
        let (keys, key_rx) = std::sync::mpsc::channel::<Result<char, KeyboardError>>();
        let sink = SharedBuf::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(relay.run_with(
            Box::new(ChannelSource(key_rx)),
            TerminalWriter::new(sink.clone()),
            Interrupts::Ignore,
            cancel.clone(),
        ));
        drop(keys);

        let _client = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&registry, 1).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_task_failure_stops_everything() {
        let relay = Relay::bind(&test_config()).await.unwrap();
        let addr = relay.local_addr();
        let registry = relay.registry().clone();
        let (_keys, key_rx) = std::sync::mpsc::channel::<Result<char, KeyboardError>>();
        let dropped = Arc::new(AtomicBool::new(false));
        let source = Tracked {
            inner: ChannelSource(key_rx),
            dropped: dropped.clone(),
        };
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(relay.run_with(
            Box::new(source),
            TerminalWriter::new(PanickingWriter),
            Interrupts::Ignore,
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&registry, 1).await;
        client.write_all(b"boom").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RelayError::TaskJoin(_))));
        assert!(cancel.is_cancelled());
        assert!(dropped.load(Ordering::SeqCst), "keyboard source was not released");
    }
}
