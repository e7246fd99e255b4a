#![allow(dead_code)]

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use boardterm::config::RelayConfig;
use boardterm::keyboard::{CharSource, KeyboardError};
use boardterm::output::TerminalWriter;
use boardterm::registry::ClientRegistry;
use boardterm::relay::{Interrupts, Relay, RelayError};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Keyboard stand-in: characters sent on the paired channel come out of
/// `next_char` in order.
pub struct ChannelSource(std_mpsc::Receiver<char>);

impl CharSource for ChannelSource {
    fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError> {
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }
            match self.0.recv_timeout(Duration::from_millis(5)) {
                Ok(ch) => return Ok(Some(ch)),
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

/// Output sink that tests can inspect while the relay owns a clone.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedOutput {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, expected: &[u8]) {
        for _ in 0..300 {
            if self.contents() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected output {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&self.contents())
        );
    }
}

/// A relay running in the background on an ephemeral loopback port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: ClientRegistry,
    pub keys: std_mpsc::Sender<char>,
    pub output: SharedOutput,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), RelayError>>,
}

pub fn fast_config() -> RelayConfig {
    RelayConfig {
        port: 0,
        character_delay: Duration::ZERO,
        socket_delay: Duration::ZERO,
        ..Default::default()
    }
}

pub async fn start_relay(interrupts: Interrupts) -> TestRelay {
    start_relay_with(fast_config(), interrupts).await
}

pub async fn start_relay_with(config: RelayConfig, interrupts: Interrupts) -> TestRelay {
    let relay = Relay::bind(&config).await.expect("bind relay");
    let addr = relay.local_addr();
    let registry = relay.registry().clone();
    let (keys, key_rx) = std_mpsc::channel();
    let output = SharedOutput::default();
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(relay.run_with(
        Box::new(ChannelSource(key_rx)),
        TerminalWriter::new(output.clone()),
        interrupts,
        cancel.clone(),
    ));

    TestRelay {
        addr,
        registry,
        keys,
        output,
        cancel,
        handle,
    }
}

impl TestRelay {
    /// Connect a client and wait until the relay has registered it.
    pub async fn connect(&self) -> TcpStream {
        let before = self.registry.len().await;
        let stream = TcpStream::connect(self.addr).await.expect("connect to relay");
        self.wait_for_clients(before + 1).await;
        stream
    }

    pub async fn wait_for_clients(&self, expected: usize) {
        for _ in 0..300 {
            if self.registry.len().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} clients, registry has {}",
            self.registry.len().await
        );
    }

    pub fn type_str(&self, text: &str) {
        for ch in text.chars() {
            self.keys.send(ch).expect("keyboard channel closed");
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("relay did not stop")
            .expect("relay task panicked")
            .expect("relay returned an error");
    }
}

/// Read exactly `n` bytes from a client, failing after five seconds.
pub async fn read_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for relay output")
        .expect("read from relay failed");
    buf
}

/// Assert nothing further arrives on `stream` within a short window.
pub async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes: {:?}", &buf[..n]),
        Ok(Err(e)) => panic!("read failed: {e}"),
    }
}
