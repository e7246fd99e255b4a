//! TCP server for board clients.
//!
//! A single event loop multiplexes the listening socket and one in-flight
//! read per connected client. Bytes read from a client go straight to the
//! local terminal; the write half of each client lives in the
//! [`ClientRegistry`] so the keyboard side can broadcast to it.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::output::TerminalWriter;
use crate::registry::{ClientRegistry, Connection, ConnectionId};

/// Pause after a failed `accept()` so a persistent error can't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// A read outstanding on one client. Resolves with the read half so the
/// loop can either re-arm it or drop it.
type PendingRead = BoxFuture<'static, (ConnectionId, OwnedReadHalf, io::Result<Bytes>)>;

fn read_chunk(id: ConnectionId, mut reader: OwnedReadHalf, chunk_size: usize) -> PendingRead {
    async move {
        let mut buf = vec![0u8; chunk_size];
        let result = reader.read(&mut buf).await.map(|n| {
            buf.truncate(n);
            Bytes::from(buf)
        });
        (id, reader, result)
    }
    .boxed()
}

pub struct SocketServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ClientRegistry,
    chunk_size: usize,
    socket_delay: Duration,
}

impl SocketServer {
    /// Bind the listening socket on the configured loopback port.
    pub async fn bind(config: &RelayConfig, registry: ClientRegistry) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        Ok(Self {
            listener,
            local_addr,
            registry,
            chunk_size: config.chunk_size,
            socket_delay: config.socket_delay,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Run the event loop until `cancel` fires.
    ///
    /// Failures on one connection (read error, peer hang-up, undecodable
    /// data) tear down that connection only. On exit every remaining client
    /// is closed and removed from the registry.
    pub async fn run<W>(self, mut output: TerminalWriter<W>, cancel: CancellationToken) -> Result<(), ServerError>
    where
        W: Write + Send,
    {
        tracing::info!(addr = %self.local_addr, "relay listening");

        let mut reads: FuturesUnordered<PendingRead> = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("socket server received cancel signal, stopping event loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    self.on_accept(accepted, &mut reads).await;
                }
                Some(done) = reads.next(), if !reads.is_empty() => {
                    self.on_read(done, &mut output, &mut reads).await;
                }
            }

            self.drain_ready(&mut output, &mut reads).await;

            if !self.socket_delay.is_zero() {
                tokio::time::sleep(self.socket_delay).await;
            }
        }

        drop(reads);
        let closed = self.registry.clear().await;
        tracing::info!(closed, "relay stopped");
        Ok(())
    }

    /// Service everything else that is already ready without waiting: one
    /// pending accept and each client whose read has completed. Reads
    /// re-armed here are not polled again until the next iteration.
    async fn drain_ready<W>(&self, output: &mut TerminalWriter<W>, reads: &mut FuturesUnordered<PendingRead>)
    where
        W: Write + Send,
    {
        if let Some(accepted) = self.listener.accept().now_or_never() {
            self.on_accept(accepted, reads).await;
        }

        let in_flight = reads.len();
        for _ in 0..in_flight {
            match reads.next().now_or_never() {
                Some(Some(done)) => self.on_read(done, output, reads).await,
                _ => break,
            }
        }
    }

    async fn on_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        reads: &mut FuturesUnordered<PendingRead>,
    ) {
        match accepted {
            Ok((stream, peer)) => {
                let pending = self.admit(stream, peer).await;
                reads.push(pending);
            }
            Err(e) => {
                tracing::warn!(?e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    /// Pass a completed chunk to the terminal and re-arm the read, or tear
    /// the connection down on hang-up, read error or undecodable data.
    async fn on_read<W>(
        &self,
        (id, reader, result): (ConnectionId, OwnedReadHalf, io::Result<Bytes>),
        output: &mut TerminalWriter<W>,
        reads: &mut FuturesUnordered<PendingRead>,
    ) where
        W: Write + Send,
    {
        match result {
            Ok(chunk) if !chunk.is_empty() => match output.board_input(&chunk) {
                Ok(()) => reads.push(read_chunk(id, reader, self.chunk_size)),
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "dropping client after bad chunk");
                    drop(reader);
                    self.close(id).await;
                }
            },
            Ok(_) => {
                drop(reader);
                self.close(id).await;
            }
            Err(e) => {
                tracing::warn!(connection = %id, ?e, "read from client failed");
                drop(reader);
                self.close(id).await;
            }
        }
    }

    /// Register a freshly accepted client and arm its first read.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) -> PendingRead {
        // Keystrokes are single bytes; don't let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(?e, %peer, "failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let id = self.registry.next_id();
        self.registry.add(Connection::new(id, peer, writer)).await;
        tracing::info!(connection = %id, %peer, "accepted connection");

        read_chunk(id, reader, self.chunk_size)
    }

    /// Final step of a teardown: the read half is already gone, so closing
    /// the write half under the registry lock leaves no dead member behind.
    async fn close(&self, id: ConnectionId) {
        if let Some(peer) = self.registry.remove(id).await {
            tracing::info!(connection = %id, %peer, "closing connection");
        }
    }
}
