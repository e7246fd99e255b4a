//! boardterm - keyboard/terminal relay for boards with a raw TCP console.
//!
//! Listens on `127.0.0.1:<PORT>`. Every key typed locally goes to all
//! connected clients (Enter becomes `\r\n`), and everything the clients send
//! is written to stdout. Ctrl+C is forwarded to the board as ETX rather than
//! stopping the relay; use SIGTERM (or close the terminal) to quit.

use std::path::PathBuf;

use clap::Parser as ClapParser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use boardterm::{
    config::{Overrides, RelayConfig},
    relay::{Relay, RelayError},
};

/// boardterm - relay the local keyboard to TCP clients and their output back
#[derive(ClapParser, Debug)]
#[command(name = "boardterm", version, about, long_about = None)]
struct Cli {
    /// Port to listen on (loopback only) [default: 1337]
    #[arg(env = "BOARDTERM_PORT")]
    port: Option<u16>,

    /// Path to a TOML config file (defaults to the user config dir)
    #[arg(long, env = "BOARDTERM_CONFIG")]
    config: Option<PathBuf>,

    /// Log every relayed character
    #[arg(long, env = "BOARDTERM_DEBUG")]
    debug: bool,

    /// Maximum bytes read from a client at once
    #[arg(long, env = "BOARDTERM_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Pause after each typed character, in milliseconds
    #[arg(long, env = "BOARDTERM_CHARACTER_DELAY_MS")]
    character_delay_ms: Option<u64>,

    /// Pause between socket loop iterations, in milliseconds
    #[arg(long, env = "BOARDTERM_SOCKET_DELAY_MS")]
    socket_delay_ms: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            debug: self.debug,
            chunk_size: self.chunk_size,
            character_delay_ms: self.character_delay_ms,
            socket_delay_ms: self.socket_delay_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    let cli = Cli::parse();
    let config = RelayConfig::load(&cli.overrides(), cli.config.as_deref())?;

    init_tracing(config.debug);

    let relay = Relay::bind(&config).await?;
    tracing::info!(addr = %relay.local_addr(), "boardterm starting");

    let cancel = CancellationToken::new();
    spawn_termination_watch(cancel.clone());

    relay.run(cancel).await?;

    tracing::info!("boardterm exiting");
    Ok(())
}

/// Initialize tracing on stderr.
///
/// stdout carries the board's output, so logs must never go there.
fn init_tracing(debug: bool) {
    let default_filter = if debug { "boardterm=debug" } else { "boardterm=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Stop the relay on SIGTERM or SIGHUP. SIGINT is deliberately absent: it
/// belongs to the board.
#[cfg(unix)]
fn spawn_termination_watch(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(?e, "failed to install termination handlers");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM"),
            _ = hup.recv() => tracing::info!("received SIGHUP"),
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_termination_watch(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::windows::ctrl_close() {
            Ok(mut close) => {
                close.recv().await;
                tracing::info!("console closing");
                cancel.cancel();
            }
            Err(e) => tracing::warn!(?e, "failed to install console close handler"),
        }
    });
}
