use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port used when none is given on the command line or in the config file.
pub const DEFAULT_PORT: u16 = 1337;

/// Maximum number of bytes requested from a client socket per read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Pause between iterations of the socket event loop.
pub const DEFAULT_SOCKET_DELAY: Duration = Duration::from_millis(10);

/// Pause after each character read from the keyboard, roughly matching the
/// echo timing of the board on the other side.
pub const DEFAULT_CHARACTER_DELAY: Duration = Duration::from_millis(50);

/// The relay only ever listens on loopback.
pub const LISTEN_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Optional settings read from a TOML file. Every field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub debug: Option<bool>,
    pub chunk_size: Option<usize>,
    pub character_delay_ms: Option<u64>,
    pub socket_delay_ms: Option<u64>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Values supplied on the command line (or through the matching env vars).
///
/// `None` means "not given", so the file value or the built-in default wins.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub debug: bool,
    pub chunk_size: Option<usize>,
    pub character_delay_ms: Option<u64>,
    pub socket_delay_ms: Option<u64>,
}

/// Fully resolved relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    pub debug: bool,
    pub chunk_size: usize,
    pub character_delay: Duration,
    pub socket_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            debug: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            character_delay: DEFAULT_CHARACTER_DELAY,
            socket_delay: DEFAULT_SOCKET_DELAY,
        }
    }
}

impl RelayConfig {
    /// Merge command-line overrides on top of an optional file config.
    ///
    /// Precedence is overrides, then file, then defaults.
    pub fn resolve(overrides: &Overrides, file: Option<&FileConfig>) -> Result<Self, ConfigError> {
        let file = file.cloned().unwrap_or_default();
        let defaults = Self::default();

        let chunk_size = overrides
            .chunk_size
            .or(file.chunk_size)
            .unwrap_or(defaults.chunk_size);
        if chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }

        Ok(Self {
            port: overrides.port.or(file.port).unwrap_or(defaults.port),
            debug: overrides.debug || file.debug.unwrap_or(false),
            chunk_size,
            character_delay: overrides
                .character_delay_ms
                .or(file.character_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.character_delay),
            socket_delay: overrides
                .socket_delay_ms
                .or(file.socket_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.socket_delay),
        })
    }

    /// Load the file at `path` (or the default location) and merge it with
    /// the overrides.
    pub fn load(overrides: &Overrides, path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };
        let file = match path {
            Some(p) => FileConfig::load(&p)?,
            None => None,
        };
        Self::resolve(overrides, file.as_ref())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(LISTEN_HOST, self.port)
    }
}

/// `<config_dir>/boardterm/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("boardterm").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidChunkSize,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::InvalidChunkSize => write!(f, "chunk size must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
