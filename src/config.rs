//! Tracker and peer configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. CLI flags override individual fields
//! after loading.

use crate::error::{Result, SwarmError};
use crate::frame::MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of live peer connections per download
pub const MAX_PEERS_CONNECTED: usize = 30;

/// Connect/handshake timeout towards a single peer
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// Default piece size (256 KiB)
pub const DEFAULT_PIECE_SIZE: u32 = 256 * 1024;

/// Default block size (16 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Largest file a download will buffer (4 GiB)
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Upper bound on pieces per file
pub const MAX_PIECE_COUNT: u32 = 1 << 20;

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Address the tracker listens on
    pub listen_addr: SocketAddr,

    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,

    /// Seconds without a heartbeat after which a peer is expired
    pub peer_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 1233)),
            sweep_interval_secs: 30,
            peer_timeout_secs: 60,
        }
    }
}

impl TrackerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(SwarmError::ConfigError(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.peer_timeout_secs == 0 {
            return Err(SwarmError::ConfigError(
                "peer_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

/// Peer (seeder/downloader) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Tracker to register with
    pub tracker_addr: SocketAddr,

    /// Address to accept peer connections on
    pub listen_addr: SocketAddr,

    /// Directory files are read from and written to
    pub repository_dir: PathBuf,

    /// Maximum live peer connections
    pub max_peers: usize,

    /// Piece size used when seeding a new file
    pub piece_size: u32,

    /// Block size used when requesting pieces
    pub block_size: u32,

    /// Milliseconds between scheduling passes
    pub schedule_interval_ms: u64,

    /// Milliseconds to idle when no peer has unchoked us
    pub idle_backoff_ms: u64,

    /// Milliseconds allowed for connect plus handshake
    pub handshake_timeout_ms: u64,

    /// Seconds a connection may stay silent before it is dropped
    pub read_timeout_secs: u64,

    /// Seconds between keep-alives on an idle connection
    pub keepalive_secs: u64,

    /// Seconds between tracker heartbeats
    pub heartbeat_interval_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            tracker_addr: TrackerConfig::default().listen_addr,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            repository_dir: PathBuf::from("./repository"),
            max_peers: MAX_PEERS_CONNECTED,
            piece_size: DEFAULT_PIECE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            schedule_interval_ms: 100,
            idle_backoff_ms: 1000,
            handshake_timeout_ms: PEER_TIMEOUT.as_millis() as u64,
            read_timeout_secs: 30,
            keepalive_secs: 10,
            heartbeat_interval_secs: 10,
        }
    }
}

impl PeerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(SwarmError::ConfigError("max_peers must be positive".to_string()));
        }
        if self.piece_size == 0 || self.block_size == 0 {
            return Err(SwarmError::ConfigError(
                "piece_size and block_size must be positive".to_string(),
            ));
        }
        // A block plus its piece header has to fit in one frame.
        if self.block_size as usize + 64 > MAX_FRAME_LEN {
            return Err(SwarmError::ConfigError(format!(
                "block_size {} exceeds the frame limit",
                self.block_size
            )));
        }
        if self.schedule_interval_ms == 0
            || self.idle_backoff_ms == 0
            || self.handshake_timeout_ms == 0
            || self.read_timeout_secs == 0
            || self.keepalive_secs == 0
            || self.heartbeat_interval_secs == 0
        {
            return Err(SwarmError::ConfigError("intervals must be positive".to_string()));
        }
        if self.keepalive_secs >= self.read_timeout_secs {
            return Err(SwarmError::ConfigError(
                "keepalive_secs must be shorter than read_timeout_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| {
        SwarmError::ConfigError(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_slice(&data)?)
}
