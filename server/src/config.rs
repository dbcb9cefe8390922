//! Runtime configuration, filled from command line arguments by the binary.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct LockConfig {
    /// Upper bound on how long any acquisition may wait. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the persisted snapshot. `None` keeps the store in
    /// memory only.
    pub data_dir: Option<PathBuf>,
    /// Messages kept in memory after they have been persisted.
    pub message_capacity: usize,
    /// Concurrent sessions the user cache accepts.
    pub max_sessions: usize,
    pub lock: LockConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            message_capacity: 500,
            max_sessions: 64,
            lock: LockConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_duration: Duration,
    pub flush_interval: Duration,
    pub session_timeout: Duration,
    pub stats_interval: Duration,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_duration: Duration::from_millis(50),
            flush_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            cache: CacheConfig::default(),
        }
    }
}
