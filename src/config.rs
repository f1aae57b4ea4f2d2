//! Server configuration from environment variables.

use std::path::PathBuf;

use crate::storage::StoreConfig;

/// Runtime configuration. Every knob has a default so a bare
/// `inkpad-server` starts in dev mode.
#[derive(Debug, Clone)]
pub struct Config {
    /// `APP_ENV` == "dev" relaxes the origin check.
    pub app_env_dev: bool,
    /// `LISTEN_ADDR`
    pub listen_addr: String,
    /// `VAULT_DIR`: root of the per-slug document store.
    pub vault_dir: PathBuf,
    /// `TRANSFORM_WINDOW`: max `rev - base_rev` the server transforms.
    pub transform_window: u64,
    /// `SNAPSHOT_MAX_WAL_BYTES`: WAL size that triggers compaction.
    pub snapshot_max_wal_bytes: u64,
    /// `SNAPSHOT_MAX_OPS`: revs past the snapshot that trigger compaction.
    pub snapshot_max_ops: u64,
    /// `HEARTBEAT_SECS`: client ping cadence (advertised; clients own it).
    pub heartbeat_secs: u64,
    /// `CLIENT_TIMEOUT_SECS`: silence after which a socket is dead.
    pub client_timeout_secs: u64,
    /// `IDLE_EVICT_SECS`: presence entries older than this are evicted.
    pub idle_evict_secs: u64,
    /// Seconds between eviction sweeps.
    pub evict_sweep_secs: u64,
    /// `SNAPSHOT_FLUSH_SECS`: cadence of the unconditional snapshot
    /// flush for documents with revs not yet covered by `snapshot.v1`,
    /// regardless of the compaction thresholds.
    pub snapshot_flush_secs: u64,
    /// Bounded outbound frames per session before disconnect (1013).
    pub session_queue_frames: usize,
    /// `APP_ALLOWED_ORIGINS`: comma-separated origin prefixes.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_env_dev: true,
            listen_addr: "0.0.0.0:9000".to_string(),
            vault_dir: PathBuf::from("/vault"),
            transform_window: 1024,
            snapshot_max_wal_bytes: 8 * 1024 * 1024,
            snapshot_max_ops: 10_000,
            heartbeat_secs: 5,
            client_timeout_secs: 30,
            idle_evict_secs: 60,
            evict_sweep_secs: 15,
            snapshot_flush_secs: 30,
            session_queue_frames: 256,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_env_dev: env_str("APP_ENV").map_or(true, |v| v == "dev"),
            listen_addr: env_str("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            vault_dir: env_str("VAULT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.vault_dir),
            transform_window: env_parse("TRANSFORM_WINDOW", defaults.transform_window),
            snapshot_max_wal_bytes: env_parse(
                "SNAPSHOT_MAX_WAL_BYTES",
                defaults.snapshot_max_wal_bytes,
            ),
            snapshot_max_ops: env_parse("SNAPSHOT_MAX_OPS", defaults.snapshot_max_ops),
            heartbeat_secs: env_parse("HEARTBEAT_SECS", defaults.heartbeat_secs),
            client_timeout_secs: env_parse("CLIENT_TIMEOUT_SECS", defaults.client_timeout_secs),
            idle_evict_secs: env_parse("IDLE_EVICT_SECS", defaults.idle_evict_secs),
            evict_sweep_secs: defaults.evict_sweep_secs,
            snapshot_flush_secs: env_parse("SNAPSHOT_FLUSH_SECS", defaults.snapshot_flush_secs),
            session_queue_frames: defaults.session_queue_frames,
            allowed_origins: env_str("APP_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            vault_dir: self.vault_dir.clone(),
            max_wal_bytes: self.snapshot_max_wal_bytes,
            max_wal_ops: self.snapshot_max_ops,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
