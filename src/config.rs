/// Runtime configuration for a mesh node. Every field is overridable via
/// environment variable; unset variables fall back to the defaults named
/// in the sync surface's design (sliding window, tick interval, timeouts,
/// batch cap, parallelism ceiling).
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the link-local mesh interface C1 derives identity from.
    pub mesh_interface_name: String,
    /// HTTP listen port for the sync surface.
    pub listen_port: u16,
    /// Delay after a tick's last sub-task completes before the next tick starts.
    pub tick_interval_ms: u64,
    /// Sliding window applied to both forward and backward incremental pulls.
    pub sliding_window_ms: i64,
    /// Per-peer round timeout; a stuck round is abandoned and cursors are untouched.
    pub per_round_timeout_ms: u64,
    /// Per-HTTP-request timeout for peer pulls.
    pub per_request_timeout_ms: u64,
    /// Maximum reports accepted in one ingestion batch.
    pub max_batch_size: usize,
    /// Maximum number of peers synced concurrently in one tick.
    pub max_parallel_peer_syncs: usize,
    /// Path to the local SQLite database file.
    pub database_path: String,
    /// How often the peer directory is allowed to go stale before refresh.
    pub peer_refresh_interval_ms: u64,
    /// Comma-separated static peer list used when `batctl` is unavailable.
    pub static_peers: Vec<String>,
    /// Overrides the MAC read from sysfs — for tests and multi-node dev setups.
    pub mac_override: Option<String>,
}

const HARD_PARALLELISM_CEILING: usize = 64;

impl Default for Config {
    fn default() -> Self {
        let max_parallel_peer_syncs = std::env::var("MAX_PARALLEL_PEER_SYNCS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(HARD_PARALLELISM_CEILING)
            .min(HARD_PARALLELISM_CEILING);

        Self {
            mesh_interface_name: std::env::var("MESH_INTERFACE_NAME")
                .unwrap_or_else(|_| "bat0".to_string()),
            listen_port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            tick_interval_ms: std::env::var("TICK_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
            sliding_window_ms: std::env::var("SLIDING_WINDOW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_800_000),
            per_round_timeout_ms: std::env::var("PER_ROUND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
            per_request_timeout_ms: std::env::var("PER_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            max_batch_size: std::env::var("MAX_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            max_parallel_peer_syncs,
            database_path: std::env::var("MESH_DB_PATH")
                .unwrap_or_else(|_| "mesh-sync-node.sqlite3".to_string()),
            peer_refresh_interval_ms: std::env::var("PEER_REFRESH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
            static_peers: std::env::var("MESH_STATIC_PEERS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            mac_override: std::env::var("MESH_MAC_OVERRIDE").ok(),
        }
    }
}
