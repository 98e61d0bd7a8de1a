use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub feed: FeedConfig,
    pub features: FeatureConfig,
    pub detector: DetectorConfig,
    pub ws: WsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            store: StoreConfig::from_env(),
            catalog: CatalogConfig::from_env(),
            feed: FeedConfig::from_env(),
            features: FeatureConfig::from_env(),
            detector: DetectorConfig::from_env(),
            ws: WsConfig::from_env(),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server:    {}:{}", self.server.host, self.server.port);
        tracing::info!("  store:     url={}, retention={}h", self.store.database_url, self.store.retention_hours);
        tracing::info!("  catalog:   bundle={}", self.catalog.bundle_path.display());
        tracing::info!(
            "  feeds:     base={}, interval={}s, timeout={}s, retries={}",
            self.feed.base_url, self.feed.update_interval_s, self.feed.timeout_s, self.feed.max_retries
        );
        tracing::info!(
            "  features:  headway_window={}m, rolling_window={}h",
            self.features.headway_window_minutes, self.features.rolling_window_hours
        );
        tracing::info!(
            "  detector:  contamination={}, retrain_hour={}utc, seq_model={}",
            self.detector.contamination, self.detector.retrain_hour_utc,
            if self.detector.sequence_model_enabled { "enabled" } else { "disabled" }
        );
        tracing::info!(
            "  ws:        heartbeat={}s, max_connections={}",
            self.ws.heartbeat_interval_s, self.ws.max_connections
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request deadline for API handlers.
    pub request_deadline_s: u64,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_u16("PORT", 8000),
            request_deadline_s: env_u64("REQUEST_DEADLINE", 10),
        }
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_s)
    }
}

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    /// Rows older than this are purged by the scheduler.
    pub retention_hours: u32,
    /// p95 write latency (ms) above which ingest halves its batch size.
    pub write_high_watermark_ms: u64,
    /// p95 write latency (ms) above which ingest sheds the slowest feeds.
    pub write_drop_watermark_ms: u64,
}

impl StoreConfig {
    fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite://headway.db"),
            retention_hours: env_u32("RETENTION_HOURS", 168),
            write_high_watermark_ms: env_u64("WRITE_HIGH_WATERMARK", 500),
            write_drop_watermark_ms: env_u64("WRITE_DROP_WATERMARK", 2000),
        }
    }
}

// ── Catalog ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// GTFS static bundle: a zip archive or an unpacked directory.
    pub bundle_path: PathBuf,
}

impl CatalogConfig {
    fn from_env() -> Self {
        Self {
            bundle_path: PathBuf::from(env_or("GTFS_BUNDLE_PATH", "data/gtfs.zip")),
        }
    }
}

// ── Feeds ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: String,
    pub update_interval_s: u64,
    pub timeout_s: u64,
    pub max_retries: u32,
}

impl FeedConfig {
    fn from_env() -> Self {
        Self {
            base_url: env_or(
                "FEED_BASE_URL",
                "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs",
            ),
            update_interval_s: env_u64("FEED_UPDATE_INTERVAL", 30),
            timeout_s: env_u64("FEED_TIMEOUT", 10),
            max_retries: env_u32("MAX_RETRIES", 3),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

// ── Feature engine ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub headway_window_minutes: u32,
    pub rolling_window_hours: u32,
}

impl FeatureConfig {
    fn from_env() -> Self {
        Self {
            headway_window_minutes: env_u32("HEADWAY_WINDOW_MINUTES", 30),
            rolling_window_hours: env_u32("ROLLING_WINDOW_HOURS", 1),
        }
    }
}

// ── Detector ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub contamination: f64,
    pub sequence_length: u32,
    pub hidden_size: u32,
    pub sequence_model_enabled: bool,
    /// Minimum seconds between sequence-model evaluations per line.
    pub sequence_tick_s: u64,
    pub retrain_hour_utc: u32,
    pub training_window_hours: u32,
    /// Repeated anomalies at the same (target, kind) within this window are
    /// coalesced rather than re-emitted.
    pub suppress_window_s: u64,
}

impl DetectorConfig {
    fn from_env() -> Self {
        Self {
            contamination: env_f64("ANOMALY_CONTAMINATION", 0.05),
            sequence_length: env_u32("LSTM_SEQUENCE_LENGTH", 24),
            hidden_size: env_u32("LSTM_HIDDEN_SIZE", 128),
            sequence_model_enabled: env_bool("SEQUENCE_MODEL_ENABLED", true),
            sequence_tick_s: env_u64("SEQUENCE_TICK_SECONDS", 60),
            retrain_hour_utc: env_u32("MODEL_RETRAIN_HOUR", 3),
            training_window_hours: env_u32("TRAINING_WINDOW_HOURS", 168),
            suppress_window_s: env_u64("SUPPRESS_WINDOW_S", 300),
        }
    }
}

// ── WebSocket ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub heartbeat_interval_s: u64,
    pub max_connections: u32,
}

impl WsConfig {
    fn from_env() -> Self {
        Self {
            heartbeat_interval_s: env_u64("WS_HEARTBEAT_INTERVAL", 30),
            max_connections: env_u32("WS_MAX_CONNECTIONS", 1000),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }
}
