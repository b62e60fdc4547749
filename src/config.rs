//! Configuration for the engine.
//!
//! # Example
//!
//! ```
//! use study_sync::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.cache_max_bytes, 64 * 1024 * 1024); // 64 MB
//!
//! // Full config
//! let config = EngineConfig {
//!     device_id: "tablet-7".into(),
//!     cache_max_bytes: 16 * 1024 * 1024,
//!     max_attempts: 5,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the offline engine.
///
/// All fields have sensible defaults. `device_id` should be stable across
/// restarts of the same installation - idempotency keys are derived from it.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Stable identity of this device/installation
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Content cache max size in bytes (default: 64 MB)
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Maximum delivery attempts before a mutation goes failed-terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry backoff base delay in milliseconds (default: 1s)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry backoff multiplier per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Retry backoff ceiling in milliseconds (default: 5 minutes)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Days to keep acknowledged mutations before compaction removes them
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// SQLite file for durable state (None = in-memory store, no durability)
    #[serde(default)]
    pub db_path: Option<String>,
}

fn default_device_id() -> String {
    "default-device".to_string()
}
fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024 // 64 MB
}
fn default_max_attempts() -> u32 {
    8
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_cap_ms() -> u64 {
    300_000 // 5 minutes
}
fn default_retention_days() -> u32 {
    7
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            cache_max_bytes: default_cache_max_bytes(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap_ms(),
            retention_days: default_retention_days(),
            db_path: None,
        }
    }
}
