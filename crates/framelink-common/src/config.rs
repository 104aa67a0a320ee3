//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: `PORT` > `FRAMELINK__*` env vars > .env file > framelink.toml > defaults

use crate::error::FramelinkResult;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

const DEFAULT_CONFIG_FILE: &str = "framelink";

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call framelink_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
/// `file` names an optional config file (without extension); it defaults to `framelink`.
pub fn init(file: Option<&str>) -> FramelinkResult<&'static AppConfig> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(file)?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global slot.
pub fn load(file: Option<&str>) -> FramelinkResult<AppConfig> {
    let d = AppConfig::default();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", d.server.host)?
        .set_default("server.port", i64::from(d.server.port))?
        .set_default("server.max_frame_bytes", d.server.max_frame_bytes as i64)?
        .set_default("server.outbound_queue", d.server.outbound_queue as i64)?
        .set_default("server.status_interval_secs", d.server.status_interval_secs as i64)?
        .set_default("liveness.interval_secs", d.liveness.interval_secs as i64)?
        .set_default("liveness.missed_probes", i64::from(d.liveness.missed_probes))?
        .set_default("arbitration.auto_switch", d.arbitration.auto_switch)?
        .set_default("arbitration.face_threshold", d.arbitration.face_threshold)?
        .set_default(
            "arbitration.min_consecutive_hits",
            i64::from(d.arbitration.min_consecutive_hits),
        )?
        .set_default(
            "arbitration.stability_period_ms",
            d.arbitration.stability_period_ms as i64,
        )?
        .set_default("arbitration.confidence_bonus", d.arbitration.confidence_bonus)?
        .set_default(
            "arbitration.current_owner_bonus",
            d.arbitration.current_owner_bonus,
        )?
        .set_default("arbitration.switch_threshold", d.arbitration.switch_threshold)?
        .set_default("arbitration.hysteresis_ms", d.arbitration.hysteresis_ms as i64)?
        .set_default(
            "arbitration.max_switches_per_minute",
            i64::from(d.arbitration.max_switches_per_minute),
        )?
        .set_default(
            "arbitration.enforce_rate_limit",
            d.arbitration.enforce_rate_limit,
        )?
        .set_default(
            "arbitration.manual_override_ms",
            d.arbitration.manual_override_ms as i64,
        )?
        .set_default(
            "arbitration.handover_delay_ms",
            d.arbitration.handover_delay_ms as i64,
        )?
        // Optional config file
        .add_source(
            config::File::with_name(file.unwrap_or(DEFAULT_CONFIG_FILE)).required(file.is_some()),
        )
        // Environment variables (FRAMELINK__SERVER__PORT, FRAMELINK__LIVENESS__INTERVAL_SECS, etc.)
        .add_source(
            config::Environment::with_prefix("FRAMELINK")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        // Hosting platforms inject the listening port as plain `PORT`
        .set_override_option("server.port", std::env::var("PORT").ok())?
        .build()?;

    Ok(cfg.try_deserialize()?)
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub arbitration: ArbitrationSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted WebSocket frame / message, in bytes.
    pub max_frame_bytes: usize,
    /// Frames buffered per connection before further sends to it are dropped.
    pub outbound_queue: usize,
    pub status_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_frame_bytes: 1024 * 1024,
            outbound_queue: 256,
            status_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    pub interval_secs: u64,
    /// Unanswered probe cycles tolerated before a connection is evicted.
    pub missed_probes: u32,
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            missed_probes: 1,
        }
    }
}

/// Raw camera-arbitration tuning as it appears in config sources.
/// Durations are milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct ArbitrationSettings {
    /// Whether new rooms switch the camera on face presence.
    pub auto_switch: bool,
    pub face_threshold: f64,
    pub min_consecutive_hits: u32,
    pub stability_period_ms: u64,
    pub confidence_bonus: f64,
    pub current_owner_bonus: f64,
    pub switch_threshold: f64,
    pub hysteresis_ms: u64,
    pub max_switches_per_minute: u32,
    pub enforce_rate_limit: bool,
    pub manual_override_ms: u64,
    pub handover_delay_ms: u64,
}

impl Default for ArbitrationSettings {
    fn default() -> Self {
        Self {
            auto_switch: true,
            face_threshold: 0.6,
            min_consecutive_hits: 3,
            stability_period_ms: 1500,
            confidence_bonus: 0.2,
            current_owner_bonus: 0.1,
            switch_threshold: 0.1,
            hysteresis_ms: 2000,
            max_switches_per_minute: 5,
            enforce_rate_limit: true,
            manual_override_ms: 10_000,
            handover_delay_ms: 300,
        }
    }
}
