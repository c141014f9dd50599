//! Configuration management with environment variable support.
//!
//! This module provides centralized configuration for Touch Vision, supporting:
//! - Environment variables for all configurable values
//! - Sensible defaults for a single Android device over adb
//! - Builder-style overrides on the components that consume them
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TOUCH_VISION_ADB_PATH` | adb executable | `adb` |
//! | `TOUCH_VISION_ADB_TIMEOUT` | adb command timeout in seconds | `10` |
//! | `TOUCH_VISION_TESSERACT_PATH` | tesseract executable | `tesseract` |
//! | `TOUCH_VISION_POLL_INTERVAL_MS` | Oracle poll interval (ms) | `400` |
//! | `TOUCH_VISION_CAPTURE_TIMEOUT_MS` | Capture retry budget (ms) | `3000` |
//! | `TOUCH_VISION_TEXT_THRESHOLD` | Text match confidence | `0.5` |
//! | `TOUCH_VISION_ANY_TEXT_THRESHOLD` | "Any text present" confidence | `0.1` |
//! | `TOUCH_VISION_TEMPLATE_THRESHOLD` | Template correlation threshold | `0.8` |
//! | `TOUCH_VISION_CONTENT_THRESHOLD` | Content-loaded score threshold | `0.4` |
//! | `TOUCH_VISION_SESSION_DIR` | Base directory for run sessions | `/tmp/touch-vision` |
//! | `TOUCH_VISION_ASSETS_DIR` | Base directory for template images | `./assets` |
//! | `TOUCH_VISION_LOG` | Log filter (falls back to `RUST_LOG`) | `info` |
//!
//! # Example
//!
//! ```bash
//! export TOUCH_VISION_ADB_PATH="/opt/platform-tools/adb"
//! export TOUCH_VISION_CONTENT_THRESHOLD="0.3"
//! ```

use std::env;
use std::sync::OnceLock;

// ============================================================================
// Default Values
// ============================================================================

/// Default adb executable
pub const DEFAULT_ADB_PATH: &str = "adb";

/// Default adb command timeout (seconds)
pub const DEFAULT_ADB_TIMEOUT: u64 = 10;

/// Default tesseract executable
pub const DEFAULT_TESSERACT_PATH: &str = "tesseract";

/// Default Oracle poll interval (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 400;

/// Default budget for retrying transient capture failures (milliseconds)
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 3000;

/// Default confidence for a specific-text match
pub const DEFAULT_TEXT_THRESHOLD: f64 = 0.5;

/// Default confidence for "is any text present"
pub const DEFAULT_ANY_TEXT_THRESHOLD: f64 = 0.1;

/// Default normalized cross-correlation threshold
pub const DEFAULT_TEMPLATE_THRESHOLD: f64 = 0.8;

/// Default content-loaded score threshold
pub const DEFAULT_CONTENT_THRESHOLD: f64 = 0.4;

/// Default session base directory
pub const DEFAULT_SESSION_DIR: &str = "/tmp/touch-vision";

/// Default template asset directory
pub const DEFAULT_ASSETS_DIR: &str = "./assets";

/// Default log filter
pub const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_ADB_PATH: &str = "TOUCH_VISION_ADB_PATH";
pub const ENV_ADB_TIMEOUT: &str = "TOUCH_VISION_ADB_TIMEOUT";
pub const ENV_TESSERACT_PATH: &str = "TOUCH_VISION_TESSERACT_PATH";
pub const ENV_POLL_INTERVAL_MS: &str = "TOUCH_VISION_POLL_INTERVAL_MS";
pub const ENV_CAPTURE_TIMEOUT_MS: &str = "TOUCH_VISION_CAPTURE_TIMEOUT_MS";
pub const ENV_TEXT_THRESHOLD: &str = "TOUCH_VISION_TEXT_THRESHOLD";
pub const ENV_ANY_TEXT_THRESHOLD: &str = "TOUCH_VISION_ANY_TEXT_THRESHOLD";
pub const ENV_TEMPLATE_THRESHOLD: &str = "TOUCH_VISION_TEMPLATE_THRESHOLD";
pub const ENV_CONTENT_THRESHOLD: &str = "TOUCH_VISION_CONTENT_THRESHOLD";
pub const ENV_SESSION_DIR: &str = "TOUCH_VISION_SESSION_DIR";
pub const ENV_ASSETS_DIR: &str = "TOUCH_VISION_ASSETS_DIR";
pub const ENV_LOG: &str = "TOUCH_VISION_LOG";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for Touch Vision
#[derive(Debug, Clone)]
pub struct Config {
    /// Device channel configuration
    pub device: DeviceSettings,
    /// Visual verification configuration
    pub oracle: OracleSettings,
    /// Session configuration
    pub session: SessionSettings,
}

/// Device channel settings
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// adb executable
    pub adb_path: String,
    /// Per-command timeout (seconds)
    pub adb_timeout: u64,
    /// Transient capture retry budget (milliseconds)
    pub capture_timeout_ms: u64,
}

/// Oracle thresholds and polling
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub tesseract_path: String,
    pub poll_interval_ms: u64,
    pub text_threshold: f64,
    pub any_text_threshold: f64,
    pub template_threshold: f64,
    pub content_threshold: f64,
    /// Directory relative template paths are resolved against
    pub assets_dir: String,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            device: DeviceSettings::from_env(),
            oracle: OracleSettings::from_env(),
            session: SessionSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            device: DeviceSettings::defaults(),
            oracle: OracleSettings::defaults(),
            session: SessionSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DeviceSettings {
    pub fn from_env() -> Self {
        Self {
            adb_path: env::var(ENV_ADB_PATH).unwrap_or_else(|_| DEFAULT_ADB_PATH.to_string()),
            adb_timeout: parse_env(ENV_ADB_TIMEOUT).unwrap_or(DEFAULT_ADB_TIMEOUT),
            capture_timeout_ms: parse_env(ENV_CAPTURE_TIMEOUT_MS).unwrap_or(DEFAULT_CAPTURE_TIMEOUT_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            adb_path: DEFAULT_ADB_PATH.to_string(),
            adb_timeout: DEFAULT_ADB_TIMEOUT,
            capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT_MS,
        }
    }
}

impl OracleSettings {
    pub fn from_env() -> Self {
        Self {
            tesseract_path: env::var(ENV_TESSERACT_PATH)
                .unwrap_or_else(|_| DEFAULT_TESSERACT_PATH.to_string()),
            poll_interval_ms: parse_env(ENV_POLL_INTERVAL_MS).unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            text_threshold: parse_unit(ENV_TEXT_THRESHOLD).unwrap_or(DEFAULT_TEXT_THRESHOLD),
            any_text_threshold: parse_unit(ENV_ANY_TEXT_THRESHOLD).unwrap_or(DEFAULT_ANY_TEXT_THRESHOLD),
            template_threshold: parse_unit(ENV_TEMPLATE_THRESHOLD).unwrap_or(DEFAULT_TEMPLATE_THRESHOLD),
            content_threshold: parse_unit(ENV_CONTENT_THRESHOLD).unwrap_or(DEFAULT_CONTENT_THRESHOLD),
            assets_dir: env::var(ENV_ASSETS_DIR).unwrap_or_else(|_| DEFAULT_ASSETS_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            tesseract_path: DEFAULT_TESSERACT_PATH.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            text_threshold: DEFAULT_TEXT_THRESHOLD,
            any_text_threshold: DEFAULT_ANY_TEXT_THRESHOLD,
            template_threshold: DEFAULT_TEMPLATE_THRESHOLD,
            content_threshold: DEFAULT_CONTENT_THRESHOLD,
            assets_dir: DEFAULT_ASSETS_DIR.to_string(),
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            base_dir: env::var(ENV_SESSION_DIR).unwrap_or_else(|_| DEFAULT_SESSION_DIR.to_string()),
        }
    }

    pub fn defaults() -> Self {
        Self {
            base_dir: DEFAULT_SESSION_DIR.to_string(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Thresholds outside [0,1] are ignored
fn parse_unit(name: &str) -> Option<f64> {
    parse_env::<f64>(name).filter(|v| (0.0..=1.0).contains(v))
}

/// Log filter directive: `TOUCH_VISION_LOG`, then `RUST_LOG`, then the default
pub fn log_filter() -> String {
    env::var(ENV_LOG)
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

/// Get session base directory (convenience function)
pub fn session_base_dir() -> String {
    get().session.base_dir.clone()
}

/// Get adb path (convenience function)
pub fn adb_path() -> String {
    get().device.adb_path.clone()
}
