use crate::error::{BotError, Result};
use crate::models::TrackedAsset;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Business-policy constants for the position sizer.
///
/// The 2x strength cap and 5-decimal lot rounding are policy carried from the
/// running system; they are configurable here rather than hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Signal strength above this value no longer increases the notional.
    pub strength_cap: f64,
    /// Decimal places the order quantity is rounded to (exchange lot size).
    pub size_decimals: u32,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            strength_cap: 2.0,
            size_decimals: 5,
        }
    }
}

/// Credentials and endpoint for the OKX REST API.
#[derive(Debug, Clone)]
pub struct OkxCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    pub base_url: String,
}

/// Complete configuration for the bot, built once at startup and passed into
/// constructors. Business logic never reads the environment directly.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Interval between evaluation passes.
    pub check_interval: Duration,
    /// Minimum absolute flow value (USD) that produces a signal.
    pub min_flow_threshold: f64,
    /// Maximum position notional (USDT) before strength scaling.
    pub max_position_notional: f64,
    pub sizing: SizingConfig,
    pub tracked_assets: Vec<TrackedAsset>,
    pub database_url: String,
    pub okx: OkxCredentials,
}

pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MIN_FLOW_THRESHOLD: f64 = 1_000_000.0;
pub const DEFAULT_MAX_POSITION_NOTIONAL: f64 = 1_000.0;
pub const DEFAULT_OKX_BASE_URL: &str = "https://www.okx.com";

impl BotConfig {
    /// Build configuration from the process environment.
    ///
    /// Expects `dotenvy::dotenv()` to have been called already. Fails fast on
    /// missing credentials or unparsable numbers instead of falling back
    /// silently mid-run.
    pub fn from_env() -> Result<Self> {
        let check_interval_ms =
            parse_env("CHECK_INTERVAL_MS", DEFAULT_CHECK_INTERVAL_MS)?;
        let min_flow_threshold =
            parse_env("MIN_FLOW_THRESHOLD", DEFAULT_MIN_FLOW_THRESHOLD)?;
        let max_position_notional =
            parse_env("MAX_POSITION_NOTIONAL", DEFAULT_MAX_POSITION_NOTIONAL)?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/etf_tracker".to_string());

        let okx = OkxCredentials {
            api_key: require_env("OKX_API_KEY")?,
            secret_key: require_env("OKX_SECRET_KEY")?,
            passphrase: require_env("OKX_PASSPHRASE")?,
            base_url: std::env::var("OKX_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OKX_BASE_URL.to_string()),
        };

        let config = Self {
            check_interval: Duration::from_millis(check_interval_ms),
            min_flow_threshold,
            max_position_notional,
            sizing: SizingConfig::default(),
            tracked_assets: default_tracked_assets(),
            database_url,
            okx,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(BotError::Config(
                "check interval must be positive".to_string(),
            ));
        }
        if self.min_flow_threshold <= 0.0 {
            return Err(BotError::Config(format!(
                "min flow threshold must be positive, got {}",
                self.min_flow_threshold
            )));
        }
        if self.max_position_notional <= 0.0 {
            return Err(BotError::Config(format!(
                "max position notional must be positive, got {}",
                self.max_position_notional
            )));
        }
        if self.sizing.strength_cap < 1.0 {
            return Err(BotError::Config(format!(
                "strength cap must be at least 1.0, got {}",
                self.sizing.strength_cap
            )));
        }
        if self.tracked_assets.is_empty() {
            return Err(BotError::Config(
                "at least one tracked asset is required".to_string(),
            ));
        }
        if self.okx.api_key.is_empty()
            || self.okx.secret_key.is_empty()
            || self.okx.passphrase.is_empty()
        {
            return Err(BotError::Config(
                "OKX credentials must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The spot instruments the running system trades against.
pub fn default_tracked_assets() -> Vec<TrackedAsset> {
    vec![
        TrackedAsset::new("BTC", "BTC-USDT"),
        TrackedAsset::new("ETH", "ETH-USDT"),
    ]
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| BotError::Config(format!("{} not set", key)))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BotError::Config(format!("{} is not a valid number: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
