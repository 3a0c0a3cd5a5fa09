//! Configuration management
//! Supports TOML, YAML, JSON config files

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::grid::{Direction, DistanceMode, GridSettings};

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account identity for monitoring rows
    pub account: AccountConfig,
    /// Grid ladder parameters
    pub grid: GridConfig,
    /// Position and order limits
    pub risk: RiskConfig,
    /// Reconciliation engine timing
    pub engine: EngineConfig,
    /// Relational store settings
    pub database: DatabaseConfig,
    /// Logging level
    pub log_level: Option<String>,
}

/// Account identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Stable account key, unique key of the monitor row
    pub userid: String,
    pub username: String,
}

/// Grid ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Levels per side (default: 3)
    pub level_count: u32,
    /// Per-level distance (default: 0.01 = 1% in percentage mode)
    pub distance: Decimal,
    /// "percentage" or "absolute" (default: percentage)
    pub distance_mode: DistanceMode,
    /// Size per level before lot rounding (default: 1)
    pub order_size: Decimal,
    /// Venue price increment (default: 0.01)
    pub tick_size: Decimal,
    /// Venue size increment (default: 0.01)
    pub lot_size: Decimal,
    /// Reference drift that triggers a re-plan (default: 0.02)
    pub recenter_threshold: Decimal,
    /// "long" or "short" (default: long)
    pub direction: Direction,
}

/// Risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Absolute net position cap (default: 5)
    pub max_position: Decimal,
    /// Counter each partial fill immediately instead of waiting for the
    /// order to complete
    pub fix_order_enabled: bool,
    /// Immediately flatten every fill with a market order
    pub auto_close_enabled: bool,
    /// Working orders allowed per side; excess farthest orders are pruned
    /// (default: 10)
    pub max_orders_per_side: usize,
}

/// Reconciliation engine timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds to wait for a placement ack before querying (default: 10)
    pub ack_deadline_secs: u64,
    /// Seconds between authoritative snapshot polls (default: 30)
    pub snapshot_interval_secs: u64,
    /// Position divergence tolerated before correction; defaults to one lot
    pub position_tolerance: Option<Decimal>,
    /// Batch profit rows and flush on this interval; None writes per fill
    pub profit_flush_secs: Option<u64>,
    /// Minimum milliseconds between venue calls (default: 200)
    pub place_min_interval_ms: u64,
    /// Seconds between status report lines (default: 60)
    pub report_interval_secs: u64,
}

/// Relational store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL (default: sqlite file next to the binary)
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: AccountConfig::default(),
            grid: GridConfig::default(),
            risk: RiskConfig::default(),
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            userid: "grid-pilot-1".to_string(),
            username: "grid-pilot".to_string(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            level_count: 3,
            distance: dec!(0.01),
            distance_mode: DistanceMode::Percentage,
            order_size: dec!(1),
            tick_size: dec!(0.01),
            lot_size: dec!(0.01),
            recenter_threshold: dec!(0.02),
            direction: Direction::Long,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position: dec!(5),
            fix_order_enabled: false,
            auto_close_enabled: false,
            max_orders_per_side: 10,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 10,
            snapshot_interval_secs: 30,
            position_tolerance: None,
            profit_flush_secs: None,
            place_min_interval_ms: 200,
            report_interval_secs: 60,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://grid-pilot.db".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;

        let config: Config = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::from_str(&content)?
        } else if path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            serde_yaml::from_str(&content)?
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            // Try to auto-detect format
            if content.trim().starts_with('{') {
                serde_json::from_str(&content)?
            } else {
                toml::from_str(&content)?
            }
        };

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from default locations, falling back to environment variables
    pub fn load() -> anyhow::Result<Self> {
        let locations = [
            "grid-pilot.toml",
            "grid-pilot.yaml",
            "grid-pilot.yml",
            "config.toml",
            "config.yaml",
            ".grid-pilot.toml",
        ];

        for location in &locations {
            if Path::new(location).exists() {
                return Self::from_file(location);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_file = config_dir.join("grid-pilot/config.toml");
            if config_file.exists() {
                return Self::from_file(config_file);
            }
        }

        info!("No configuration file found, reading environment");
        from_env()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.account.userid.is_empty() {
            anyhow::bail!("account.userid is required");
        }
        if self.grid.level_count < 1 {
            anyhow::bail!("grid.level_count must be at least 1");
        }
        if self.grid.distance <= Decimal::ZERO {
            anyhow::bail!("grid.distance must be positive");
        }
        if self.grid.order_size <= Decimal::ZERO {
            anyhow::bail!("grid.order_size must be positive");
        }
        if self.grid.tick_size <= Decimal::ZERO || self.grid.lot_size <= Decimal::ZERO {
            anyhow::bail!("grid.tick_size and grid.lot_size must be positive");
        }
        if self.grid.recenter_threshold <= Decimal::ZERO {
            anyhow::bail!("grid.recenter_threshold must be positive");
        }
        if self.risk.max_position <= Decimal::ZERO {
            anyhow::bail!("risk.max_position must be positive");
        }
        if self.risk.fix_order_enabled && self.risk.auto_close_enabled {
            anyhow::bail!("risk.fix_order_enabled and risk.auto_close_enabled are mutually exclusive");
        }
        if self.risk.max_orders_per_side == 0 {
            anyhow::bail!("risk.max_orders_per_side must be at least 1");
        }
        if self.engine.ack_deadline_secs == 0 {
            anyhow::bail!("engine.ack_deadline_secs must be positive");
        }
        if self.engine.snapshot_interval_secs == 0 {
            anyhow::bail!("engine.snapshot_interval_secs must be positive");
        }
        if let Some(tolerance) = self.engine.position_tolerance {
            if tolerance < Decimal::ZERO {
                anyhow::bail!("engine.position_tolerance must not be negative");
            }
        }
        if self.database.url.is_empty() {
            anyhow::bail!("database.url is required");
        }
        Ok(())
    }

    /// Planner settings derived from the grid section.
    pub fn grid_settings(&self) -> GridSettings {
        GridSettings {
            level_count: self.grid.level_count,
            distance: self.grid.distance,
            distance_mode: self.grid.distance_mode,
            order_size: self.grid.order_size,
            tick_size: self.grid.tick_size,
            lot_size: self.grid.lot_size,
            recenter_threshold: self.grid.recenter_threshold,
            direction: self.grid.direction,
        }
    }

    /// Divergence tolerance; defaults to one lot when not configured.
    pub fn position_tolerance(&self) -> Decimal {
        self.engine
            .position_tolerance
            .unwrap_or(self.grid.lot_size)
    }
}

fn env_decimal(name: &str, default: Decimal) -> Decimal {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load config from environment variables (fallback)
pub fn from_env() -> anyhow::Result<Config> {
    use std::env;

    let defaults = Config::default();
    let config = Config {
        account: AccountConfig {
            userid: env::var("GRID_USERID").unwrap_or(defaults.account.userid),
            username: env::var("GRID_USERNAME").unwrap_or(defaults.account.username),
        },
        grid: GridConfig {
            level_count: env_parse("GRID_LEVELS", defaults.grid.level_count),
            distance: env_decimal("GRID_DISTANCE", defaults.grid.distance),
            distance_mode: match env::var("GRID_DISTANCE_MODE").as_deref() {
                Ok("absolute") => DistanceMode::Absolute,
                _ => defaults.grid.distance_mode,
            },
            order_size: env_decimal("GRID_ORDER_SIZE", defaults.grid.order_size),
            tick_size: env_decimal("GRID_TICK_SIZE", defaults.grid.tick_size),
            lot_size: env_decimal("GRID_LOT_SIZE", defaults.grid.lot_size),
            recenter_threshold: env_decimal(
                "GRID_RECENTER_THRESHOLD",
                defaults.grid.recenter_threshold,
            ),
            direction: match env::var("GRID_DIRECTION").as_deref() {
                Ok("short") => Direction::Short,
                _ => defaults.grid.direction,
            },
        },
        risk: RiskConfig {
            max_position: env_decimal("MAX_POSITION", defaults.risk.max_position),
            fix_order_enabled: env_parse("FIX_ORDER_ENABLED", defaults.risk.fix_order_enabled),
            auto_close_enabled: env_parse("AUTO_CLOSE_ENABLED", defaults.risk.auto_close_enabled),
            max_orders_per_side: env_parse(
                "MAX_ORDERS_PER_SIDE",
                defaults.risk.max_orders_per_side,
            ),
        },
        engine: EngineConfig {
            ack_deadline_secs: env_parse("ACK_DEADLINE_SECS", defaults.engine.ack_deadline_secs),
            snapshot_interval_secs: env_parse(
                "SNAPSHOT_INTERVAL_SECS",
                defaults.engine.snapshot_interval_secs,
            ),
            position_tolerance: env::var("POSITION_TOLERANCE")
                .ok()
                .and_then(|s| s.parse().ok()),
            profit_flush_secs: env::var("PROFIT_FLUSH_SECS")
                .ok()
                .and_then(|s| s.parse().ok()),
            place_min_interval_ms: env_parse(
                "PLACE_MIN_INTERVAL_MS",
                defaults.engine.place_min_interval_ms,
            ),
            report_interval_secs: env_parse(
                "REPORT_INTERVAL_SECS",
                defaults.engine.report_interval_secs,
            ),
        },
        database: DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
        },
        log_level: env::var("LOG_LEVEL").ok().or(defaults.log_level),
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid.level_count, 3);
        assert_eq!(config.risk.max_position, dec!(5));
    }

    #[test]
    fn test_policies_are_mutually_exclusive() {
        let mut config = Config::default();
        config.risk.fix_order_enabled = true;
        config.risk.auto_close_enabled = true;
        assert!(config.validate().is_err());

        config.risk.auto_close_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let mut config = Config::default();
        config.grid.distance = dec!(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.grid.level_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tolerance_defaults_to_one_lot() {
        let config = Config::default();
        assert_eq!(config.position_tolerance(), config.grid.lot_size);

        let mut config = Config::default();
        config.engine.position_tolerance = Some(dec!(0.5));
        assert_eq!(config.position_tolerance(), dec!(0.5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [grid]
            level_count = 5

            [risk]
            max_position = "2"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.grid.level_count, 5);
        assert_eq!(parsed.risk.max_position, dec!(2));
        assert_eq!(parsed.engine.ack_deadline_secs, 10);
    }
}
