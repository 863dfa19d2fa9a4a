use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure.
///
/// Built once at startup and passed to each component; there is no
/// hot-reload path.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub symbols: Vec<SymbolConfig>,
    pub signals: SignalConfig,
    pub gap: GapConfig,
    pub limits: LimitsConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-symbol core allocation target
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    /// Core target as a fraction of account equity (e.g. 0.05 = 5%)
    pub core_target_percent: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// RSI period, shared by all three timeframes
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// Entry threshold: cross above fires the entry signal
    pub entry_threshold: Decimal,
    /// Weekly RSI above this is a risk-off trigger
    pub risk_off_threshold: Decimal,
    /// Daily RSI must close below this to re-enter risk-on
    pub risk_on_daily_threshold: Decimal,
}

fn default_rsi_period() -> usize {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct GapConfig {
    /// Minimum gap size as a fraction of previous close (e.g. 0.01 = 1%)
    pub threshold_percent: Decimal,
    /// Detection window length from session open, in minutes
    #[serde(default = "default_gap_window_minutes")]
    pub window_minutes: u32,
    /// Pre-market session open, exchange-local wall clock ("04:00")
    pub session_open: String,
    /// Discount off the last price for the repriced sell (0.001 = 0.1%)
    #[serde(default = "default_reprice_discount")]
    pub reprice_discount: Decimal,
}

fn default_gap_window_minutes() -> u32 {
    15
}

fn default_reprice_discount() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Size of each entry / core-build buy, fraction of equity (0.01 = 1%)
    pub order_size_percent: Decimal,
    /// Fraction of each core cycle retained as core (0.25 = 25%)
    pub retain_percent: Decimal,
    /// Profit target over cost basis for exits (0.01 = 1%)
    pub profit_target_percent: Decimal,
    /// Allowed exposure above the core target (0.05 = 5%)
    pub position_buffer_percent: Decimal,
    /// Minimum cash as a fraction of equity (0.20 = 20%)
    pub min_cash_percent: Decimal,
    /// Maximum invested as a fraction of equity (0.80 = 80%)
    pub max_invested_percent: Decimal,
    /// Core fraction sold per unwind tranche (0.05 = 5%)
    pub unwind_tranche_percent: Decimal,
    /// Price increase between unwind tranches (0.02 = 2%)
    pub unwind_price_step_percent: Decimal,
    /// Shares of ledger/broker divergence tolerated before halting
    #[serde(default)]
    pub reconcile_tolerance: u64,
}

impl LimitsConfig {
    /// Equity fraction retained per completed core cycle
    /// (order size x retain, 1% x 25% = 0.25%)
    pub fn retain_step(&self) -> Decimal {
        self.order_size_percent * self.retain_percent
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Unfilled deadline for standard limit orders, seconds
    #[serde(default = "default_limit_timeout_secs")]
    pub limit_order_timeout_secs: u64,
    /// Unfilled deadline for gap-reprice sells, seconds
    #[serde(default = "default_gap_timeout_secs")]
    pub gap_order_timeout_secs: u64,
    /// Attempts per broker submission before rejecting
    #[serde(default = "default_submit_retry_limit")]
    pub submit_retry_limit: u32,
    /// Cancel-and-resubmit rounds before giving up on a limit order
    #[serde(default = "default_reprice_retry_limit")]
    pub reprice_retry_limit: u32,
    /// Hard timeout on any single broker call, milliseconds
    #[serde(default = "default_broker_call_timeout_ms")]
    pub broker_call_timeout_ms: u64,
    /// Base delay for exponential submit backoff, milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_limit_timeout_secs() -> u64 {
    60
}

fn default_gap_timeout_secs() -> u64 {
    10
}

fn default_submit_retry_limit() -> u32 {
    3
}

fn default_reprice_retry_limit() -> u32 {
    3
}

fn default_broker_call_timeout_ms() -> u64 {
    5000
}

fn default_backoff_base_ms() -> u64 {
    100
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            limit_order_timeout_secs: default_limit_timeout_secs(),
            gap_order_timeout_secs: default_gap_timeout_secs(),
            submit_retry_limit: default_submit_retry_limit(),
            reprice_retry_limit: default_reprice_retry_limit(),
            broker_call_timeout_ms: default_broker_call_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("KEEL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (KEEL_GAP__THRESHOLD_PERCENT, etc.)
            .add_source(
                Environment::with_prefix("KEEL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Core target for a symbol, if configured
    pub fn core_target(&self, symbol: &str) -> Option<Decimal> {
        self.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.core_target_percent)
    }

    /// Parsed pre-market session open time
    pub fn session_open_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.gap.session_open, "%H:%M").map_err(|e| {
            ConfigError::Message(format!("invalid gap.session_open '{}': {e}", self.gap.session_open))
        })
    }

    /// Default configuration for paper trading and tests
    pub fn default_config() -> Self {
        use rust_decimal_macros::dec;

        Self {
            symbols: vec![
                SymbolConfig {
                    symbol: "SOXL".to_string(),
                    core_target_percent: dec!(0.05),
                },
                SymbolConfig {
                    symbol: "TQQQ".to_string(),
                    core_target_percent: dec!(0.03),
                },
            ],
            signals: SignalConfig {
                rsi_period: 7,
                entry_threshold: dec!(30),
                risk_off_threshold: dec!(70),
                risk_on_daily_threshold: dec!(30),
            },
            gap: GapConfig {
                threshold_percent: dec!(0.01),
                window_minutes: 15,
                session_open: "04:00".to_string(),
                reprice_discount: dec!(0.001),
            },
            limits: LimitsConfig {
                order_size_percent: dec!(0.01),
                retain_percent: dec!(0.25),
                profit_target_percent: dec!(0.01),
                position_buffer_percent: dec!(0.05),
                min_cash_percent: dec!(0.20),
                max_invested_percent: dec!(0.80),
                unwind_tranche_percent: dec!(0.05),
                unwind_price_step_percent: dec!(0.02),
                reconcile_tolerance: 0,
            },
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() {
            errors.push("at least one symbol must be configured".to_string());
        }

        for s in &self.symbols {
            if s.core_target_percent <= Decimal::ZERO || s.core_target_percent >= Decimal::ONE {
                errors.push(format!(
                    "core_target_percent for {} must be between 0 and 1",
                    s.symbol
                ));
            }
        }

        if self.signals.rsi_period == 0 {
            errors.push("rsi_period must be positive".to_string());
        }

        if self.limits.order_size_percent <= Decimal::ZERO {
            errors.push("order_size_percent must be positive".to_string());
        }

        if self.limits.retain_percent <= Decimal::ZERO || self.limits.retain_percent > Decimal::ONE {
            errors.push("retain_percent must be in (0, 1]".to_string());
        }

        if self.gap.threshold_percent <= Decimal::ZERO {
            errors.push("gap.threshold_percent must be positive".to_string());
        }

        if self.session_open_time().is_err() {
            errors.push(format!(
                "gap.session_open '{}' is not HH:MM",
                self.gap.session_open
            ));
        }

        if self.execution.gap_order_timeout_secs >= self.execution.limit_order_timeout_secs {
            errors.push(
                "gap_order_timeout_secs should be shorter than limit_order_timeout_secs"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_validates() {
        let config = AppConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn retain_step_is_quarter_percent() {
        let config = AppConfig::default_config();
        // 1% order size x 25% retained = 0.25% of equity per cycle
        assert_eq!(config.limits.retain_step(), dec!(0.0025));
    }

    #[test]
    fn session_open_parses() {
        let config = AppConfig::default_config();
        let t = config.session_open_time().unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(4, 0, 0).unwrap());
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let mut config = AppConfig::default_config();
        config.execution.gap_order_timeout_secs = 120;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("gap_order_timeout")));
    }

    #[test]
    fn core_target_lookup() {
        let config = AppConfig::default_config();
        assert_eq!(config.core_target("SOXL"), Some(dec!(0.05)));
        assert_eq!(config.core_target("NOPE"), None);
    }
}
