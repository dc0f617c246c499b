//! Layered configuration loading utilities.
//!
//! A single immutable configuration object is loaded and validated at
//! startup. Live and simulation runs must share the same configuration for
//! a run to be comparable; only the broker implementation differs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod deserializer;

/// Execution mode. Identical logic in both; only the broker differs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Simulation,
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub locking: ProfitLockConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub micro_profit: MicroProfitConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Position sizing and the hard loss cap.
#[derive(Clone, Debug, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_risk_per_trade_usd")]
    pub max_risk_per_trade_usd: Decimal,
    #[serde(default = "default_default_lot")]
    pub default_lot: Decimal,
    #[serde(default = "default_max_lot_cap")]
    pub max_lot_cap: Decimal,
    /// `None` (or `-1` in config files) disables the cap entirely.
    #[serde(default, with = "deserializer::optional_cap")]
    pub max_open_trades: Option<u32>,
}

/// Parameters of the profit-locking state machine.
#[derive(Clone, Debug, Deserialize)]
pub struct ProfitLockConfig {
    #[serde(default = "default_sweet_spot_min_usd")]
    pub sweet_spot_min_usd: Decimal,
    #[serde(default = "default_sweet_spot_max_usd")]
    pub sweet_spot_max_usd: Decimal,
    #[serde(default = "default_trailing_increment_usd")]
    pub trailing_increment_usd: Decimal,
    #[serde(default = "default_pullback_tolerance_pct")]
    pub pullback_tolerance_pct: Decimal,
    #[serde(default = "default_big_jump_threshold_usd")]
    pub big_jump_threshold_usd: Decimal,
    #[serde(default = "default_big_jump_lock_margin_usd")]
    pub big_jump_lock_margin_usd: Decimal,
    #[serde(default = "default_max_peak_lock_usd")]
    pub max_peak_lock_usd: Decimal,
}

/// SL worker, locking, throttling, retry, and verification knobs.
#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionConfig {
    /// Worker cadence; a 50 ms floor is enforced at validation.
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,
    #[serde(default = "default_lock_timeout_ms_normal")]
    pub lock_timeout_ms_normal: u64,
    #[serde(default = "default_lock_timeout_ms_profit_locking")]
    pub lock_timeout_ms_profit_locking: u64,
    #[serde(default = "default_max_lock_hold_ms")]
    pub max_lock_hold_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_sl_update_min_interval_ms")]
    pub sl_update_min_interval_ms_per_ticket: u64,
    #[serde(default = "default_global_rpc_rate_per_sec")]
    pub global_rpc_rate_per_sec: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_verification_delay_ms")]
    pub verification_delay_ms: u64,
    #[serde(default = "default_verification_tolerance_points")]
    pub verification_tolerance_points: u32,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_cooloff_ms")]
    pub circuit_cooloff_ms: u64,
    #[serde(default = "default_disable_after_verification_mins")]
    pub disable_after_verification_failure_minutes: u64,
    #[serde(default = "default_slow_iteration_budget_ms")]
    pub slow_iteration_budget_ms: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

/// Entry gates evaluated during market scans.
#[derive(Clone, Debug, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: u32,
    #[serde(default = "default_news_block_window_minutes")]
    pub news_block_window_minutes: i64,
    #[serde(default = "default_market_close_buffer_minutes")]
    pub market_close_buffer_minutes: i64,
    #[serde(default = "default_min_bar_volume")]
    pub min_bar_volume: Decimal,
    #[serde(default)]
    pub spread: SpreadCeilings,
    /// Realized daily loss at which entries stand down.
    #[serde(default = "default_daily_loss_floor_usd")]
    pub daily_loss_floor_usd: Decimal,
    #[serde(default = "default_standdown_minutes")]
    pub standdown_minutes: i64,
}

/// Maximum spread, in points, per symbol class.
#[derive(Clone, Debug, Deserialize)]
pub struct SpreadCeilings {
    #[serde(default = "default_spread_majors")]
    pub majors_points: Decimal,
    #[serde(default = "default_spread_crypto")]
    pub crypto_points: Decimal,
    #[serde(default = "default_spread_other")]
    pub default_points: Decimal,
}

/// Micro-profit early-exit behavior.
#[derive(Clone, Debug, Deserialize)]
pub struct MicroProfitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Buffer above the sweet-spot floor covering spread and slippage.
    #[serde(default = "default_close_buffer_usd")]
    pub close_buffer_usd: Decimal,
    /// Extended multiples band above the sweet spot. Off until explicitly
    /// enabled.
    #[serde(default)]
    pub extended_band_enabled: bool,
    #[serde(default = "default_extended_band_margin_usd")]
    pub extended_band_margin_usd: Decimal,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_micro_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Compliance closure rules.
#[derive(Clone, Debug, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub require_swap_free: bool,
    #[serde(default = "default_max_overnight_hold_hours")]
    pub max_overnight_hold_hours: i64,
    #[serde(default = "default_compliance_check_interval_secs")]
    pub check_interval_secs: u64,
}

/// Market scan loop cadence.
#[derive(Clone, Debug, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
}

/// Append-only structured output settings.
#[derive(Clone, Debug, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_journal_flush_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_journal_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_metrics_snapshot_secs")]
    pub metrics_snapshot_secs: u64,
}

/// Logging and metrics endpoints.
#[derive(Clone, Debug, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_usd: default_max_risk_per_trade_usd(),
            default_lot: default_default_lot(),
            max_lot_cap: default_max_lot_cap(),
            max_open_trades: None,
        }
    }
}

impl Default for ProfitLockConfig {
    fn default() -> Self {
        Self {
            sweet_spot_min_usd: default_sweet_spot_min_usd(),
            sweet_spot_max_usd: default_sweet_spot_max_usd(),
            trailing_increment_usd: default_trailing_increment_usd(),
            pullback_tolerance_pct: default_pullback_tolerance_pct(),
            big_jump_threshold_usd: default_big_jump_threshold_usd(),
            big_jump_lock_margin_usd: default_big_jump_lock_margin_usd(),
            max_peak_lock_usd: default_max_peak_lock_usd(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_interval_ms: default_worker_interval_ms(),
            lock_timeout_ms_normal: default_lock_timeout_ms_normal(),
            lock_timeout_ms_profit_locking: default_lock_timeout_ms_profit_locking(),
            max_lock_hold_ms: default_max_lock_hold_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            sl_update_min_interval_ms_per_ticket: default_sl_update_min_interval_ms(),
            global_rpc_rate_per_sec: default_global_rpc_rate_per_sec(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            verification_delay_ms: default_verification_delay_ms(),
            verification_tolerance_points: default_verification_tolerance_points(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_cooloff_ms: default_circuit_cooloff_ms(),
            disable_after_verification_failure_minutes: default_disable_after_verification_mins(),
            slow_iteration_budget_ms: default_slow_iteration_budget_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_quality_score: default_min_quality_score(),
            news_block_window_minutes: default_news_block_window_minutes(),
            market_close_buffer_minutes: default_market_close_buffer_minutes(),
            min_bar_volume: default_min_bar_volume(),
            spread: SpreadCeilings::default(),
            daily_loss_floor_usd: default_daily_loss_floor_usd(),
            standdown_minutes: default_standdown_minutes(),
        }
    }
}

impl Default for SpreadCeilings {
    fn default() -> Self {
        Self {
            majors_points: default_spread_majors(),
            crypto_points: default_spread_crypto(),
            default_points: default_spread_other(),
        }
    }
}

impl Default for MicroProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            close_buffer_usd: default_close_buffer_usd(),
            extended_band_enabled: false,
            extended_band_margin_usd: default_extended_band_margin_usd(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_micro_retry_delay_ms(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_swap_free: true,
            max_overnight_hold_hours: default_max_overnight_hold_hours(),
            check_interval_secs: default_compliance_check_interval_secs(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: default_journal_dir(),
            flush_interval_ms: default_journal_flush_ms(),
            channel_capacity: default_journal_capacity(),
            metrics_snapshot_secs: default_metrics_snapshot_secs(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_path: None,
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            risk: RiskConfig::default(),
            locking: ProfitLockConfig::default(),
            execution: ExecutionConfig::default(),
            gates: GateConfig::default(),
            micro_profit: MicroProfitConfig::default(),
            compliance: ComplianceConfig::default(),
            scan: ScanConfig::default(),
            journal: JournalConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Validate cross-field invariants and apply documented floors.
    ///
    /// Called once at startup; the configuration is immutable afterwards.
    pub fn validate(&mut self) -> Result<()> {
        if self.risk.max_risk_per_trade_usd <= Decimal::ZERO {
            bail!("risk.max_risk_per_trade_usd must be positive");
        }
        if self.risk.default_lot <= Decimal::ZERO {
            bail!("risk.default_lot must be positive");
        }
        if self.risk.max_lot_cap < self.risk.default_lot {
            bail!("risk.max_lot_cap must be at least risk.default_lot");
        }
        if self.locking.sweet_spot_min_usd <= Decimal::ZERO
            || self.locking.sweet_spot_max_usd <= self.locking.sweet_spot_min_usd
        {
            bail!("locking sweet spot bounds must satisfy 0 < min < max");
        }
        if self.locking.trailing_increment_usd <= Decimal::ZERO {
            bail!("locking.trailing_increment_usd must be positive");
        }
        if self.locking.pullback_tolerance_pct <= Decimal::ZERO
            || self.locking.pullback_tolerance_pct >= Decimal::ONE
        {
            bail!("locking.pullback_tolerance_pct must be in (0, 1)");
        }
        if self.execution.worker_interval_ms < 50 {
            self.execution.worker_interval_ms = 50;
        }
        if self.execution.max_retries == 0 {
            bail!("execution.max_retries must be at least 1");
        }
        if self.execution.circuit_breaker_threshold == 0 {
            bail!("execution.circuit_breaker_threshold must be at least 1");
        }
        if self.scan.cycle_interval_secs == 0 {
            bail!("scan.cycle_interval_secs must be positive");
        }
        Ok(())
    }
}

fn default_mode() -> Mode {
    Mode::Simulation
}

fn default_max_risk_per_trade_usd() -> Decimal {
    Decimal::new(2, 0)
}

fn default_default_lot() -> Decimal {
    Decimal::new(1, 2)
}

fn default_max_lot_cap() -> Decimal {
    Decimal::new(5, 2)
}

fn default_sweet_spot_min_usd() -> Decimal {
    Decimal::new(3, 2)
}

fn default_sweet_spot_max_usd() -> Decimal {
    Decimal::new(10, 2)
}

fn default_trailing_increment_usd() -> Decimal {
    Decimal::new(10, 2)
}

fn default_pullback_tolerance_pct() -> Decimal {
    Decimal::new(30, 2)
}

fn default_big_jump_threshold_usd() -> Decimal {
    Decimal::new(40, 2)
}

fn default_big_jump_lock_margin_usd() -> Decimal {
    Decimal::new(10, 2)
}

fn default_max_peak_lock_usd() -> Decimal {
    Decimal::new(80, 2)
}

fn default_worker_interval_ms() -> u64 {
    50
}

fn default_lock_timeout_ms_normal() -> u64 {
    1_000
}

fn default_lock_timeout_ms_profit_locking() -> u64 {
    2_000
}

fn default_max_lock_hold_ms() -> u64 {
    500
}

fn default_watchdog_interval_ms() -> u64 {
    100
}

fn default_sl_update_min_interval_ms() -> u64 {
    100
}

fn default_global_rpc_rate_per_sec() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_base_ms() -> u64 {
    100
}

fn default_verification_delay_ms() -> u64 {
    500
}

fn default_verification_tolerance_points() -> u32 {
    10
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

fn default_circuit_cooloff_ms() -> u64 {
    10_000
}

fn default_disable_after_verification_mins() -> u64 {
    10
}

fn default_slow_iteration_budget_ms() -> u64 {
    1_000
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

fn default_shutdown_drain_ms() -> u64 {
    2_000
}

fn default_min_quality_score() -> u32 {
    60
}

fn default_news_block_window_minutes() -> i64 {
    10
}

fn default_market_close_buffer_minutes() -> i64 {
    30
}

fn default_min_bar_volume() -> Decimal {
    Decimal::new(100, 0)
}

fn default_spread_majors() -> Decimal {
    Decimal::new(30, 0)
}

fn default_spread_crypto() -> Decimal {
    Decimal::new(500, 0)
}

fn default_spread_other() -> Decimal {
    Decimal::new(50, 0)
}

fn default_daily_loss_floor_usd() -> Decimal {
    Decimal::new(-10, 0)
}

fn default_standdown_minutes() -> i64 {
    60
}

fn default_close_buffer_usd() -> Decimal {
    Decimal::new(2, 2)
}

fn default_extended_band_margin_usd() -> Decimal {
    Decimal::new(2, 2)
}

fn default_micro_retry_delay_ms() -> u64 {
    10
}

fn default_max_overnight_hold_hours() -> i64 {
    20
}

fn default_compliance_check_interval_secs() -> u64 {
    60
}

fn default_cycle_interval_secs() -> u64 {
    60
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("./journal")
}

fn default_journal_flush_ms() -> u64 {
    1_000
}

fn default_journal_capacity() -> usize {
    4_096
}

fn default_metrics_snapshot_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9400".into()
}

fn default_true() -> bool {
    true
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `RATCHET_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("RATCHET")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    let mut app: AppConfig = config
        .try_deserialize()
        .map_err(|err: ConfigError| anyhow::Error::from(err))?;
    app.validate()?;
    Ok(app)
}
