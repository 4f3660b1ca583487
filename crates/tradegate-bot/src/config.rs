//! Application configuration.
//!
//! Loaded from TOML and layered with `TRADEGATE__SECTION__KEY` environment
//! overrides, e.g. `TRADEGATE__BREAKER__FAILURE_THRESHOLD=3`.

use std::collections::HashSet;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tradegate_core::{AccountId, InstrumentEntry, Money};
use tradegate_executor::{ControllerSettings, EvaluatorConfig, PaperConfig, ReconcilerConfig};
use tradegate_intake::IntakeConfig;
use tradegate_risk::{BreakerConfig, SizingConfig};

use crate::error::{AppError, AppResult};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TRADEGATE";

/// Durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// sqlx SQLite URL, or `memory` for the in-process store.
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_store_url() -> String {
    "sqlite://data/tradegate.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
}

/// One account the controller evaluates signals for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    /// Balance written to the store at startup. Leave unset when an
    /// external process maintains balances.
    #[serde(default)]
    pub initial_balance: Option<Money>,
}

/// Audit log destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for `audit_YYYY-MM-DD.jsonl`.
    #[serde(default = "default_audit_dir")]
    pub dir: String,
    /// Also emit audit records as tracing events.
    #[serde(default = "default_true")]
    pub tracing: bool,
}

fn default_audit_dir() -> String {
    "./data/audit".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            tracing: true,
        }
    }
}

/// Prometheus text snapshot for a node-exporter textfile collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Snapshot destination. Unset disables the writer.
    #[serde(default)]
    pub textfile: Option<String>,
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    15
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile: None,
            interval_secs: default_metrics_interval_secs(),
        }
    }
}

/// Simulated gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperSection {
    /// Run the paper gateway alongside the controller.
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub gateway: PaperConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub instruments: Vec<InstrumentEntry>,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub paper: PaperSection,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Load `path`, apply environment overrides and validate.
    pub fn from_file(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            return Err(AppError::Config(format!("Config file not found: {path}")));
        }
        let config: Self = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without environment overrides, then validate.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Pipeline tunables shared by every dispatcher.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            intake: self.intake.clone(),
            sizing: self.sizing.clone(),
            breaker: self.breaker.clone(),
        }
    }

    /// Reject inconsistent values before anything touches the store.
    pub fn validate(&self) -> AppResult<()> {
        if self.accounts.is_empty() {
            return Err(AppError::Config("at least one account is required".into()));
        }
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(&account.id) {
                return Err(AppError::Config(format!("duplicate account {}", account.id)));
            }
        }

        if self.instruments.is_empty() {
            return Err(AppError::Config("instrument list is empty".into()));
        }
        let mut seen = HashSet::new();
        for entry in &self.instruments {
            if !seen.insert(&entry.instrument) {
                return Err(AppError::Config(format!(
                    "duplicate instrument {}",
                    entry.instrument
                )));
            }
            entry.spec.validate().map_err(|e| {
                AppError::Config(format!("instrument {}: {e}", entry.instrument))
            })?;
            let confidence = entry.risk.min_confidence;
            if confidence < Decimal::ZERO || confidence > Decimal::ONE_HUNDRED {
                return Err(AppError::Config(format!(
                    "instrument {}: min_confidence must be within 0-100, got {confidence}",
                    entry.instrument
                )));
            }
            if !entry.risk.max_loss_per_trade.is_positive() {
                return Err(AppError::Config(format!(
                    "instrument {}: max_loss_per_trade must be positive",
                    entry.instrument
                )));
            }
            if entry.risk.max_positions == 0 {
                return Err(AppError::Config(format!(
                    "instrument {}: max_positions must be at least 1",
                    entry.instrument
                )));
            }
        }

        self.intake.validate()?;
        self.sizing.validate()?;
        self.breaker.validate()?;

        if self.reconciler.command_timeout_secs == 0 {
            return Err(AppError::Config("command_timeout_secs must be positive".into()));
        }
        if self.reconciler.interval_ms == 0 || self.evaluator.interval_ms == 0 {
            return Err(AppError::Config("loop intervals must be positive".into()));
        }
        if self.metrics.textfile.is_some() && self.metrics.interval_secs == 0 {
            return Err(AppError::Config("metrics interval_secs must be positive".into()));
        }
        if self.paper.enabled && self.paper.gateway.poll_interval_ms == 0 {
            return Err(AppError::Config("paper poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINIMAL: &str = r#"
        [[accounts]]
        id = "acc-1"
        initial_balance = "10000"

        [[instruments]]
        instrument = "EURUSD"

        [instruments.risk]
        max_loss_per_trade = "5"

        [instruments.spec]
        price_precision = 5
        unit_value = "100000"
        min_volume = "0.001"
        max_volume = "10"
        volume_step = "0.001"
    "#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 300);
        assert_eq!(config.reconciler.command_timeout_secs, 60);
        assert_eq!(config.intake.dedup_window_secs, 3600);
        assert_eq!(config.intake.staleness_secs, 300);

        let eurusd = &config.instruments[0];
        assert_eq!(eurusd.risk.max_positions, 1);
        assert_eq!(eurusd.risk.max_loss_per_trade, Money::new(dec!(5)));
        assert_eq!(config.accounts[0].initial_balance, Some(Money::new(dec!(10000))));
        assert!(!config.paper.enabled);
        assert!(config.metrics.textfile.is_none());
    }

    #[test]
    fn test_rejects_empty_instruments() {
        let err = AppConfig::from_toml_str(
            r#"
            [[accounts]]
            id = "acc-1"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("instrument list is empty"));
    }

    #[test]
    fn test_rejects_inverted_volume_range() {
        let broken = MINIMAL.replace(r#"max_volume = "10""#, r#"max_volume = "0.0001""#);
        assert!(AppConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let broken = MINIMAL.replace(
            r#"max_loss_per_trade = "5""#,
            "max_loss_per_trade = \"5\"\nmin_confidence = \"120\"",
        );
        let err = AppConfig::from_toml_str(&broken).unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn test_paper_section_flattens_policy() {
        let with_paper = format!(
            "{MINIMAL}\n[paper]\nenabled = true\npoll_interval_ms = 250\n[paper.policy]\nmode = \"reject\"\nreason = \"closed\"\n"
        );
        let config = AppConfig::from_toml_str(&with_paper).unwrap();
        assert!(config.paper.enabled);
        assert_eq!(config.paper.gateway.poll_interval_ms, 250);
        assert_eq!(
            config.paper.gateway.policy,
            tradegate_executor::PaperPolicy::Reject {
                reason: "closed".into()
            }
        );
    }
}
