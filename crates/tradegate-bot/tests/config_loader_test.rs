//! Configuration loading from disk and the environment.

mod integration;
use integration::common::config_toml;

use std::io::Write;

use rust_decimal_macros::dec;
use tempfile::NamedTempFile;

use tradegate_bot::AppConfig;
use tradegate_core::Money;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_from_file_matches_from_str() {
    let file = write_config(&config_toml("0.01"));
    let from_file = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
    let from_str = AppConfig::from_toml_str(&config_toml("0.01")).unwrap();

    assert_eq!(from_file.instruments, from_str.instruments);
    assert_eq!(from_file.sizing, from_str.sizing);
    assert_eq!(
        from_file.accounts[0].initial_balance,
        Some(Money::new(dec!(10000)))
    );
    assert!(from_file.store.is_memory());
    assert!(from_file.paper.enabled);
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::from_file("/nonexistent/tradegate.toml").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config(&config_toml("0.01"));
    std::env::set_var("TRADEGATE__RECONCILER__COMMAND_TIMEOUT_SECS", "90");
    let config = AppConfig::from_file(file.path().to_str().unwrap());
    std::env::remove_var("TRADEGATE__RECONCILER__COMMAND_TIMEOUT_SECS");

    assert_eq!(config.unwrap().reconciler.command_timeout_secs, 90);
}

#[test]
fn test_invalid_file_fails_validation() {
    let broken = config_toml("0.01").replace(
        r#"max_loss_per_trade = "5""#,
        r#"max_loss_per_trade = "0""#,
    );
    let file = write_config(&broken);
    let err = AppConfig::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("max_loss_per_trade"));
}

#[test]
fn test_bundled_default_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/default.toml");
    let content = std::fs::read_to_string(path).unwrap();
    let config = AppConfig::from_toml_str(&content).unwrap();
    assert_eq!(config.instruments.len(), 2);
    assert_eq!(config.sizing.tiers.len(), 4);
    assert_eq!(config.breaker.daily_loss_limit, Money::new(dec!(200)));
}
