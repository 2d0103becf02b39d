use std::env;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

fn get_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v.parse::<f64>().map_err(|e| anyhow!("{key} invalid float: {e}")),
    }
}

fn get_env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Decimal::from_str(&v).map_err(|e| anyhow!("{key} invalid decimal: {e}")),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v.parse::<usize>().map_err(|e| anyhow!("{key} invalid int: {e}")),
    }
}

fn get_env_u32(key: &str, default: u32) -> Result<u32> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => v.parse::<u32>().map_err(|e| anyhow!("{key} invalid int: {e}")),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSelectionConfig {
    pub min_days_to_expiry: i64,
    pub max_days_to_expiry: i64,
    pub target_days_to_expiry: i64,
    pub target_delta_open: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub enabled: bool,
    pub broker_credentials_ref: String,
    pub notifier_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mock_mode: bool,
    pub port: u16,
    pub host: String,

    pub position_polling_interval_minutes: u64,
    pub order_polling_interval_minutes: u64,
    pub max_polling_errors: u32,
    pub auto_start_polling: bool,

    pub spread_ratio_threshold: Decimal,
    pub spread_tick_multiple_threshold: Decimal,

    pub progressive_max_steps: u32,
    pub progressive_step_interval_seconds: u64,
    pub enable_market_fallback: bool,
    pub max_place_retries: u32,
    pub force_progress: bool,
    pub max_spread_holds: u32,

    pub delta_change_threshold: Decimal,
    pub delta_retention_days: i64,

    pub dedupe_window_seconds: u64,
    pub signal_timeout_seconds: u64,

    pub gateway_call_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,

    pub contract_selection: ContractSelectionConfig,
    pub accounts: Vec<AccountConfig>,

    pub sqlite_path: String,
    pub webhook_notifier_url: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let mock_mode = get_env_bool("MOCK_MODE", true);
        let port = get_env_usize("PORT", 8080)? as u16;
        let host = get_env_string("HOST", "0.0.0.0");

        let accounts = load_accounts()?;

        let s = Self {
            mock_mode,
            port,
            host,
            position_polling_interval_minutes: get_env_usize("POSITION_POLLING_INTERVAL_MINUTES", 15)? as u64,
            order_polling_interval_minutes: get_env_usize("ORDER_POLLING_INTERVAL_MINUTES", 5)? as u64,
            max_polling_errors: get_env_u32("MAX_POLLING_ERRORS", 5)?,
            auto_start_polling: get_env_bool("AUTO_START_POLLING", true),
            spread_ratio_threshold: get_env_decimal("SPREAD_RATIO_THRESHOLD", Decimal::new(15, 2))?,
            spread_tick_multiple_threshold: get_env_decimal("SPREAD_TICK_MULTIPLE_THRESHOLD", Decimal::from(2))?,
            progressive_max_steps: get_env_u32("PROGRESSIVE_MAX_STEPS", 5)?,
            progressive_step_interval_seconds: get_env_usize("PROGRESSIVE_STEP_INTERVAL_SECONDS", 8)? as u64,
            enable_market_fallback: get_env_bool("ENABLE_MARKET_FALLBACK", false),
            max_place_retries: get_env_u32("MAX_PLACE_RETRIES", 3)?,
            force_progress: get_env_bool("FORCE_PROGRESS", false),
            max_spread_holds: get_env_u32("MAX_SPREAD_HOLDS", 3)?,
            delta_change_threshold: get_env_decimal("DELTA_CHANGE_THRESHOLD", Decimal::new(1, 2))?,
            delta_retention_days: get_env_usize("DELTA_RETENTION_DAYS", 90)? as i64,
            dedupe_window_seconds: get_env_usize("DEDUPE_WINDOW_SECONDS", 60)? as u64,
            signal_timeout_seconds: get_env_usize("SIGNAL_TIMEOUT_SECONDS", 60)? as u64,
            gateway_call_timeout_seconds: get_env_usize("GATEWAY_CALL_TIMEOUT_SECONDS", 10)? as u64,
            shutdown_grace_seconds: get_env_usize("SHUTDOWN_GRACE_SECONDS", 5)? as u64,
            contract_selection: ContractSelectionConfig {
                min_days_to_expiry: get_env_usize("MIN_DAYS_TO_EXPIRY", 7)? as i64,
                max_days_to_expiry: get_env_usize("MAX_DAYS_TO_EXPIRY", 45)? as i64,
                target_days_to_expiry: get_env_usize("TARGET_DAYS_TO_EXPIRY", 30)? as i64,
                target_delta_open: get_env_decimal("TARGET_DELTA_OPEN", Decimal::new(30, 2))?,
            },
            accounts,
            sqlite_path: get_env_string("SQLITE_PATH", "./data/delta_store.sqlite"),
            webhook_notifier_url: get_env("WEBHOOK_NOTIFIER_URL"),
        };

        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.progressive_max_steps < 1 {
            return Err(anyhow!("PROGRESSIVE_MAX_STEPS must be >= 1 (got {})", self.progressive_max_steps));
        }
        if self.max_place_retries < 1 {
            return Err(anyhow!("MAX_PLACE_RETRIES must be >= 1 (got {})", self.max_place_retries));
        }
        if self.delta_retention_days < 1 {
            return Err(anyhow!("DELTA_RETENTION_DAYS must be >= 1 (got {})", self.delta_retention_days));
        }
        if self.contract_selection.min_days_to_expiry > self.contract_selection.max_days_to_expiry {
            return Err(anyhow!("MIN_DAYS_TO_EXPIRY must be <= MAX_DAYS_TO_EXPIRY"));
        }
        if self.accounts.is_empty() {
            return Err(anyhow!("at least one account must be configured (ACCOUNTS_JSON)"));
        }
        if self.spread_ratio_threshold <= Decimal::ZERO {
            return Err(anyhow!("SPREAD_RATIO_THRESHOLD must be > 0"));
        }
        Ok(())
    }
}

/// Accounts are configured as a JSON array via `ACCOUNTS_JSON`;
/// falls back to a single mock account so `mock_mode` runs out of the box.
fn load_accounts() -> Result<Vec<AccountConfig>> {
    match get_env("ACCOUNTS_JSON") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| anyhow!("ACCOUNTS_JSON invalid: {e}")),
        None => Ok(vec![AccountConfig {
            name: "mock".to_string(),
            enabled: true,
            broker_credentials_ref: "mock".to_string(),
            notifier_channel: None,
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_accounts_fallback_is_enabled() {
        let accounts = load_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].enabled);
    }
}
