//! Configuration for faregate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::money::Money;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("faregate")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// Upper bound on any single storage call, in milliseconds
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// ISO currency code recorded on new accounts
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Page size for history reads when the caller gives none
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    #[serde(default)]
    pub fares: FarePolicy,

    #[serde(default)]
    pub limits: AccountLimits,
}

/// Business constants for pricing and gate admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarePolicy {
    /// Flat charge added to every priced trip
    #[serde(default = "default_service_charge")]
    pub service_charge: Money,

    /// Base fare when a rider exits where they entered
    #[serde(default = "default_same_checkpoint_base_fare")]
    pub same_checkpoint_base_fare: Money,

    /// Minimum balance required to pass an entry gate
    #[serde(default = "default_entry_floor")]
    pub entry_floor: Money,

    /// Surcharge when the exit is past the journey deadline
    #[serde(default = "default_late_exit_penalty")]
    pub late_exit_penalty: Money,

    /// Journey ceiling; the deadline is origin time plus this
    #[serde(default = "default_max_journey_minutes")]
    pub max_journey_minutes: i64,
}

/// Per-account spend limits recorded at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLimits {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: Money,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: Money,
    #[serde(default = "default_single_transaction_limit")]
    pub single_transaction_limit: Money,
}

fn default_db_file() -> String {
    "faregate.db".to_string()
}

fn default_storage_timeout_ms() -> u64 {
    2000
}

fn default_currency() -> String {
    "INR".to_string()
}

fn default_history_page_size() -> u32 {
    50
}

fn default_service_charge() -> Money {
    Money::from_major(5)
}

fn default_same_checkpoint_base_fare() -> Money {
    Money::from_major(5)
}

fn default_entry_floor() -> Money {
    Money::from_major(20)
}

fn default_late_exit_penalty() -> Money {
    Money::from_major(50)
}

fn default_max_journey_minutes() -> i64 {
    4 * 60
}

fn default_daily_limit() -> Money {
    Money::from_major(10_000)
}

fn default_monthly_limit() -> Money {
    Money::from_major(50_000)
}

fn default_single_transaction_limit() -> Money {
    Money::from_major(5_000)
}

impl Default for FarePolicy {
    fn default() -> Self {
        Self {
            service_charge: default_service_charge(),
            same_checkpoint_base_fare: default_same_checkpoint_base_fare(),
            entry_floor: default_entry_floor(),
            late_exit_penalty: default_late_exit_penalty(),
            max_journey_minutes: default_max_journey_minutes(),
        }
    }
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
            single_transaction_limit: default_single_transaction_limit(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            db_file: default_db_file(),
            storage_timeout_ms: default_storage_timeout_ms(),
            currency: default_currency(),
            history_page_size: default_history_page_size(),
            fares: FarePolicy::default(),
            limits: AccountLimits::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database file path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}
