//! TCAP stack configuration

use crate::errors::{Result, TcapError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete TCAP stack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcapStackConfig {
    /// Provider configuration
    pub provider: ProviderConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Provider-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Local subsystem number registered with SCCP
    pub ssn: u8,
    /// Maximum number of live dialogs (or preview records)
    pub max_dialogs: usize,
    /// First transaction id the allocator may issue
    pub dialog_id_range_start: u32,
    /// Last transaction id the allocator may issue (inclusive)
    pub dialog_id_range_end: u32,
    /// Passive observation mode
    pub preview_mode: bool,
    /// Idle expiry of preview correlation records (ms)
    pub dialog_idle_timeout_ms: u64,
    /// Default invoke timeout (ms)
    pub invoke_timeout_ms: u64,
    /// Worker threads of the timer pool
    pub timer_workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ssn: crate::ssn::MSC,
            max_dialogs: 5000,
            dialog_id_range_start: 1,
            dialog_id_range_end: 0x7FFF_FFFF,
            preview_mode: false,
            dialog_idle_timeout_ms: 60_000,
            invoke_timeout_ms: 30_000,
            timer_workers: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl TcapStackConfig {
    /// Load configuration from file, with `TCAP__`-prefixed environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TCAP").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.provider.validate()
    }
}

impl ProviderConfig {
    /// Reject settings the provider cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dialog_id_range_start > self.dialog_id_range_end {
            return Err(TcapError::Config(format!(
                "dialog id range is empty: [{}, {}]",
                self.dialog_id_range_start, self.dialog_id_range_end
            )));
        }
        if self.max_dialogs == 0 {
            return Err(TcapError::Config("max_dialogs must be positive".to_string()));
        }
        if self.timer_workers == 0 {
            return Err(TcapError::Config("timer_workers must be positive".to_string()));
        }
        Ok(())
    }

    /// Get preview idle timeout as Duration
    pub fn dialog_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.dialog_idle_timeout_ms)
    }

    /// Get default invoke timeout as Duration
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}
