//! Engine tunables
//!
//! The reconcile core exposes exactly the knobs below. They are parsed from
//! flags or environment by [`EngineArgs`] and validated once at startup.

use std::time::Duration;

use clap::Args;

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Runtime configuration of the reconciliation engine
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Attempts per step before the task is marked Failed
    pub max_attempts: u32,
    /// First backoff delay
    pub backoff_base: Duration,
    /// Growth factor between backoff delays
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay
    pub backoff_cap: Duration,
    /// Number of identities reconciled in parallel
    pub max_parallel_identities: usize,
    /// Deadline for each individual store or ledger call
    pub store_timeout: Duration,
    /// Interval of the ledger-driven resync
    pub resync_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(30),
            max_parallel_identities: 8,
            store_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Reject configurations that would make the engine unbounded or stuck
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(Error::validation(
                "backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(Error::validation("backoff_cap must be >= backoff_base"));
        }
        if self.max_parallel_identities == 0 {
            return Err(Error::validation(
                "max_parallel_identities must be at least 1",
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(Error::validation("store_timeout must be non-zero"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::validation("resync_interval must be non-zero"));
        }
        Ok(())
    }

    /// Backoff policy derived from these settings
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: self.backoff_base,
            max_delay: self.backoff_cap,
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Command-line / environment form of [`EngineConfig`]
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Attempts per step before giving up on a notification
    #[arg(long, env = "AUTORESTART_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    #[arg(long, env = "AUTORESTART_BACKOFF_BASE_MS", default_value = "200")]
    pub backoff_base_ms: u64,

    /// Backoff growth factor
    #[arg(long, env = "AUTORESTART_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub backoff_multiplier: f64,

    /// Maximum backoff delay in milliseconds
    #[arg(long, env = "AUTORESTART_BACKOFF_CAP_MS", default_value = "30000")]
    pub backoff_cap_ms: u64,

    /// ConfigMaps reconciled in parallel
    #[arg(long, env = "AUTORESTART_MAX_PARALLEL", default_value = "8")]
    pub max_parallel_identities: usize,

    /// Deadline for each API call in seconds
    #[arg(long, env = "AUTORESTART_STORE_TIMEOUT_SECS", default_value = "10")]
    pub store_timeout_secs: u64,

    /// Ledger resync interval in seconds
    #[arg(long, env = "AUTORESTART_RESYNC_SECS", default_value = "300")]
    pub resync_secs: u64,
}

impl EngineArgs {
    /// Convert and validate
    pub fn into_config(self) -> Result<EngineConfig> {
        let config = EngineConfig {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_multiplier: self.backoff_multiplier,
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            max_parallel_identities: self.max_parallel_identities,
            store_timeout: Duration::from_secs(self.store_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
        };
        config.validate()?;
        Ok(config)
    }
}
