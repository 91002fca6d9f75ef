//! Thread pool configuration
//!
//! ```rust,ignore
//! use netcore_exec::PoolConfig;
//!
//! let config = PoolConfig::from_env().num_workers(8);
//! ```

use std::time::Duration;

use netcore_core::env::{env_get, env_get_millis, env_get_str};
use netcore_core::ConfigError;

/// Library defaults
pub mod defaults {
    pub const NAME: &str = "netcore-pool";

    /// Used when the CPU count cannot be queried
    pub const NUM_WORKERS_FALLBACK: usize = 4;

    pub const MAX_WORKERS: usize = 256;

    /// Idle time after which a worker retires its OS thread
    pub const MAX_IDLE_MS: u64 = 5_000;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Prefix of worker thread names (`<name>-<index>`)
    pub name: String,
    pub num_workers: usize,
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    /// Library defaults, one worker per CPU.
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(defaults::NUM_WORKERS_FALLBACK);
        Self {
            name: defaults::NAME.to_string(),
            num_workers: cpus.min(defaults::MAX_WORKERS),
            max_idle_time: Duration::from_millis(defaults::MAX_IDLE_MS),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `NETCORE_POOL_NAME`
    /// - `NETCORE_POOL_WORKERS`
    /// - `NETCORE_POOL_MAX_IDLE_MS`
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            name: env_get_str("NETCORE_POOL_NAME", &base.name),
            num_workers: env_get("NETCORE_POOL_WORKERS", base.num_workers),
            max_idle_time: env_get_millis("NETCORE_POOL_MAX_IDLE_MS", base.max_idle_time),
        }
    }

    // Builder methods

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn max_idle_time(mut self, d: Duration) -> Self {
        self.max_idle_time = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("pool name must not be empty"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.max_idle_time.is_zero() {
            return Err(ConfigError::InvalidValue("max_idle_time must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Thread Pool Configuration:");
        eprintln!("  name:           {}", self.name);
        eprintln!("  num_workers:    {}", self.num_workers);
        eprintln!("  max_idle_time:  {:?}", self.max_idle_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_valid() {
        let c = PoolConfig::new();
        assert!(c.num_workers >= 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let c = PoolConfig::new().name("p").num_workers(3).max_idle_time(Duration::from_millis(50));
        assert_eq!(c.num_workers, 3);
        assert!(c.validate().is_ok());

        assert!(PoolConfig::new().num_workers(0).validate().is_err());
        assert!(PoolConfig::new().num_workers(1000).validate().is_err());
        assert!(PoolConfig::new().max_idle_time(Duration::ZERO).validate().is_err());
    }
}
