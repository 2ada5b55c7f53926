//! Configuration Module
//!
//! Cache tuning options and host configuration, loaded from environment
//! variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::cache::{MAX_LOG_SIZE, MIN_LOG_SIZE};
use crate::error::{CacheError, Result};

// == Rebalance Policy ==
/// How the manager picks caches to shrink when the global quota is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalancePolicy {
    /// Free memory from the largest consumers first
    #[default]
    HighestUsage,
    /// Free memory from the least effective caches first
    LowestHitRate,
}

impl FromStr for RebalancePolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "highest_usage" | "usage" => Ok(Self::HighestUsage),
            "lowest_hit_rate" | "hit_rate" => Ok(Self::LowestHitRate),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown rebalance policy '{}'",
                other
            ))),
        }
    }
}

// == Cache Options ==
/// Tuning parameters shared by the manager, its caches and their tasks.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Global memory quota in bytes
    pub cache_size: u64,
    /// Fill ratio (entries per bucket) below which a table wants to shrink
    pub ideal_lower_fill_ratio: f64,
    /// Fill ratio (entries per bucket) above which a table wants to grow
    pub ideal_upper_fill_ratio: f64,
    /// Smallest table log size the manager will allocate
    pub min_log_size: u32,
    /// Largest table log size the manager will allocate
    pub max_log_size: u32,
    /// Inserts are refused once usage would exceed `cache_size * hard_quota_ratio`
    pub hard_quota_ratio: f64,
    /// After a breach, free memory until usage is below `cache_size * ratio`
    pub free_memory_target_ratio: f64,
    /// Bucket visits a single free-memory task may spend
    pub free_memory_scan_budget: usize,
    /// Bounded bucket-lock wait for foreground operations
    pub operation_lock_timeout: Duration,
    /// Bounded bucket-lock wait inside background tasks
    pub task_lock_timeout: Duration,
    /// Victim selection when freeing memory across caches
    pub rebalance_policy: RebalancePolicy,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_size: 256 * 1024 * 1024,
            ideal_lower_fill_ratio: 0.0625,
            ideal_upper_fill_ratio: 0.5,
            min_log_size: MIN_LOG_SIZE,
            max_log_size: MAX_LOG_SIZE,
            hard_quota_ratio: 1.25,
            free_memory_target_ratio: 0.9,
            free_memory_scan_budget: 4096,
            operation_lock_timeout: Duration::from_millis(10),
            task_lock_timeout: Duration::from_millis(1),
            rebalance_policy: RebalancePolicy::HighestUsage,
        }
    }
}

impl CacheOptions {
    /// Loads options from environment variables, falling back to defaults.
    ///
    /// # Environment Variables
    /// - `CACHE_SIZE` - Global quota in bytes
    /// - `CACHE_IDEAL_LOWER_FILL_RATIO` / `CACHE_IDEAL_UPPER_FILL_RATIO`
    /// - `CACHE_MIN_LOG_SIZE` / `CACHE_MAX_LOG_SIZE`
    /// - `CACHE_HARD_QUOTA_RATIO`, `CACHE_FREE_MEMORY_TARGET_RATIO`
    /// - `CACHE_FREE_MEMORY_SCAN_BUDGET`
    /// - `CACHE_LOCK_TIMEOUT_US`, `CACHE_TASK_LOCK_TIMEOUT_US`
    /// - `CACHE_REBALANCE_POLICY` - `highest_usage` or `lowest_hit_rate`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_size: env_or("CACHE_SIZE", defaults.cache_size),
            ideal_lower_fill_ratio: env_or(
                "CACHE_IDEAL_LOWER_FILL_RATIO",
                defaults.ideal_lower_fill_ratio,
            ),
            ideal_upper_fill_ratio: env_or(
                "CACHE_IDEAL_UPPER_FILL_RATIO",
                defaults.ideal_upper_fill_ratio,
            ),
            min_log_size: env_or("CACHE_MIN_LOG_SIZE", defaults.min_log_size),
            max_log_size: env_or("CACHE_MAX_LOG_SIZE", defaults.max_log_size),
            hard_quota_ratio: env_or("CACHE_HARD_QUOTA_RATIO", defaults.hard_quota_ratio),
            free_memory_target_ratio: env_or(
                "CACHE_FREE_MEMORY_TARGET_RATIO",
                defaults.free_memory_target_ratio,
            ),
            free_memory_scan_budget: env_or(
                "CACHE_FREE_MEMORY_SCAN_BUDGET",
                defaults.free_memory_scan_budget,
            ),
            operation_lock_timeout: Duration::from_micros(env_or(
                "CACHE_LOCK_TIMEOUT_US",
                defaults.operation_lock_timeout.as_micros() as u64,
            )),
            task_lock_timeout: Duration::from_micros(env_or(
                "CACHE_TASK_LOCK_TIMEOUT_US",
                defaults.task_lock_timeout.as_micros() as u64,
            )),
            rebalance_policy: env_or("CACHE_REBALANCE_POLICY", defaults.rebalance_policy),
        }
    }

    /// Checks the options for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(CacheError::InvalidConfig(
                "cache_size must be positive".to_string(),
            ));
        }
        let lower = self.ideal_lower_fill_ratio;
        let upper = self.ideal_upper_fill_ratio;
        if !(lower > 0.0 && lower < upper && upper <= 1.0) {
            return Err(CacheError::InvalidConfig(format!(
                "fill ratios must satisfy 0 < lower < upper <= 1 (got {} / {})",
                lower, upper
            )));
        }
        if !(MIN_LOG_SIZE <= self.min_log_size
            && self.min_log_size <= self.max_log_size
            && self.max_log_size <= MAX_LOG_SIZE)
        {
            return Err(CacheError::InvalidConfig(format!(
                "log sizes must satisfy {} <= min <= max <= {} (got {} / {})",
                MIN_LOG_SIZE, MAX_LOG_SIZE, self.min_log_size, self.max_log_size
            )));
        }
        if self.hard_quota_ratio < 1.0 {
            return Err(CacheError::InvalidConfig(
                "hard_quota_ratio must be at least 1.0".to_string(),
            ));
        }
        if !(self.free_memory_target_ratio > 0.0 && self.free_memory_target_ratio <= 1.0) {
            return Err(CacheError::InvalidConfig(
                "free_memory_target_ratio must be in (0, 1]".to_string(),
            ));
        }
        if self.free_memory_scan_budget == 0 {
            return Err(CacheError::InvalidConfig(
                "free_memory_scan_budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// == Host Config ==
/// Telemetry host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache tuning options
    pub options: CacheOptions,
    /// HTTP server port
    pub server_port: u16,
    /// Seconds between maintenance passes
    pub maintenance_interval: u64,
    /// Caches registered at startup
    pub cache_names: Vec<String>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `MAINTENANCE_INTERVAL` - Maintenance frequency in seconds (default: 1)
    /// - `CACHE_NAMES` - Comma separated cache names (default: "documents")
    pub fn from_env() -> Self {
        Self {
            options: CacheOptions::from_env(),
            server_port: env_or("SERVER_PORT", 3000),
            maintenance_interval: env_or("MAINTENANCE_INTERVAL", 1),
            cache_names: env::var("CACHE_NAMES")
                .ok()
                .map(|v| parse_names(&v))
                .unwrap_or_else(|| vec!["documents".to_string()]),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            options: CacheOptions::default(),
            server_port: 3000,
            maintenance_interval: 1,
            cache_names: vec!["documents".to_string()],
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
