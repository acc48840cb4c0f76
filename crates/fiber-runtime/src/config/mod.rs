//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Priority (highest wins)
//!
//! 1. Environment variables (`FIBER_*`, read by `from_env()`)
//! 2. The file named by `FIBER_CONFIG_RS` at build time
//! 3. Library defaults
//!
//! ```rust,ignore
//! use fiber_runtime::config::FiberConfig;
//!
//! let config = FiberConfig::from_env()
//!     .concurrency(8)
//!     .stack_size_small(64 * 1024);
//! ```

pub mod defaults;
pub mod env;

use crate::memory::StackConfig;
use env::env_get;
use fiber_core::constants::{MAX_CONCURRENCY, PARKING_LOT_NUM};
use fiber_core::error::FiberError;
use std::time::Duration;
use thiserror::Error;

/// Runtime configuration with builder methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberConfig {
    /// Target number of worker threads across all tags
    pub concurrency: usize,
    /// Workers started eagerly; the rest are added on demand. 0 starts all.
    pub min_concurrency: usize,
    pub stack_size_small: usize,
    pub stack_size_normal: usize,
    pub stack_size_large: usize,
    pub stack_size_pthread: usize,
    /// Size of the PROT_NONE region below every stack
    pub guard_page_size: usize,
    /// Per-thread cached stacks, per tier
    pub tc_stack_small: usize,
    pub tc_stack_normal: usize,
    pub tc_stack_large: usize,
    pub tc_stack_pthread: usize,
    /// Local queue capacity; the remote queue gets half of it
    pub runqueue_capacity: usize,
    /// Steal rounds (separated by `thread::yield_now`) before parking
    pub yield_before_idle: u32,
    /// Number of worker tags
    pub ntags: usize,
    /// Delay before an exited worker's group is freed
    pub task_group_delete_delay: Duration,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl FiberConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FIBER_CONCURRENCY`, `FIBER_MIN_CONCURRENCY`
    /// - `FIBER_STACK_SIZE_{SMALL,NORMAL,LARGE,PTHREAD}`
    /// - `FIBER_GUARD_PAGE_SIZE`
    /// - `FIBER_TC_STACK_{SMALL,NORMAL,LARGE,PTHREAD}`
    /// - `FIBER_RUNQUEUE_CAPACITY`
    /// - `FIBER_YIELD_BEFORE_IDLE`
    /// - `FIBER_NTAGS`
    /// - `FIBER_GROUP_DELETE_DELAY_MS`
    pub fn from_env() -> Self {
        Self {
            concurrency: env_get("FIBER_CONCURRENCY", defaults::CONCURRENCY),
            min_concurrency: env_get("FIBER_MIN_CONCURRENCY", defaults::MIN_CONCURRENCY),
            stack_size_small: env_get("FIBER_STACK_SIZE_SMALL", defaults::STACK_SIZE_SMALL),
            stack_size_normal: env_get("FIBER_STACK_SIZE_NORMAL", defaults::STACK_SIZE_NORMAL),
            stack_size_large: env_get("FIBER_STACK_SIZE_LARGE", defaults::STACK_SIZE_LARGE),
            stack_size_pthread: env_get("FIBER_STACK_SIZE_PTHREAD", defaults::STACK_SIZE_PTHREAD),
            guard_page_size: env_get("FIBER_GUARD_PAGE_SIZE", defaults::GUARD_PAGE_SIZE),
            tc_stack_small: env_get("FIBER_TC_STACK_SMALL", defaults::TC_STACK_SMALL),
            tc_stack_normal: env_get("FIBER_TC_STACK_NORMAL", defaults::TC_STACK_NORMAL),
            tc_stack_large: env_get("FIBER_TC_STACK_LARGE", defaults::TC_STACK_LARGE),
            tc_stack_pthread: env_get("FIBER_TC_STACK_PTHREAD", defaults::TC_STACK_PTHREAD),
            runqueue_capacity: env_get("FIBER_RUNQUEUE_CAPACITY", defaults::RUNQUEUE_CAPACITY),
            yield_before_idle: env_get("FIBER_YIELD_BEFORE_IDLE", defaults::YIELD_BEFORE_IDLE),
            ntags: env_get("FIBER_NTAGS", defaults::NTAGS),
            task_group_delete_delay: Duration::from_millis(env_get(
                "FIBER_GROUP_DELETE_DELAY_MS",
                defaults::GROUP_DELETE_DELAY_MS,
            )),
        }
    }

    /// Compile-time defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            concurrency: defaults::CONCURRENCY,
            min_concurrency: defaults::MIN_CONCURRENCY,
            stack_size_small: defaults::STACK_SIZE_SMALL,
            stack_size_normal: defaults::STACK_SIZE_NORMAL,
            stack_size_large: defaults::STACK_SIZE_LARGE,
            stack_size_pthread: defaults::STACK_SIZE_PTHREAD,
            guard_page_size: defaults::GUARD_PAGE_SIZE,
            tc_stack_small: defaults::TC_STACK_SMALL,
            tc_stack_normal: defaults::TC_STACK_NORMAL,
            tc_stack_large: defaults::TC_STACK_LARGE,
            tc_stack_pthread: defaults::TC_STACK_PTHREAD,
            runqueue_capacity: defaults::RUNQUEUE_CAPACITY,
            yield_before_idle: defaults::YIELD_BEFORE_IDLE,
            ntags: defaults::NTAGS,
            task_group_delete_delay: Duration::from_millis(defaults::GROUP_DELETE_DELAY_MS),
        }
    }

    // Builder methods

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn min_concurrency(mut self, n: usize) -> Self {
        self.min_concurrency = n;
        self
    }

    pub fn stack_size_small(mut self, size: usize) -> Self {
        self.stack_size_small = size;
        self
    }

    pub fn stack_size_normal(mut self, size: usize) -> Self {
        self.stack_size_normal = size;
        self
    }

    pub fn stack_size_large(mut self, size: usize) -> Self {
        self.stack_size_large = size;
        self
    }

    pub fn stack_size_pthread(mut self, size: usize) -> Self {
        self.stack_size_pthread = size;
        self
    }

    pub fn guard_page_size(mut self, size: usize) -> Self {
        self.guard_page_size = size;
        self
    }

    /// Cached stacks per thread for every tier at once
    pub fn tc_stacks(mut self, small: usize, normal: usize, large: usize, pthread: usize) -> Self {
        self.tc_stack_small = small;
        self.tc_stack_normal = normal;
        self.tc_stack_large = large;
        self.tc_stack_pthread = pthread;
        self
    }

    pub fn runqueue_capacity(mut self, cap: usize) -> Self {
        self.runqueue_capacity = cap;
        self
    }

    pub fn yield_before_idle(mut self, n: u32) -> Self {
        self.yield_before_idle = n;
        self
    }

    pub fn ntags(mut self, n: usize) -> Self {
        self.ntags = n;
        self
    }

    pub fn task_group_delete_delay(mut self, d: Duration) -> Self {
        self.task_group_delete_delay = d;
        self
    }

    /// Check limits and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ntags == 0 {
            return Err(ConfigError::InvalidValue("ntags must be > 0"));
        }
        if self.concurrency < self.ntags {
            return Err(ConfigError::InvalidValue(
                "concurrency must be >= ntags (one worker per tag at least)",
            ));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidValue("concurrency exceeds MAX_CONCURRENCY"));
        }
        if self.min_concurrency > self.concurrency {
            return Err(ConfigError::InvalidValue("min_concurrency must be <= concurrency"));
        }
        if self.min_concurrency != 0 && self.min_concurrency < self.ntags {
            return Err(ConfigError::InvalidValue("min_concurrency must be 0 or >= ntags"));
        }
        let stacks = [
            self.stack_size_small,
            self.stack_size_normal,
            self.stack_size_large,
            self.stack_size_pthread,
        ];
        if stacks.iter().any(|&s| s < 16 * 1024) {
            return Err(ConfigError::InvalidValue("stack sizes must be >= 16KB"));
        }
        if self.runqueue_capacity < 2 {
            return Err(ConfigError::InvalidValue("runqueue_capacity must be >= 2"));
        }
        Ok(())
    }

    /// Stack sizes and cache limits in `StackTier` index order
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            sizes: [
                self.stack_size_pthread,
                self.stack_size_small,
                self.stack_size_normal,
                self.stack_size_large,
            ],
            guard_size: self.guard_page_size,
            max_cached: [
                self.tc_stack_pthread,
                self.tc_stack_small,
                self.tc_stack_normal,
                self.tc_stack_large,
            ],
        }
    }

    /// Remote queue capacity per group
    #[inline]
    pub fn remote_queue_capacity(&self) -> usize {
        (self.runqueue_capacity / 2).max(1)
    }

    /// Workers started by `TaskControl::new`
    #[inline]
    pub fn initial_concurrency(&self) -> usize {
        if self.min_concurrency == 0 {
            self.concurrency
        } else {
            self.min_concurrency
        }
    }

    /// Emit the configuration at debug level
    pub fn log(&self) {
        tracing::debug!(
            concurrency = self.concurrency,
            min_concurrency = self.min_concurrency,
            ntags = self.ntags,
            lots_per_tag = PARKING_LOT_NUM,
            runqueue_capacity = self.runqueue_capacity,
            yield_before_idle = self.yield_before_idle,
            stack_small = self.stack_size_small,
            stack_normal = self.stack_size_normal,
            stack_large = self.stack_size_large,
            stack_pthread = self.stack_size_pthread,
            guard = self.guard_page_size,
            delete_delay_ms = self.task_group_delete_delay.as_millis() as u64,
            "fiber runtime configuration"
        );
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

impl From<ConfigError> for FiberError {
    fn from(e: ConfigError) -> Self {
        FiberError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiber_core::attr::StackTier;

    #[test]
    fn test_defaults_validate() {
        let config = FiberConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, defaults::CONCURRENCY);
        assert_eq!(config.remote_queue_capacity(), defaults::RUNQUEUE_CAPACITY / 2);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("FIBER_YIELD_BEFORE_IDLE", "3");
        let config = FiberConfig::from_env();
        std::env::remove_var("FIBER_YIELD_BEFORE_IDLE");
        assert_eq!(config.yield_before_idle, 3);
    }

    #[test]
    fn test_builder() {
        let config = FiberConfig::new()
            .concurrency(8)
            .min_concurrency(2)
            .ntags(2)
            .task_group_delete_delay(Duration::from_millis(5));

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.initial_concurrency(), 2);
        assert_eq!(config.task_group_delete_delay, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(FiberConfig::new().ntags(0).validate().is_err());
        assert!(FiberConfig::new().concurrency(2).ntags(3).validate().is_err());
        assert!(FiberConfig::new().concurrency(MAX_CONCURRENCY + 1).validate().is_err());
        assert!(FiberConfig::new().stack_size_small(1024).validate().is_err());

        let err: FiberError = FiberConfig::new().runqueue_capacity(1).validate().unwrap_err().into();
        assert!(matches!(err, FiberError::Config(_)));
    }

    #[test]
    fn test_stack_config_order() {
        let sc = FiberConfig::new()
            .stack_size_small(64 * 1024)
            .tc_stacks(5, 6, 7, 8)
            .stack_config();
        assert_eq!(sc.size_of(StackTier::Small), 64 * 1024);
        assert_eq!(sc.max_cached(StackTier::Pthread), 8);
        assert_eq!(sc.max_cached(StackTier::Large), 7);
    }
}
