//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. User's `FL_CONFIG_RS` file (compile-time)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use fiberloop_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .num_workers(2)
//!     .max_wait_ms(100);
//! ```

pub mod defaults;

use fiberloop_core::constants::{MAX_WORKERS, MIN_STACK_SIZE};
use fiberloop_core::env::{env_get, env_get_bool};
use std::time::Duration;

/// Runtime configuration with builder pattern.
///
/// `Default` is `from_env()`; use `new()` for the bare compile-time values.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads (including the caller in `use_caller` mode)
    pub num_workers: usize,
    /// Usable stack bytes per coroutine
    pub stack_size: usize,
    /// Bracket stacks with PROT_NONE pages
    pub guard_pages: bool,
    /// Readiness events fetched per wait
    pub max_events: usize,
    /// Ceiling on a single wait
    pub max_wait_ms: u64,
    /// Default timeout of hooked `connect`
    pub connect_timeout_ms: u64,
    /// The thread calling `run_caller` becomes worker 0
    pub use_caller: bool,
    /// Idle stacks kept for reuse (0 disables pooling)
    pub stack_pool: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FL_NUM_WORKERS` - Number of worker threads
    /// - `FL_STACK_SIZE` - Stack size per coroutine
    /// - `FL_GUARD_PAGES` - Guard-paged stacks (0/1)
    /// - `FL_MAX_EVENTS` - epoll batch size
    /// - `FL_MAX_WAIT_MS` - Wait ceiling in milliseconds
    /// - `FL_CONNECT_TIMEOUT_MS` - Default connect timeout
    /// - `FL_USE_CALLER` - Caller thread acts as worker 0 (0/1)
    /// - `FL_STACK_POOL` - Pooled idle stacks
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("FL_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("FL_STACK_SIZE", defaults::STACK_SIZE),
            guard_pages: env_get_bool("FL_GUARD_PAGES", defaults::GUARD_PAGES),
            max_events: env_get("FL_MAX_EVENTS", defaults::MAX_EVENTS),
            max_wait_ms: env_get("FL_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            connect_timeout_ms: env_get("FL_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            use_caller: env_get_bool("FL_USE_CALLER", defaults::USE_CALLER),
            stack_pool: env_get("FL_STACK_POOL", defaults::STACK_POOL),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            guard_pages: defaults::GUARD_PAGES,
            max_events: defaults::MAX_EVENTS,
            max_wait_ms: defaults::MAX_WAIT_MS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            use_caller: defaults::USE_CALLER,
            stack_pool: defaults::STACK_POOL,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn guard_pages(mut self, enable: bool) -> Self {
        self.guard_pages = enable;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn stack_pool(mut self, n: usize) -> Self {
        self.stack_pool = n;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_wait_ms == 0 {
            return Err(ConfigError::InvalidValue("max_wait_ms must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("fiberloop configuration:");
        eprintln!("  num_workers:         {}", self.num_workers);
        eprintln!("  stack_size:          {}", self.stack_size);
        eprintln!("  guard_pages:         {}", self.guard_pages);
        eprintln!("  max_events:          {}", self.max_events);
        eprintln!("  max_wait_ms:         {}", self.max_wait_ms);
        eprintln!("  connect_timeout_ms:  {}", self.connect_timeout_ms);
        eprintln!("  use_caller:          {}", self.use_caller);
        eprintln!("  stack_pool:          {}", self.stack_pool);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for fiberloop_core::RuntimeError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => fiberloop_core::RuntimeError::InvalidConfig(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert!(config.num_workers >= 1);
        assert_eq!(config.max_wait_ms, 5000);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("FL_MAX_EVENTS", "32");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("FL_MAX_EVENTS");
        assert_eq!(config.max_events, 32);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(8)
            .max_wait_ms(100)
            .connect_timeout(Duration::from_secs(2))
            .guard_pages(false);

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.max_wait_ms, 100);
        assert_eq!(config.connect_timeout_ms, 2000);
        assert!(!config.guard_pages);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(1000).validate().is_err());
        assert_eq!(
            RuntimeConfig::new().stack_size(4096).validate(),
            Err(ConfigError::InvalidValue("stack_size must be >= 16KB"))
        );
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
    }
}
