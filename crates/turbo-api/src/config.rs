//! Application and server configuration
//!
//! Both configs are plain builders with sensible defaults. `from_env` starts
//! from the defaults and overrides whatever `TURBO_*` variables are set.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_flag(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
        Err(_) => Ok(None),
    }
}

// ============================================================================
// AppConfig
// ============================================================================

/// Dispatch behaviour of an [`App`](crate::App)
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Blocking pool size; `None` means one worker per CPU
    pub blocking_workers: Option<usize>,
    /// Expose server error messages in 500 bodies
    pub debug: bool,
    /// Log client errors (4xx) at `warn`
    pub log_requests: bool,
    /// Answer `/path/` with a 307 to `/path` instead of matching it silently
    pub redirect_slashes: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            blocking_workers: None,
            debug: false,
            log_requests: true,
            redirect_slashes: false,
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `TURBO_BLOCKING_WORKERS`, `TURBO_DEBUG` and `TURBO_LOG_REQUESTS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(workers) = env_parse::<usize>("TURBO_BLOCKING_WORKERS")? {
            config.blocking_workers = Some(workers);
        }
        if let Some(debug) = env_flag("TURBO_DEBUG")? {
            config.debug = debug;
        }
        if let Some(log_requests) = env_flag("TURBO_LOG_REQUESTS")? {
            config.log_requests = log_requests;
        }
        Ok(config)
    }

    pub fn blocking_workers(mut self, workers: usize) -> Self {
        self.blocking_workers = Some(workers);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn log_requests(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn redirect_slashes(mut self, enabled: bool) -> Self {
        self.redirect_slashes = enabled;
        self
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8000")
    pub bind_addr: String,
    /// Maximum request body size in bytes (default: 10MB)
    pub max_body_size: usize,
    /// Log one line per request at `info`
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_body_size: 10 * 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Read `TURBO_BIND_ADDR` and `TURBO_MAX_BODY_SIZE`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = env_parse::<SocketAddr>("TURBO_BIND_ADDR")? {
            config.bind_addr = addr.to_string();
        }
        if let Some(size) = env_parse::<usize>("TURBO_MAX_BODY_SIZE")? {
            config.max_body_size = size;
        }
        Ok(config)
    }

    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_builder() {
        let config = AppConfig::new()
            .blocking_workers(4)
            .debug(true)
            .log_requests(false)
            .redirect_slashes(true);
        assert_eq!(config.blocking_workers, Some(4));
        assert!(config.debug);
        assert!(!config.log_requests);
        assert!(config.redirect_slashes);
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);

        let config = ServerConfig::new("0.0.0.0:9000").max_body_size(1024).logging(false);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.max_body_size, 1024);
        assert!(!config.enable_logging);
    }

    // Environment variables are process-global; each test uses its own names.
    #[test]
    fn test_from_env() {
        env::set_var("TURBO_BLOCKING_WORKERS", "3");
        env::set_var("TURBO_DEBUG", "true");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.blocking_workers, Some(3));
        assert!(config.debug);

        env::set_var("TURBO_BLOCKING_WORKERS", "many");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "TURBO_BLOCKING_WORKERS", .. }));

        env::remove_var("TURBO_BLOCKING_WORKERS");
        env::remove_var("TURBO_DEBUG");
    }

    #[test]
    fn test_server_from_env() {
        env::set_var("TURBO_BIND_ADDR", "0.0.0.0:8080");
        env::set_var("TURBO_MAX_BODY_SIZE", "2048");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.max_body_size, 2048);
        env::remove_var("TURBO_BIND_ADDR");
        env::remove_var("TURBO_MAX_BODY_SIZE");
    }
}
