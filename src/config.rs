//! # Server Configuration Module
//!
//! [`ServerConfig`] collects every option applied once before the server
//! starts. It can be built in code, deserialized from YAML, or layered from
//! `BRRTS_*` environment variables.
//!
//! ## Environment Variables
//!
//! | variable | field |
//! |---|---|
//! | `BRRTS_LISTEN_ADDR` | `listen_addr` |
//! | `BRRTS_CONTENT_TYPE` | `content_type` (`-` disables, empty means JSON) |
//! | `BRRTS_PATH_VAR_CAPACITY` | `path_var_capacity` |
//! | `BRRTS_FILTER_CAPACITY` | `filter_capacity` |
//! | `BRRTS_READ_TIMEOUT_MS` / `BRRTS_WRITE_TIMEOUT_MS` | timeouts (0 = none) |
//! | `BRRTS_MAX_HEADER_BYTES` | `max_header_bytes` |
//! | `BRRTS_MAX_BODY_BYTES` | `max_body_bytes` |
//! | `BRRTS_KEEP_ALIVE_MINS` | `keep_alive_mins` (0 disables TCP keep-alive) |
//! | `BRRTS_CERT_FILE` / `BRRTS_KEY_FILE` | PEM paths enabling TLS |
//! | `BRRTS_STACK_SIZE` | connection coroutine stack (hex `0x..` or decimal) |
//!
//! ## Example
//!
//! ```yaml
//! listen_addr: 127.0.0.1:8080
//! content_type: "application/json; charset=utf-8"
//! read_timeout_ms: 5000
//! keep_alive_mins: 3
//! ```

use crate::error::ServerError;
use crate::logging::Logger;
use crate::server::HeaderChecker;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4000";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
/// Sentinel disabling the automatic response content type.
pub const CONTENT_TYPE_DISABLE: &str = "-";
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Options applied once before `Server::start`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport bind address
    pub listen_addr: String,
    /// Preset on every response unless equal to [`CONTENT_TYPE_DISABLE`];
    /// empty falls back to [`CONTENT_TYPE_JSON`]
    pub content_type: String,
    /// Expected path variables per route; pre-sizes pooled variable sets
    pub path_var_capacity: usize,
    /// Expected route filters per request (root filters excluded)
    pub filter_capacity: usize,
    /// Per-read socket timeout in milliseconds, 0 for none
    pub read_timeout_ms: u64,
    /// Per-write socket timeout in milliseconds, 0 for none
    pub write_timeout_ms: u64,
    /// Upper bound on the request head (request line + headers)
    pub max_header_bytes: usize,
    /// Upper bound on a request body; larger `Content-Length` gets 413
    pub max_body_bytes: usize,
    /// TCP keep-alive period in minutes, 0 leaves the OS default
    pub keep_alive_mins: u64,
    /// PEM certificate chain; with `key_file`, enables TLS
    pub cert_file: Option<String>,
    /// PEM private key
    pub key_file: Option<String>,
    /// Stack size of connection coroutines in bytes
    pub stack_size: usize,
    /// Prebuilt TLS config; takes precedence over `cert_file`/`key_file`
    #[serde(skip)]
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    /// Extra validation run during protocol-upgrade handshakes
    #[serde(skip)]
    pub upgrade_checker: Option<HeaderChecker>,
    /// Sink for lifecycle and per-request messages
    #[serde(skip)]
    pub logger: Option<Logger>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            path_var_capacity: 3,
            filter_capacity: 5,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_header_bytes: 1 << 20,
            max_body_bytes: 8 << 20,
            keep_alive_mins: 3,
            cert_file: None,
            key_file: None,
            stack_size: DEFAULT_STACK_SIZE,
            tls_config: None,
            upgrade_checker: None,
            logger: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("content_type", &self.content_type)
            .field("path_var_capacity", &self.path_var_capacity)
            .field("filter_capacity", &self.filter_capacity)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .field("max_header_bytes", &self.max_header_bytes)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("keep_alive_mins", &self.keep_alive_mins)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("stack_size", &self.stack_size)
            .field("tls_config", &self.tls_config.is_some())
            .field("upgrade_checker", &self.upgrade_checker.is_some())
            .field("logger", &self.logger)
            .finish()
    }
}

fn parse_size(val: &str) -> Option<usize> {
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        val.parse().ok()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl ServerConfig {
    /// Parse a YAML document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when the YAML is malformed.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ServerError> {
        serde_yaml::from_str(yaml).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Load a YAML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when the file is unreadable or malformed.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Defaults overlaid with `BRRTS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Overlay any `BRRTS_*` variables that are set and parse cleanly.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("BRRTS_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(ct) = env::var("BRRTS_CONTENT_TYPE") {
            self.content_type = ct;
        }
        if let Some(n) = env_parse("BRRTS_PATH_VAR_CAPACITY") {
            self.path_var_capacity = n;
        }
        if let Some(n) = env_parse("BRRTS_FILTER_CAPACITY") {
            self.filter_capacity = n;
        }
        if let Some(ms) = env_parse("BRRTS_READ_TIMEOUT_MS") {
            self.read_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("BRRTS_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = ms;
        }
        if let Some(n) = env_parse("BRRTS_MAX_HEADER_BYTES") {
            self.max_header_bytes = n;
        }
        if let Some(n) = env_parse("BRRTS_MAX_BODY_BYTES") {
            self.max_body_bytes = n;
        }
        if let Some(m) = env_parse("BRRTS_KEEP_ALIVE_MINS") {
            self.keep_alive_mins = m;
        }
        if let Ok(cert) = env::var("BRRTS_CERT_FILE") {
            self.cert_file = Some(cert);
        }
        if let Ok(key) = env::var("BRRTS_KEY_FILE") {
            self.key_file = Some(key);
        }
        if let Some(size) = env::var("BRRTS_STACK_SIZE").ok().and_then(|v| parse_size(&v)) {
            self.stack_size = size;
        }
    }

    /// The content type to preset on responses, `None` when disabled.
    #[must_use]
    pub fn default_content_type(&self) -> Option<&str> {
        match self.content_type.as_str() {
            CONTENT_TYPE_DISABLE => None,
            "" => Some(CONTENT_TYPE_JSON),
            ct => Some(ct),
        }
    }

    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    #[must_use]
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_mins > 0)
            .then(|| Duration::from_secs(self.keep_alive_mins.saturating_mul(60)))
    }

    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_config.is_some() || self.cert_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.default_content_type(), Some(CONTENT_TYPE_JSON));
        assert_eq!(config.path_var_capacity, 3);
        assert_eq!(config.filter_capacity, 5);
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(180)));
        assert_eq!(config.read_timeout(), None);
        assert!(!config.tls_enabled());
    }

    #[test]
    fn test_content_type_sentinel_disables() {
        let config = ServerConfig {
            content_type: CONTENT_TYPE_DISABLE.to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.default_content_type(), None);
    }

    #[test]
    fn test_empty_content_type_falls_back_to_json() {
        let config = ServerConfig {
            content_type: String::new(),
            ..ServerConfig::default()
        };
        assert_eq!(config.default_content_type(), Some(CONTENT_TYPE_JSON));
    }

    #[test]
    fn test_huge_keep_alive_saturates() {
        let config = ServerConfig {
            keep_alive_mins: u64::MAX,
            ..ServerConfig::default()
        };
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_yaml_partial_document_keeps_defaults() {
        let config = ServerConfig::from_yaml_str(
            "listen_addr: 127.0.0.1:9000\nread_timeout_ms: 250\ncontent_type: text/plain\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.default_content_type(), Some("text/plain"));
        assert_eq!(config.filter_capacity, 5);
    }

    #[test]
    fn test_yaml_malformed_is_config_error() {
        let err = ServerConfig::from_yaml_str("listen_addr: [unclosed").unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_parse_size_hex_and_decimal() {
        assert_eq!(parse_size("0x8000"), Some(0x8000));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("big"), None);
    }
}
