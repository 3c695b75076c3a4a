//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Static proxy startup configuration.
/// These settings are fixed at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Port to listen on; `0` picks a free port at startup
    pub listen_port: u16,
    /// Admin/control API port
    pub admin_port: u16,
    /// File the chosen listen port is written to, for the embedding application
    pub port_file: Option<PathBuf>,
    /// Certificate configuration
    pub certificate_config: CertificateConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            admin_port: 9091,
            port_file: None,
            certificate_config: CertificateConfig::default(),
        }
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Directory holding the CA certificate and key
    pub cert_store_path: String,
    /// Size of hudsucker's per-host leaf certificate cache
    pub cache_size: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cert_store_path: "./certs".to_string(),
            cache_size: 1000,
        }
    }
}

/// Tunables of the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// How often the login rewriter re-reads the settings while waiting for credentials
    pub credential_poll_interval_ms: u64,
    /// Upper bound on the credential wait; `None` waits forever
    pub credential_timeout_secs: Option<u64>,
    /// Timeout for substitution fetches and `http_get` calls from transform units
    pub fetch_timeout_secs: u64,
    /// Wall-clock budget for compiling or running one transform unit
    pub extension_time_limit_ms: u64,
    /// Heap ceiling for one transform unit's interpreter
    pub extension_memory_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            credential_poll_interval_ms: 1000,
            credential_timeout_secs: Some(300),
            fetch_timeout_secs: 15,
            extension_time_limit_ms: 2000,
            extension_memory_limit: 32 * 1024 * 1024,
        }
    }
}

impl EngineOptions {
    pub fn credential_poll_interval(&self) -> Duration {
        Duration::from_millis(self.credential_poll_interval_ms)
    }

    pub fn credential_timeout(&self) -> Option<Duration> {
        self.credential_timeout_secs.map(Duration::from_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extension_time_limit(&self) -> Duration {
        Duration::from_millis(self.extension_time_limit_ms)
    }

    /// Reject values that would make the engine spin or never finish a fetch.
    pub fn validate(&self) -> Result<(), String> {
        if self.credential_poll_interval_ms == 0 {
            return Err("credential_poll_interval_ms must be greater than 0".to_string());
        }
        if self.credential_timeout_secs == Some(0) {
            return Err("credential_timeout_secs must be greater than 0".to_string());
        }
        if self.fetch_timeout_secs == 0 {
            return Err("fetch_timeout_secs must be greater than 0".to_string());
        }
        if self.extension_time_limit_ms == 0 {
            return Err("extension_time_limit_ms must be greater than 0".to_string());
        }
        if self.extension_memory_limit < 1024 * 1024 {
            return Err("extension_memory_limit must be at least 1 MiB".to_string());
        }
        Ok(())
    }
}
