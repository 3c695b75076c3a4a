//! Error types for proxy and policy operations

use std::time::Duration;
use thiserror::Error;

/// Main error type for transport-side operations (server startup, CA, admin API)
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),
    /// Certificate-related errors
    #[error("Certificate error: {0}")]
    Certificate(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading the settings record
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a [`crate::fetch::ContentFetcher`]
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("failed to read body from {url}: {message}")]
    Body { url: String, message: String },
}

/// Errors raised while compiling or running a transform unit
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("{side} transform failed to compile: {message}")]
    Compile { side: &'static str, message: String },

    #[error("{side} transform does not define function `{function}`")]
    MissingEntryPoint {
        side: &'static str,
        function: &'static str,
    },

    #[error("{side} transform raised: {message}")]
    Runtime { side: &'static str, message: String },

    #[error("{side} transform produced an unreadable flow: {source}")]
    FlowView {
        side: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced inside the policy engine. None of these ever reach the transport;
/// the engine logs them and falls back to the unmodified flow.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("credentials were not configured within {0:?}")]
    CredentialTimeout(Duration),

    #[error("response body of {url} is not JSON: {source}")]
    MalformedBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("substitution target {url} answered with status {status}")]
    FetchStatus { url: String, status: u16 },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}
