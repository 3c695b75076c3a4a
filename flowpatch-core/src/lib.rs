//! flowpatch core library
//!
//! The flow interception policy engine for the hssenglish.com client: target
//! matching, response mutation, login rewriting, user transform units and the
//! runtime enable switch, plus a hudsucker adapter and admin API to run it.

pub mod admin;
pub mod ca;
pub mod controller;
pub mod handlers;
pub mod proxy;

/// Configuration types and utilities
pub mod config;

/// Settings record and its stores
pub mod settings;

/// Error types for proxy and policy operations
pub mod error;

pub mod engine;
pub mod extension;
pub mod fetch;
pub mod flow;
pub mod matcher;
pub mod mutation;
pub mod rewriter;
pub mod rules;

pub use admin::Metrics;
pub use ca::CertificateAuthority;
pub use config::{CertificateConfig, EngineOptions, ProxyConfig};
pub use controller::ModeController;
pub use engine::PolicyEngine;
pub use error::{ConfigError, ExtensionError, FetchError, PolicyError, ProxyError};
pub use extension::{ExtensionLoader, LoadedExtensions, Side, TransformUnit};
pub use fetch::{ContentFetcher, FetchedContent, HttpFetcher};
pub use flow::{Flow, FlowRequest, FlowResponse};
pub use handlers::InterceptHandler;
pub use matcher::{Target, TargetMatcher};
pub use proxy::ProxyServer;
pub use rules::WatchedRule;
pub use settings::{ConfigStore, JsonFileStore, MemoryStore, Settings};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
