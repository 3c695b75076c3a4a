//! flowpatch agent
//!
//! Standalone executable that runs the interception proxy for the embedding
//! application: loads the settings file, wires the policy engine into the
//! hudsucker transport and exposes the admin/control API.

use anyhow::{anyhow, Context};
use clap::Parser;
use flowpatch_core::{
    CertificateAuthority, CertificateConfig, EngineOptions, HttpFetcher, JsonFileStore,
    PolicyEngine, ProxyConfig, ProxyServer,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub mod logging;


#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_addr: String,

    /// Port to listen on; 0 picks a free port
    #[arg(long, default_value_t = 0)]
    pub listen_port: u16,

    /// Port to expose the Admin API (health/metrics/mode)
    #[arg(long, default_value_t = 9091)]
    pub admin_port: u16,

    /// File the chosen proxy port is written to
    #[arg(long)]
    pub port_file: Option<PathBuf>,

    /// Settings file (credentials, URL replacements, custom code).
    /// Defaults to settings.json in the per-user application directory.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Directory holding the CA certificate and key
    #[arg(long, default_value = "./certs")]
    pub cert_dir: PathBuf,

    /// JSON file with engine options
    #[arg(long)]
    pub engine_config: Option<PathBuf>,

    /// How often to re-read settings while waiting for credentials (ms)
    #[arg(long)]
    pub credential_poll_interval: Option<u64>,

    /// Give up waiting for credentials after this many seconds
    #[arg(long)]
    pub credential_timeout: Option<u64>,

    /// Wait for credentials indefinitely
    #[arg(long, conflicts_with = "credential_timeout")]
    pub no_credential_timeout: bool,

    /// Timeout for substitution fetches (seconds)
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Time limit for one custom function run (ms)
    #[arg(long)]
    pub extension_time_limit: Option<u64>,

    /// Start with rewrite mode enabled
    #[arg(long)]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON formatted logs
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to this file, rotated daily
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

const ENV_POLL_INTERVAL: &str = "FLOWPATCH_CREDENTIAL_POLL_INTERVAL_MS";
const ENV_CREDENTIAL_TIMEOUT: &str = "FLOWPATCH_CREDENTIAL_TIMEOUT_SECS";
const ENV_FETCH_TIMEOUT: &str = "FLOWPATCH_FETCH_TIMEOUT_SECS";
const ENV_EXTENSION_TIME_LIMIT: &str = "FLOWPATCH_EXTENSION_TIME_LIMIT_MS";
const ENV_EXTENSION_MEMORY_LIMIT: &str = "FLOWPATCH_EXTENSION_MEMORY_LIMIT";

fn env_value<T: FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

/// Engine options layered as defaults, then `--engine-config`, then
/// `FLOWPATCH_*` environment variables, then CLI flags.
pub fn load_engine_options(args: &Args) -> anyhow::Result<EngineOptions> {
    let mut options = match &args.engine_config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read engine config {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse engine config {}", path.display()))?
        }
        None => EngineOptions::default(),
    };

    if let Some(v) = env_value(ENV_POLL_INTERVAL)? {
        options.credential_poll_interval_ms = v;
    }
    // "none" lifts the bound
    match std::env::var(ENV_CREDENTIAL_TIMEOUT) {
        Ok(raw) if raw.trim().eq_ignore_ascii_case("none") => options.credential_timeout_secs = None,
        Ok(_) => options.credential_timeout_secs = env_value(ENV_CREDENTIAL_TIMEOUT)?,
        Err(_) => {}
    }
    if let Some(v) = env_value(ENV_FETCH_TIMEOUT)? {
        options.fetch_timeout_secs = v;
    }
    if let Some(v) = env_value(ENV_EXTENSION_TIME_LIMIT)? {
        options.extension_time_limit_ms = v;
    }
    if let Some(v) = env_value(ENV_EXTENSION_MEMORY_LIMIT)? {
        options.extension_memory_limit = v;
    }

    if let Some(v) = args.credential_poll_interval {
        options.credential_poll_interval_ms = v;
    }
    if let Some(v) = args.credential_timeout {
        options.credential_timeout_secs = Some(v);
    }
    if args.no_credential_timeout {
        options.credential_timeout_secs = None;
    }
    if let Some(v) = args.fetch_timeout {
        options.fetch_timeout_secs = v;
    }
    if let Some(v) = args.extension_time_limit {
        options.extension_time_limit_ms = v;
    }

    options
        .validate()
        .map_err(|e| anyhow!("Engine configuration validation failed: {}", e))?;
    Ok(options)
}

pub fn logging_config(args: &Args) -> logging::LoggingConfig {
    logging::LoggingConfig {
        level: args.log_level.clone(),
        json_format: args.log_json,
        log_file: args.log_file.clone(),
        ..Default::default()
    }
}

pub fn proxy_config(args: &Args) -> ProxyConfig {
    ProxyConfig {
        listen_address: args.listen_addr.clone(),
        listen_port: args.listen_port,
        admin_port: args.admin_port,
        port_file: args.port_file.clone(),
        certificate_config: CertificateConfig {
            cert_store_path: args.cert_dir.display().to_string(),
            ..Default::default()
        },
    }
}

/// Build the policy engine. Must be called outside of the Tokio runtime: the
/// blocking fetch client owns a runtime of its own.
pub fn build_engine(args: &Args, options: &EngineOptions) -> anyhow::Result<Arc<PolicyEngine>> {
    let store = match &args.settings {
        Some(path) => JsonFileStore::new(path),
        None => JsonFileStore::in_default_location()
            .context("Failed to prepare the settings directory")?,
    };
    tracing::info!("  Settings: {}", store.path().display());

    let fetcher = HttpFetcher::new(options.fetch_timeout())?;
    let engine = PolicyEngine::new(Arc::new(store), Arc::new(fetcher), options);
    if args.enabled {
        engine.set_enabled(true);
    }
    Ok(Arc::new(engine))
}

pub async fn run_agent(args: Args, engine: Arc<PolicyEngine>) -> anyhow::Result<()> {
    tracing::info!("Starting flowpatch agent...");
    tracing::info!("  Listen: {}:{}", args.listen_addr, args.listen_port);
    tracing::info!("  Admin:  127.0.0.1:{}", args.admin_port);

    let config = proxy_config(&args);
    let ca = CertificateAuthority::new(Path::new(&config.certificate_config.cert_store_path))?;

    let proxy_server = ProxyServer::new(config, ca, engine);
    proxy_server.run().await?;
    Ok(())
}
