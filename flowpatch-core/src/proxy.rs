use crate::{
    admin::start_admin_server, ca::CertificateAuthority, config::ProxyConfig,
    engine::PolicyEngine, error::ProxyError, handlers::InterceptHandler, Result,
};
use hudsucker::{certificate_authority::RcgenAuthority, rustls, ProxyBuilder};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

pub struct ProxyServer {
    config: ProxyConfig,
    ca: CertificateAuthority,
    engine: Arc<PolicyEngine>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, ca: CertificateAuthority, engine: Arc<PolicyEngine>) -> Self {
        Self { config, ca, engine }
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let port = match self.config.listen_port {
            0 => pick_free_port(&self.config.listen_address)?,
            port => port,
        };
        let addr = listen_addr(&self.config.listen_address, port)?;
        info!("Starting proxy server on {}", addr);

        if let Some(path) = &self.config.port_file {
            write_port_file(path, port)?;
            info!("Proxy port written to {}", path.display());
        }
        info!(
            "Clients must trust {} to be intercepted",
            self.ca.installable_cert_path().display()
        );

        // Start Admin Server
        let admin_port = self.config.admin_port;
        let metrics = self.engine.metrics();
        let controller = self.engine.controller().clone();
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(admin_port, metrics, controller).await {
                error!("Admin server failed: {}", e);
            }
        });

        // Hudsucker/Rustls expects DER, not PEM.
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);

        let authority = RcgenAuthority::new(
            private_key,
            ca_cert,
            self.config.certificate_config.cache_size,
        )
        .map_err(|e| ProxyError::Certificate(format!("Failed to create CA authority: {}", e)))?;

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(InterceptHandler::new(self.engine))
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| ProxyError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy server on {} stopped", addr);
        Ok(())
    }
}

fn listen_addr(address: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", address, port)
        .parse()
        .map_err(|e| ProxyError::Configuration(format!("Invalid listen address {}: {}", address, e)))
}

/// Ask the OS for a port that is free right now on `address`.
pub fn pick_free_port(address: &str) -> Result<u16> {
    let listener = TcpListener::bind(listen_addr(address, 0)?)
        .map_err(|e| ProxyError::Network(format!("Failed to find a free port: {}", e)))?;
    Ok(listener.local_addr()?.port())
}

/// Write `port` as plain decimal text, creating parent directories as needed.
pub fn write_port_file(path: &Path, port: u16) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, port.to_string())?;
    Ok(())
}
