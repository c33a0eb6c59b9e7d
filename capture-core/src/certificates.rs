//! Per-host TLS server configurations for intercepted CONNECT tunnels

use crate::ca::{LeafCertificate, LeafCertificateSource};
use crate::error::ProxyError;
use crate::Result;
use dashmap::DashMap;
use hudsucker::certificate_authority::CertificateAuthority as HudsuckerAuthority;
use hudsucker::hyper::http::uri::Authority;
use hudsucker::rustls::{Certificate, PrivateKey, ServerConfig};
use std::sync::Arc;
use tracing::{debug, error};

/// Host used for the placeholder config handed out when leaf issuance fails.
const FALLBACK_HOST: &str = "capture-proxy.invalid";

/// Caches one rustls `ServerConfig` per intercepted hostname.
///
/// Leaf key generation is the expensive part of a MITM handshake, so configs
/// are kept until the cache reaches `capacity`.
pub struct CertificateManager {
    source: Arc<dyn LeafCertificateSource>,
    cache: DashMap<String, Arc<ServerConfig>>,
    capacity: usize,
    fallback: Arc<ServerConfig>,
}

impl CertificateManager {
    pub fn new(source: Arc<dyn LeafCertificateSource>, capacity: usize) -> Result<Self> {
        let fallback = Arc::new(server_config(source.leaf_certificate(FALLBACK_HOST)?)?);
        Ok(Self {
            source,
            cache: DashMap::new(),
            capacity: capacity.max(1),
            fallback,
        })
    }

    /// Server config for `hostname`, issuing a leaf on first use.
    pub fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.cache.get(hostname) {
            return Ok(Arc::clone(config.value()));
        }

        debug!(host = hostname, "Issuing leaf certificate");
        let config = Arc::new(server_config(self.source.leaf_certificate(hostname)?)?);

        if self.cache.len() >= self.capacity {
            let evicted = self.cache.iter().next().map(|entry| entry.key().clone());
            if let Some(host) = evicted {
                self.cache.remove(&host);
            }
        }
        // Concurrent first handshakes for one host all end up with the same config
        let cached = self
            .cache
            .entry(hostname.to_string())
            .or_insert(config)
            .value()
            .clone();
        Ok(cached)
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

fn server_config(leaf: LeafCertificate) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(leaf.cert_der)], PrivateKey(leaf.key_der))
        .map_err(|e| ProxyError::Certificate(format!("Invalid leaf certificate: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[async_trait::async_trait]
impl HudsuckerAuthority for CertificateManager {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        match self.server_config_for(authority.host()) {
            Ok(config) => config,
            Err(e) => {
                // The client handshake fails against the placeholder, closing
                // only this connection.
                error!(host = authority.host(), error = %e, "Leaf certificate issuance failed");
                Arc::clone(&self.fallback)
            }
        }
    }
}
