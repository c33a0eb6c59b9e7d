//! Capture Proxy Binary
//!
//! Standalone executable that intercepts HTTP/HTTPS traffic and captures
//! telemetry submissions to disk instead of sending them upstream.

use capture_core::config::{
    ADMIN_PORT, CA_DIR, CERT_CACHE_SIZE, CLIENT_SEGMENTATION, GLEAN_APP_ID, INTERCEPT_HOSTS,
    LISTEN_ADDR, MATCH_PREFIX, PASSTHROUGH_HOSTS, PATH_TEMPLATE, PROXY_INSTANCE_ID, STORAGE_ROOT,
    TELEMETRY_ENDPOINT, TLS_INTERCEPTION,
};
use capture_core::{
    CertificateAuthority, ConfigError, ConfigResolver, InterceptorConfig, ProxyConfig, ProxyError,
    ProxyServer,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

pub mod logging;
pub use logging::{init_logging, LoggingConfig};


#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Directory holding the root CA (created on first start)
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,

    /// Terminate TLS for CONNECT tunnels
    #[arg(long)]
    pub tls_interception: Option<bool>,

    /// Number of per-host certificates kept in memory
    #[arg(long)]
    pub cert_cache_size: Option<usize>,

    /// Comma separated host patterns to intercept
    #[arg(long)]
    pub intercept_hosts: Option<String>,

    /// Comma separated host patterns never intercepted
    #[arg(long)]
    pub passthrough_hosts: Option<String>,

    /// The Glean app id to intercept messages for
    #[arg(long)]
    pub glean_app_id: Option<String>,

    /// Submission endpoint the app id is appended to
    #[arg(long)]
    pub telemetry_endpoint: Option<String>,

    /// Full URL prefix to intercept; overrides --glean-app-id
    #[arg(long)]
    pub match_prefix: Option<String>,

    /// Base directory for captured payloads
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// A proxy id for this proxy instantiation
    #[arg(long)]
    pub proxy_instance_id: Option<String>,

    /// Store captures in one directory per client id
    #[arg(long)]
    pub client_segmentation: Option<bool>,

    /// Directory layout below the storage root, e.g. `{run_id}/{client_id}`
    #[arg(long)]
    pub path_template: Option<String>,

    /// Set any option as `name=value`; may be repeated
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub set: Vec<String>,

    /// Log level or filter directive
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Also append logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Feeds the command line into `resolver`. Dedicated flags win over
    /// `--set` assignments of the same option.
    pub fn apply(&self, resolver: &mut ConfigResolver) -> Result<(), ConfigError> {
        for assignment in &self.set {
            resolver.set_assignment(assignment)?;
        }

        let flags = [
            (LISTEN_ADDR.name, self.listen_addr.map(|a| a.to_string())),
            (ADMIN_PORT.name, self.admin_port.map(|p| p.to_string())),
            (CA_DIR.name, path_option(&self.ca_dir)),
            (TLS_INTERCEPTION.name, self.tls_interception.map(|b| b.to_string())),
            (CERT_CACHE_SIZE.name, self.cert_cache_size.map(|n| n.to_string())),
            (INTERCEPT_HOSTS.name, self.intercept_hosts.clone()),
            (PASSTHROUGH_HOSTS.name, self.passthrough_hosts.clone()),
            (GLEAN_APP_ID.name, self.glean_app_id.clone()),
            (TELEMETRY_ENDPOINT.name, self.telemetry_endpoint.clone()),
            (MATCH_PREFIX.name, self.match_prefix.clone()),
            (STORAGE_ROOT.name, path_option(&self.storage_root)),
            (PROXY_INSTANCE_ID.name, self.proxy_instance_id.clone()),
            (CLIENT_SEGMENTATION.name, self.client_segmentation.map(|b| b.to_string())),
            (PATH_TEMPLATE.name, self.path_template.clone()),
        ];
        for (name, value) in flags {
            if let Some(value) = value {
                resolver.set_option(name, value)?;
            }
        }
        Ok(())
    }

    /// Resolves the proxy configuration from these flags over `resolver`.
    pub fn resolve(&self, mut resolver: ConfigResolver) -> Result<ProxyConfig, ConfigError> {
        self.apply(&mut resolver)?;
        resolver.resolve()
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            enable_colors: !self.log_json && self.log_file.is_none(),
            log_file: self.log_file.clone(),
            ..LoggingConfig::default()
        }
    }
}

fn path_option(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

pub async fn run_proxy(args: Args) -> Result<(), ProxyError> {
    // Logging should be initialized by the caller (main or test)
    let config = args.resolve(ConfigResolver::from_env())?;

    tracing::info!("Starting Capture Proxy...");
    tracing::info!("  Listen: {}", config.listen_addr);
    if let Some(port) = config.admin_port {
        tracing::info!("  Admin:  127.0.0.1:{}", port);
    }
    for interceptor in &config.interceptors {
        match interceptor {
            InterceptorConfig::TelemetryCapture(capture) => {
                tracing::info!("  Capturing: {}", capture.match_prefix);
                tracing::info!(
                    "  Storage:   {} (layout `{}`)",
                    capture.storage_root.display(),
                    capture.path_template
                );
            }
        }
    }

    let ca = CertificateAuthority::new(&config.ca_dir)?;
    ProxyServer::new(config, ca).run().await
}
