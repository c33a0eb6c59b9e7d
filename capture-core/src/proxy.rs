use crate::{
    admin::{start_admin_server, Metrics},
    ca::CertificateAuthority,
    certificates::CertificateManager,
    config::{InterceptorConfig, ProxyConfig},
    error::{InterceptError, ProxyError},
    filter::ScopeMatcher,
    handlers::PipelineHandler,
    interceptor::{Interceptor, InterceptorRegistry},
    telemetry::TelemetryCaptureInterceptor,
    Result,
};
use hudsucker::ProxyBuilder;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Raised by the request pipeline when an interceptor hits an error that
/// must stop the whole proxy. Only the first error is kept.
#[derive(Clone)]
pub struct FatalSignal {
    tx: Arc<watch::Sender<Option<InterceptError>>>,
}

impl Default for FatalSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, err: InterceptError) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(err);
            true
        });
    }

    pub fn error(&self) -> Option<InterceptError> {
        self.tx.borrow().clone()
    }

    /// Resolves once `trip` has been called.
    pub async fn tripped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if rx.borrow_and_update().is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone: the signal can never fire
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct ProxyServer {
    config: ProxyConfig,
    ca: CertificateAuthority,
    registry: InterceptorRegistry,
    metrics: Arc<Metrics>,
    fatal: FatalSignal,
}

impl ProxyServer {
    /// Builds the interceptor chain listed in `config.interceptors`.
    pub fn new(config: ProxyConfig, ca: CertificateAuthority) -> Self {
        let metrics = Arc::new(Metrics::default());
        let mut registry = InterceptorRegistry::new();
        for interceptor in &config.interceptors {
            match interceptor {
                InterceptorConfig::TelemetryCapture(capture) => registry.register(Arc::new(
                    TelemetryCaptureInterceptor::new(capture.clone(), metrics.clone()),
                )),
            }
        }
        Self {
            config,
            ca,
            registry,
            metrics,
            fatal: FatalSignal::new(),
        }
    }

    /// Appends an interceptor after the configured ones.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.registry.register(interceptor);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serves until `shutdown` resolves or an interceptor reports a fatal
    /// error. In the latter case the error is returned once the listener
    /// has stopped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        self.registry.validate()?;

        let addr = self.config.listen_addr;
        info!(
            "Starting proxy server on {} with {} interceptor(s)",
            addr,
            self.registry.len()
        );
        if let Some(path) = self.ca.cert_path() {
            info!("Clients must trust the root CA at {}", path.display());
        }

        let admin = self.config.admin_port.map(|port| {
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = start_admin_server(port, metrics).await {
                    error!("Admin server failed: {}", e);
                }
            })
        });

        let authority = CertificateManager::new(Arc::new(self.ca), self.config.cert_cache_size)?;
        let handler = PipelineHandler::new(
            Arc::new(self.registry),
            self.metrics.clone(),
            ScopeMatcher::new(&self.config.intercept_hosts, &self.config.passthrough_hosts),
            self.config.tls_interception,
            self.fatal.clone(),
        );

        let fatal = self.fatal.clone();
        let stop = async move {
            tokio::select! {
                _ = shutdown => info!("Shutdown requested"),
                _ = fatal.tripped() => warn!("Stopping after fatal interception error"),
            }
        };

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(handler)
            .build();

        let outcome = proxy
            .start(stop)
            .await
            .map_err(|e| ProxyError::Network(format!("Proxy failed: {}", e)));

        if let Some(handle) = admin {
            handle.abort();
        }

        outcome?;
        match self.fatal.error() {
            Some(e) => Err(ProxyError::Intercept(e)),
            None => {
                info!("Proxy stopped");
                Ok(())
            }
        }
    }
}
