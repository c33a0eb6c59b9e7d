//! Capture Core Library
//!
//! An intercepting HTTP/HTTPS proxy with a pluggable interceptor chain.
//! The bundled telemetry capture interceptor stores matching ping
//! submissions on disk and answers them locally.

pub mod admin;
pub mod ca;
pub mod certificates;
pub mod filter;
pub mod flow;
pub mod handlers;
pub mod interceptor;
/// Core proxy functionality modules
pub mod proxy;
pub mod store;
pub mod telemetry;

/// Configuration types and resolution from options and environment
pub mod config;

/// Error types for proxy operations
pub mod error;

pub use admin::{Metrics, MetricsSnapshot};
pub use ca::{CertificateAuthority, LeafCertificate, LeafCertificateSource};
pub use certificates::CertificateManager;
pub use config::{
    ConfigResolver, InterceptorConfig, PathSegment, PathTemplate, ProxyConfig,
    TelemetryCaptureConfig,
};
pub use error::{ConfigError, InterceptError, ProxyError};
pub use filter::ScopeMatcher;
pub use flow::{Flow, FlowId, FlowRequest, FlowResponse};
pub use handlers::PipelineHandler;
pub use interceptor::{HookOutcome, Interceptor, InterceptorRegistry};
/// Re-export commonly used types
pub use proxy::{FatalSignal, ProxyServer};
pub use store::{CaptureRecord, CaptureStore};
pub use telemetry::TelemetryCaptureInterceptor;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
