//! Configuration types and the option resolver
//!
//! Options are resolved once, before the proxy starts listening, from (in
//! priority order) explicit options, environment variables and defaults. The
//! result is an immutable [`ProxyConfig`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Glean ingestion endpoint; the app id is appended to form the match prefix.
pub const DEFAULT_TELEMETRY_ENDPOINT: &str = "https://incoming.telemetry.mozilla.org/submit/";

/// One directory level under the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Literal(String),
    /// The configured run / proxy instance id.
    RunId,
    /// `client_info.client_id` read from the captured payload.
    ClientId,
}

/// Ordered list of directory segments, written as `telemetry/{run_id}/{client_id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathTemplate {
    segments: Vec<PathSegment>,
}

impl PathTemplate {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn uses_run_id(&self) -> bool {
        self.segments.contains(&PathSegment::RunId)
    }

    pub fn uses_client_id(&self) -> bool {
        self.segments.contains(&PathSegment::ClientId)
    }
}

impl FromStr for PathTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for raw in s.split('/').filter(|part| !part.is_empty()) {
            let segment = match raw {
                "{run_id}" => PathSegment::RunId,
                "{client_id}" => PathSegment::ClientId,
                literal if literal.contains(['{', '}']) => {
                    return Err(ConfigError::new(
                        "path_template",
                        format!("has unknown placeholder `{}`", literal),
                    ))
                }
                literal if !is_single_component(literal) => {
                    return Err(ConfigError::new(
                        "path_template",
                        format!("segment `{}` is not a plain directory name", literal),
                    ))
                }
                literal => PathSegment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }
        Ok(Self { segments })
    }
}

impl TryFrom<String> for PathTemplate {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PathTemplate> for String {
    fn from(template: PathTemplate) -> Self {
        template.to_string()
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|segment| match segment {
                PathSegment::Literal(s) => s.as_str(),
                PathSegment::RunId => "{run_id}",
                PathSegment::ClientId => "{client_id}",
            })
            .collect();
        write!(f, "{}", parts.join("/"))
    }
}

/// True when `value` names exactly one ordinary path component.
pub(crate) fn is_single_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains(['/', '\\'])
}

/// Configuration of the telemetry capture interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCaptureConfig {
    /// Requests whose URL starts with this prefix are captured.
    pub match_prefix: String,
    /// Base directory for capture files.
    pub storage_root: PathBuf,
    /// Directory layout below `storage_root`.
    pub path_template: PathTemplate,
    /// Value of the `{run_id}` segment.
    pub run_id: Option<String>,
}

impl TelemetryCaptureConfig {
    pub fn for_app_id(app_id: &str, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            match_prefix: format!("{}{}", DEFAULT_TELEMETRY_ENDPOINT, app_id),
            storage_root: storage_root.into(),
            path_template: PathTemplate::default(),
            run_id: None,
        }
    }

    /// Checks every option the interceptor needs before it sees traffic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.match_prefix.trim().is_empty() {
            return Err(ConfigError::missing("match_prefix"));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::missing("storage_root"));
        }
        if self.path_template.uses_run_id() {
            match self.run_id.as_deref() {
                None | Some("") => return Err(ConfigError::missing("proxy_instance_id")),
                Some(id) if !is_single_component(id) => {
                    return Err(ConfigError::new(
                        "proxy_instance_id",
                        "must be a plain directory name",
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Interceptors instantiated by the proxy, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptorConfig {
    TelemetryCapture(TelemetryCaptureConfig),
}

/// Proxy configuration, fixed for the lifetime of a running proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Admin API port (health/metrics); disabled when `None`
    pub admin_port: Option<u16>,
    /// Terminate TLS for CONNECT tunnels; when off, tunnels are relayed opaquely
    pub tls_interception: bool,
    /// Directory holding the root CA (`ca.pem`, `ca.key`)
    pub ca_dir: PathBuf,
    /// Number of per-host TLS server configs kept in memory
    pub cert_cache_size: usize,
    /// Hosts to intercept TLS for (wildcards); empty means all
    pub intercept_hosts: Vec<String>,
    /// Hosts never intercepted (wildcards); wins over `intercept_hosts`
    pub passthrough_hosts: Vec<String>,
    pub interceptors: Vec<InterceptorConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            admin_port: None,
            tls_interception: true,
            ca_dir: PathBuf::from("./certs"),
            cert_cache_size: 1000,
            intercept_hosts: Vec::new(),
            passthrough_hosts: Vec::new(),
            interceptors: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_cache_size == 0 {
            return Err(ConfigError::new("cert_cache_size", "must be at least 1"));
        }
        for interceptor in &self.interceptors {
            match interceptor {
                InterceptorConfig::TelemetryCapture(config) => config.validate()?,
            }
        }
        Ok(())
    }
}

/// A named option with its environment fallbacks.
#[derive(Debug, Clone, Copy)]
pub struct OptionKey {
    pub name: &'static str,
    pub env: &'static [&'static str],
    pub help: &'static str,
}

pub const LISTEN_ADDR: OptionKey = OptionKey {
    name: "listen_addr",
    env: &["CAPTURE_PROXY_LISTEN_ADDR"],
    help: "Address the proxy listens on",
};
pub const ADMIN_PORT: OptionKey = OptionKey {
    name: "admin_port",
    env: &["CAPTURE_PROXY_ADMIN_PORT"],
    help: "Port for the health/metrics API",
};
pub const CA_DIR: OptionKey = OptionKey {
    name: "ca_dir",
    env: &["CAPTURE_PROXY_CA_DIR"],
    help: "Directory holding the root CA",
};
pub const TLS_INTERCEPTION: OptionKey = OptionKey {
    name: "tls_interception",
    env: &["CAPTURE_PROXY_TLS_INTERCEPTION"],
    help: "Terminate TLS for CONNECT tunnels",
};
pub const CERT_CACHE_SIZE: OptionKey = OptionKey {
    name: "cert_cache_size",
    env: &["CAPTURE_PROXY_CERT_CACHE_SIZE"],
    help: "Number of cached per-host certificates",
};
pub const INTERCEPT_HOSTS: OptionKey = OptionKey {
    name: "intercept_hosts",
    env: &["CAPTURE_PROXY_INTERCEPT_HOSTS"],
    help: "Comma separated host patterns to intercept",
};
pub const PASSTHROUGH_HOSTS: OptionKey = OptionKey {
    name: "passthrough_hosts",
    env: &["CAPTURE_PROXY_PASSTHROUGH_HOSTS"],
    help: "Comma separated host patterns never intercepted",
};
pub const GLEAN_APP_ID: OptionKey = OptionKey {
    name: "glean_app_id",
    env: &["GLEAN_APP_ID"],
    help: "The Glean app id to intercept messages for",
};
pub const TELEMETRY_ENDPOINT: OptionKey = OptionKey {
    name: "telemetry_endpoint",
    env: &["TELEMETRY_ENDPOINT"],
    help: "Submission endpoint the app id is appended to",
};
pub const MATCH_PREFIX: OptionKey = OptionKey {
    name: "match_prefix",
    env: &["TELEMETRY_MATCH_PREFIX"],
    help: "Full URL prefix to intercept; overrides glean_app_id",
};
pub const STORAGE_ROOT: OptionKey = OptionKey {
    name: "storage_root",
    env: &["TELEMETRY_STORAGE_ROOT"],
    help: "Base directory for captured payloads",
};
pub const PROXY_INSTANCE_ID: OptionKey = OptionKey {
    name: "proxy_instance_id",
    env: &["PROXY_INSTANCE_ID", "TELEMETRY_FOLDER"],
    help: "A proxy id for this proxy instantiation",
};
pub const CLIENT_SEGMENTATION: OptionKey = OptionKey {
    name: "client_segmentation",
    env: &["TELEMETRY_CLIENT_SEGMENTATION"],
    help: "Store captures in one directory per client id",
};
pub const PATH_TEMPLATE: OptionKey = OptionKey {
    name: "path_template",
    env: &["TELEMETRY_PATH_TEMPLATE"],
    help: "Directory layout, e.g. `{run_id}/{client_id}`",
};

pub const ALL_OPTIONS: &[OptionKey] = &[
    LISTEN_ADDR,
    ADMIN_PORT,
    CA_DIR,
    TLS_INTERCEPTION,
    CERT_CACHE_SIZE,
    INTERCEPT_HOSTS,
    PASSTHROUGH_HOSTS,
    GLEAN_APP_ID,
    TELEMETRY_ENDPOINT,
    MATCH_PREFIX,
    STORAGE_ROOT,
    PROXY_INSTANCE_ID,
    CLIENT_SEGMENTATION,
    PATH_TEMPLATE,
];

const DEFAULT_STORAGE_ROOT: &str = "results/telemetry";

/// Resolves [`ProxyConfig`] from options, then environment, then defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    options: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl ConfigResolver {
    /// Resolver backed by the process environment.
    pub fn from_env() -> Self {
        Self::with_env(std::env::vars().collect())
    }

    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self {
            options: HashMap::new(),
            env,
        }
    }

    /// Sets an explicit option. Unknown names are rejected.
    pub fn set_option(&mut self, name: &str, value: impl Into<String>) -> Result<(), ConfigError> {
        if !ALL_OPTIONS.iter().any(|key| key.name == name) {
            return Err(ConfigError::new(name, "is not a known option"));
        }
        self.options.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Parses a mitmproxy style `name=value` assignment.
    pub fn set_assignment(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::new(assignment, "expected `name=value`"))?;
        self.set_option(name.trim(), value.trim())
    }

    /// Value for `key`; empty strings count as unset.
    pub fn lookup(&self, key: &OptionKey) -> Option<String> {
        if let Some(value) = self.options.get(key.name).filter(|v| !v.is_empty()) {
            return Some(value.clone());
        }
        key.env
            .iter()
            .filter_map(|name| self.env.get(*name))
            .find(|v| !v.is_empty())
            .cloned()
    }

    fn parse<T>(&self, key: &OptionKey) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.lookup(key)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|e| ConfigError::new(key.name, format!("has invalid value `{}`: {}", raw, e)))
            })
            .transpose()
    }

    fn flag(&self, key: &OptionKey) -> Result<Option<bool>, ConfigError> {
        self.lookup(key)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::new(key.name, format!("expects a boolean, got `{}`", raw))),
            })
            .transpose()
    }

    fn list(&self, key: &OptionKey) -> Vec<String> {
        self.lookup(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resolve(&self) -> Result<ProxyConfig, ConfigError> {
        let defaults = ProxyConfig::default();
        let config = ProxyConfig {
            listen_addr: self.parse(&LISTEN_ADDR)?.unwrap_or(defaults.listen_addr),
            admin_port: self.parse(&ADMIN_PORT)?,
            tls_interception: self.flag(&TLS_INTERCEPTION)?.unwrap_or(defaults.tls_interception),
            ca_dir: self.lookup(&CA_DIR).map(PathBuf::from).unwrap_or(defaults.ca_dir),
            cert_cache_size: self.parse(&CERT_CACHE_SIZE)?.unwrap_or(defaults.cert_cache_size),
            intercept_hosts: self.list(&INTERCEPT_HOSTS),
            passthrough_hosts: self.list(&PASSTHROUGH_HOSTS),
            interceptors: vec![InterceptorConfig::TelemetryCapture(self.resolve_telemetry()?)],
        };
        config.validate()?;
        Ok(config)
    }

    fn resolve_telemetry(&self) -> Result<TelemetryCaptureConfig, ConfigError> {
        let match_prefix = match self.lookup(&MATCH_PREFIX) {
            Some(prefix) => prefix,
            None => {
                let app_id = self
                    .lookup(&GLEAN_APP_ID)
                    .ok_or_else(|| ConfigError::missing(GLEAN_APP_ID.name))?;
                let endpoint = self
                    .lookup(&TELEMETRY_ENDPOINT)
                    .unwrap_or_else(|| DEFAULT_TELEMETRY_ENDPOINT.to_string());
                format!("{}{}", endpoint, app_id)
            }
        };
        let run_id = self.lookup(&PROXY_INSTANCE_ID);
        let path_template = match self.parse::<PathTemplate>(&PATH_TEMPLATE)? {
            Some(template) => template,
            None => {
                let mut segments = Vec::new();
                if run_id.is_some() {
                    segments.push(PathSegment::RunId);
                }
                if self.flag(&CLIENT_SEGMENTATION)?.unwrap_or(false) {
                    segments.push(PathSegment::ClientId);
                }
                PathTemplate::new(segments)
            }
        };

        Ok(TelemetryCaptureConfig {
            match_prefix,
            storage_root: self
                .lookup(&STORAGE_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            path_template,
            run_id,
        })
    }
}
