use capture_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the proxy binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to write JSON formatted logs to stdout
    pub json_format: bool,

    /// Whether to enable colored output (only for non-JSON format)
    pub enable_colors: bool,

    /// Log file path; when set, logs are also appended there
    pub log_file: Option<PathBuf>,

    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();

        // Connection level noise from the proxy stack
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("rustls".to_string(), "warn".to_string());
        module_levels.insert("hudsucker".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

/// Initialize logging based on the provided configuration.
///
/// The returned guard flushes the log file on drop and must be kept alive
/// for as long as the process logs.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level)
            .parse()
            .map_err(|e| ConfigError::new("log_level", format!("has invalid directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(create_file_appender(path)?);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let json_layer = config
        .json_format
        .then(|| fmt::layer().json().with_target(true));
    let text_layer = (!config.json_format)
        .then(|| fmt::layer().with_target(true).with_ansi(config.enable_colors));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(_) => tracing::info!("Logging initialized with level: {}", config.level),
        // Logging already initialized, that's fine
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

fn create_file_appender(
    log_file: &Path,
) -> Result<tracing_appender::rolling::RollingFileAppender, ConfigError> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let filename = log_file
        .file_name()
        .ok_or_else(|| ConfigError::new("log_file", "has no file name"))?;
    let directory = match log_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(directory).map_err(|e| {
        ConfigError::new("log_file", format!("directory cannot be created: {}", e))
    })?;

    Ok(RollingFileAppender::new(Rotation::NEVER, directory, filename))
}
