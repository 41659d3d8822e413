/// Structured logging for the flood risk service
///
/// Provides context-rich logging with component and region/location
/// identifiers, timestamps, and severity levels. Supports both console
/// output and file-based logging for daemon operations.

use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::ingest::SourceError;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Which part of the service a log entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Terrain,
    WaterBodies,
    Rainfall,
    ZoneStore,
    Alerts,
    Engine,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Terrain => write!(f, "TERRAIN"),
            Component::WaterBodies => write!(f, "WATER"),
            Component::Rainfall => write!(f, "RAIN"),
            Component::ZoneStore => write!(f, "STORE"),
            Component::Alerts => write!(f, "ALERT"),
            Component::Engine => write!(f, "ENGINE"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the layer simply has no coverage at this location
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        if let Ok(mut slot) = LOGGER.lock() {
            *slot = Some(logger);
        }
    }

    fn log(&self, level: LogLevel, component: Component, key: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let key_part = key.map(|k| format!(" [{}]", k)).unwrap_or_default();
        let log_entry = format!("{} {} {}{}: {}", timestamp, level, component, key_part, message);

        // Console output
        if self.console_timestamps {
            match level {
                LogLevel::Error => eprintln!("{}", log_entry),
                LogLevel::Warning => eprintln!("   {}", log_entry),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}", message),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", component, key_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", component, key_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => {} // Skip debug in non-timestamp mode
            }
        }

        // File output
        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

fn emit(level: LogLevel, component: Component, key: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, component, key, message);
        }
    }
}

/// Log a general informational message
pub fn info(component: Component, key: Option<&str>, message: &str) {
    emit(LogLevel::Info, component, key, message);
}

/// Log a warning message
pub fn warn(component: Component, key: Option<&str>, message: &str) {
    emit(LogLevel::Warning, component, key, message);
}

/// Log an error message
pub fn error(component: Component, key: Option<&str>, message: &str) {
    emit(LogLevel::Error, component, key, message);
}

/// Log a debug message
pub fn debug(component: Component, key: Option<&str>, message: &str) {
    emit(LogLevel::Debug, component, key, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a data source failure.
///
/// A layer with no sample near the location is normal (sparse gauge
/// networks, coastline gaps). Timeouts and transport errors point at the
/// collaborator itself.
pub fn classify_source_failure(err: &SourceError) -> FailureType {
    match err {
        SourceError::NoData(_) => FailureType::Expected,
        SourceError::Timeout { .. } | SourceError::Http(_) => FailureType::Unexpected,
        SourceError::Query(_) | SourceError::Parse(_) => FailureType::Unknown,
    }
}

/// Log a data source failure with automatic classification
pub fn log_source_failure(component: Component, key: &str, operation: &str, err: &SourceError) {
    let failure_type = classify_source_failure(err);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(component, Some(key), &message),
        FailureType::Unexpected => error(component, Some(key), &message),
        FailureType::Unknown => warn(component, Some(key), &message),
    }
}

// ---------------------------------------------------------------------------
// Pass Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one evaluation pass over the configured regions
pub fn log_evaluation_summary(total: usize, successful: usize, deferred: usize, failed: usize) {
    let message = format!(
        "Evaluation pass complete: {}/{} committed, {} deferred, {} failed",
        successful, total, deferred, failed
    );

    if failed == 0 && deferred == 0 {
        info(Component::Engine, None, &message);
    } else if successful == 0 && total > 0 {
        error(Component::Engine, None, &message);
    } else {
        warn(Component::Engine, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_failure_classification() {
        let no_coverage = SourceError::NoData("no elevation sample within range".to_string());
        assert_eq!(classify_source_failure(&no_coverage), FailureType::Expected);

        let timeout = SourceError::Timeout {
            source: "terrain",
            after: Duration::from_millis(5_000),
        };
        assert_eq!(classify_source_failure(&timeout), FailureType::Unexpected);

        assert_eq!(
            classify_source_failure(&SourceError::Http(503)),
            FailureType::Unexpected
        );
        assert_eq!(
            classify_source_failure(&SourceError::Query("relation missing".to_string())),
            FailureType::Unknown
        );
    }

    #[test]
    fn test_log_file_receives_entries() {
        let path = std::env::temp_dir().join(format!("flood_risk_log_{}.log", std::process::id()));
        let logger = Logger {
            min_level: LogLevel::Info,
            log_file: Some(path.to_string_lossy().into_owned()),
            console_timestamps: true,
        };
        logger.log(LogLevel::Warning, Component::Rainfall, Some("nsanje"), "gauge offline");
        logger.log(LogLevel::Debug, Component::Rainfall, None, "filtered out");

        let contents = std::fs::read_to_string(&path).expect("log file should exist");
        let _ = std::fs::remove_file(&path);
        assert!(contents.contains("WARN RAIN [nsanje]: gauge offline"));
        assert!(!contents.contains("filtered out"));
    }
}
