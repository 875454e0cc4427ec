//! Structured diagnostics and phase timing.
//!
//! Diagnostics are written to stderr (and optionally a file) through a
//! process-global [`Logger`]. Nothing is logged until the logger has been
//! initialized, so library users and tests stay quiet by default. Progress and
//! results are not diagnostics; they go through [`crate::progress`].

use crate::backend::DeviceId;
use crate::config::LoggingConfig;
use crate::error::{HitsError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Log level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,
    /// Debug-level logging
    Debug = 1,
    /// Info-level logging
    Info = 2,
    /// Warning-level logging
    Warn = 3,
    /// Error-level logging
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Timestamp when the log entry was created
    pub timestamp: SystemTime,
    /// Log level
    pub level: LogLevel,
    /// Component that generated the log
    pub component: String,
    /// Index of the transfer, if applicable
    pub transfer: Option<usize>,
    /// Device involved, if applicable
    pub device: Option<DeviceId>,
    /// Message content
    pub message: String,
    /// Duration if this is a timing log
    pub duration: Option<Duration>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, component: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            component: component.to_string(),
            transfer: None,
            device: None,
            message: message.to_string(),
            duration: None,
        }
    }

    /// Attach a transfer index.
    pub fn with_transfer(mut self, index: usize) -> Self {
        self.transfer = Some(index);
        self
    }

    /// Attach a device.
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    /// Add duration to the log entry.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    fn millis(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    /// Format the log entry as a human-readable line.
    pub fn format(&self) -> String {
        let mut parts = vec![
            format!("[{}]", self.millis()),
            self.level.to_string(),
            self.component.clone(),
        ];

        if let Some(index) = self.transfer {
            parts.push(format!("transfer:{}", index));
        }

        if let Some(device) = self.device {
            parts.push(format!("device:{}", device));
        }

        parts.push(self.message.clone());

        if let Some(duration) = self.duration {
            parts.push(format!("duration:{}us", duration.as_micros()));
        }

        parts.join(" ")
    }

    /// Format the log entry as a single JSON object.
    pub fn format_json(&self) -> String {
        let mut fields = vec![
            format!("\"timestamp\":{}", self.millis()),
            format!("\"level\":\"{}\"", self.level),
            format!("\"component\":\"{}\"", escape_json(&self.component)),
            format!("\"message\":\"{}\"", escape_json(&self.message)),
        ];

        if let Some(index) = self.transfer {
            fields.push(format!("\"transfer\":{}", index));
        }

        if let Some(device) = self.device {
            fields.push(format!("\"device\":{}", device.0));
        }

        if let Some(duration) = self.duration {
            fields.push(format!("\"duration_us\":{}", duration.as_micros()));
        }

        format!("{{{}}}", fields.join(","))
    }
}

fn escape_json(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Destination for log entries.
pub trait LogOutput: Send + Sync {
    /// Write a log entry to the output.
    fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> Result<()>;
}

/// Writes log entries to stderr.
#[derive(Debug, Default)]
pub struct ConsoleOutput {
    json_format: bool,
}

impl ConsoleOutput {
    /// Text format.
    pub fn new() -> Self {
        Self { json_format: false }
    }

    /// JSON format.
    pub fn new_json() -> Self {
        Self { json_format: true }
    }
}

impl LogOutput for ConsoleOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        let formatted = if self.json_format {
            entry.format_json()
        } else {
            entry.format()
        };

        eprintln!("{}", formatted);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        use std::io::Write;
        std::io::stderr().flush().map_err(HitsError::Io)
    }
}

/// Appends log entries to a file.
#[derive(Debug)]
pub struct FileOutput {
    path: std::path::PathBuf,
    json_format: bool,
}

impl FileOutput {
    /// Text format.
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: false,
        }
    }

    /// JSON format.
    pub fn new_json<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: true,
        }
    }
}

impl LogOutput for FileOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        use std::io::Write;

        let formatted = if self.json_format {
            entry.format_json()
        } else {
            entry.format()
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{}", formatted)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // opened and closed per entry
        Ok(())
    }
}

/// Central logger.
pub struct Logger {
    min_level: LogLevel,
    outputs: Vec<Box<dyn LogOutput>>,
    metrics: Arc<Mutex<PerformanceMetrics>>,
}

impl Logger {
    /// Logger at `Info` level writing text to stderr.
    pub fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
            outputs: vec![Box::new(ConsoleOutput::new())],
            metrics: Arc::new(Mutex::new(PerformanceMetrics::new())),
        }
    }

    /// Logger built from a [`LoggingConfig`].
    ///
    /// A disabled configuration yields a logger without outputs; timings are
    /// still collected.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut logger = Self {
            min_level: config.level,
            outputs: Vec::new(),
            metrics: Arc::new(Mutex::new(PerformanceMetrics::new())),
        };

        if config.enabled {
            if config.json_format {
                logger.add_output(Box::new(ConsoleOutput::new_json()));
            } else {
                logger.add_output(Box::new(ConsoleOutput::new()));
            }

            if let Some(path) = &config.log_file {
                if config.json_format {
                    logger.add_output(Box::new(FileOutput::new_json(path)));
                } else {
                    logger.add_output(Box::new(FileOutput::new(path)));
                }
            }
        }

        logger
    }

    /// Current minimum log level.
    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Add an output destination.
    pub fn add_output(&mut self, output: Box<dyn LogOutput>) {
        self.outputs.push(output);
    }

    /// Number of output destinations.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Log a message at the specified level.
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if level >= self.min_level {
            let entry = LogEntry::new(level, component, message);
            self.write_entry(&entry);
        }
    }

    /// Log a message about one transfer.
    pub fn log_transfer(
        &self,
        level: LogLevel,
        component: &str,
        index: usize,
        device: Option<DeviceId>,
        message: &str,
    ) {
        if level >= self.min_level {
            let mut entry = LogEntry::new(level, component, message).with_transfer(index);

            if let Some(device) = device {
                entry = entry.with_device(device);
            }

            self.write_entry(&entry);
        }
    }

    /// Record a phase timing and log it at debug level.
    pub fn log_timing(&self, component: &str, phase: &str, duration: Duration) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record_phase(phase, duration);
        }

        if LogLevel::Debug >= self.min_level {
            let entry = LogEntry::new(LogLevel::Debug, component, &format!("{} completed", phase))
                .with_duration(duration);
            self.write_entry(&entry);
        }
    }

    fn write_entry(&self, entry: &LogEntry) {
        for output in &self.outputs {
            if let Err(e) = output.write(entry) {
                eprintln!("Failed to write log entry: {}", e);
            }
        }
    }

    /// Flush all outputs.
    pub fn flush(&self) {
        for output in &self.outputs {
            if let Err(e) = output.flush() {
                eprintln!("Failed to flush log output: {}", e);
            }
        }
    }

    /// Snapshot of the collected timings.
    pub fn metrics(&self) -> Result<PerformanceMetrics> {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .map_err(|_| HitsError::Io(std::io::Error::other("metrics lock poisoned")))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock timings of run phases (setup, issue, drain, report).
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    counts: HashMap<String, u64>,
    totals: HashMap<String, Duration>,
    min: HashMap<String, Duration>,
    max: HashMap<String, Duration>,
    start_time: Instant,
}

impl PerformanceMetrics {
    /// Empty metrics.
    pub fn new() -> Self {
        Self {
            counts: HashMap::new(),
            totals: HashMap::new(),
            min: HashMap::new(),
            max: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Record one timing of `phase`.
    pub fn record_phase(&mut self, phase: &str, duration: Duration) {
        *self.counts.entry(phase.to_string()).or_insert(0) += 1;
        *self
            .totals
            .entry(phase.to_string())
            .or_insert(Duration::ZERO) += duration;

        let min = self.min.entry(phase.to_string()).or_insert(duration);
        if duration < *min {
            *min = duration;
        }

        let max = self.max.entry(phase.to_string()).or_insert(duration);
        if duration > *max {
            *max = duration;
        }
    }

    /// Number of recorded timings of `phase`.
    pub fn count(&self, phase: &str) -> u64 {
        self.counts.get(phase).copied().unwrap_or(0)
    }

    /// Sum of recorded timings of `phase`.
    pub fn total(&self, phase: &str) -> Option<Duration> {
        self.totals.get(phase).copied()
    }

    /// Mean of recorded timings of `phase`.
    pub fn average(&self, phase: &str) -> Option<Duration> {
        let count = self.count(phase);
        if count == 0 {
            return None;
        }
        self.totals
            .get(phase)
            .map(|total| total.div_f64(count as f64))
    }

    /// Shortest recorded timing of `phase`.
    pub fn min(&self, phase: &str) -> Option<Duration> {
        self.min.get(phase).copied()
    }

    /// Longest recorded timing of `phase`.
    pub fn max(&self, phase: &str) -> Option<Duration> {
        self.max.get(phase).copied()
    }

    /// Recorded phase names, sorted.
    pub fn phases(&self) -> Vec<String> {
        let mut phases: Vec<_> = self.counts.keys().cloned().collect();
        phases.sort();
        phases
    }

    /// Time since collection started.
    pub fn collection_duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Multi-line summary.
    pub fn generate_report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== hits phase timings ===\n");
        report.push_str(&format!(
            "Collection Duration: {:?}\n\n",
            self.collection_duration()
        ));

        for phase in self.phases() {
            report.push_str(&format!("Phase: {}\n", phase));
            report.push_str(&format!("  Count: {}\n", self.count(&phase)));
            if let Some(avg) = self.average(&phase) {
                report.push_str(&format!("  Average: {:?}\n", avg));
            }
            if let Some(min) = self.min(&phase) {
                report.push_str(&format!("  Min: {:?}\n", min));
            }
            if let Some(max) = self.max(&phase) {
                report.push_str(&format!("  Max: {:?}\n", max));
            }
            report.push('\n');
        }

        report
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_LOGGER: std::sync::OnceLock<Arc<Mutex<Logger>>> = std::sync::OnceLock::new();

/// Initialize the global logger with defaults, or return the existing one.
pub fn init_logger() -> Arc<Mutex<Logger>> {
    GLOBAL_LOGGER
        .get_or_init(|| Arc::new(Mutex::new(Logger::new())))
        .clone()
}

/// Initialize the global logger and apply `config` to it.
pub fn configure(config: &LoggingConfig) -> Arc<Mutex<Logger>> {
    let logger = init_logger();
    if let Ok(mut guard) = logger.lock() {
        *guard = Logger::from_config(config);
    }
    logger
}

fn with_global(f: impl FnOnce(&Logger)) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            f(&logger);
        }
    }
}

/// Log a message using the global logger.
pub fn log(level: LogLevel, component: &str, message: &str) {
    with_global(|logger| logger.log(level, component, message));
}

/// Log a transfer-scoped message using the global logger.
pub fn log_transfer(
    level: LogLevel,
    component: &str,
    index: usize,
    device: Option<DeviceId>,
    message: &str,
) {
    with_global(|logger| logger.log_transfer(level, component, index, device, message));
}

/// Record a phase timing on the global logger.
pub fn log_timing(component: &str, phase: &str, duration: Duration) {
    with_global(|logger| logger.log_timing(component, phase, duration));
}

/// Log a debug-level message using the global logger.
#[macro_export]
macro_rules! log_debug {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Debug, $component, &format!($($arg)*))
    };
}

/// Log an info-level message using the global logger.
#[macro_export]
macro_rules! log_info {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Info, $component, &format!($($arg)*))
    };
}
