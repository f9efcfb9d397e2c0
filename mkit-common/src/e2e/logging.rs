//! Per-test log capture.
//!
//! - In-memory entries replayed when a test fails
//! - Optional real-time echo to stdout (`mkit -v`)
//! - Per-test JSONL log files under `target/test-logs/` (machine-readable)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Overrides the auto-detected log directory.
pub const LOG_DIR_ENV: &str = "MKIT_TEST_LOG_DIR";

/// Entries kept in memory per test; the oldest are dropped first.
const MAX_ENTRIES: usize = 10_000;

/// Find the workspace root by walking up from a path until we find a Cargo.toml
/// that contains `[workspace]`.
fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut candidate = start.to_path_buf();
    if candidate.is_file() {
        candidate = candidate.parent()?.to_path_buf();
    }

    loop {
        let cargo_toml = candidate.join("Cargo.toml");
        if let Ok(contents) = fs::read_to_string(&cargo_toml)
            && contents.contains("[workspace]")
        {
            return Some(candidate);
        }
        match candidate.parent() {
            Some(parent) if parent != candidate => candidate = parent.to_path_buf(),
            _ => break,
        }
    }

    start.parent().map(|p| p.to_path_buf())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Source of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// The harness itself
    Harness,
    /// Stdout of a streaming child
    ProcessStdout { name: String, pid: u32 },
    /// Stderr of a streaming child
    ProcessStderr { name: String, pid: u32 },
    /// Output of the tool under test, e.g. post-mortem logs
    Tool,
    /// Cluster observations made through kubectl
    Kubectl,
    /// Driver-native inspection (docker, podman)
    Driver,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Harness => write!(f, "harness"),
            LogSource::ProcessStdout { name, pid } => write!(f, "{name}:{pid}:stdout"),
            LogSource::ProcessStderr { name, pid } => write!(f, "{name}:{pid}:stderr"),
            LogSource::Tool => write!(f, "tool"),
            LogSource::Kubectl => write!(f, "kubectl"),
            LogSource::Driver => write!(f, "driver"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since test start
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>6}ms] [{:<5}] [{}] {}",
            self.elapsed_ms, self.level, self.source, self.message
        )
    }
}

/// Configuration for the test logger
#[derive(Debug, Clone, Default)]
pub struct LoggerConfig {
    /// Whether to print entries to stdout as they happen
    pub print_realtime: bool,
    /// Directory for persisting logs
    pub log_dir: Option<PathBuf>,
}

/// Thread-safe logger owned by one test and shared with its subtests.
#[derive(Clone)]
pub struct TestLogger {
    config: Arc<LoggerConfig>,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    start_time: Instant,
    test_name: Arc<String>,
    file_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    log_path: Arc<Option<PathBuf>>,
    artifact_root: Arc<Option<PathBuf>>,
}

impl fmt::Debug for TestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLogger")
            .field("test_name", &self.test_name)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

impl TestLogger {
    /// Create a new test logger with the given configuration
    pub fn new(test_name: &str, config: LoggerConfig) -> Self {
        let mut file_writer = None;
        let mut log_path = None;
        let mut artifact_root = None;

        if let Some(ref dir) = config.log_dir
            && fs::create_dir_all(dir).is_ok()
        {
            let sanitized = sanitize_component(test_name);
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");

            let path = dir.join(format!("{sanitized}_{timestamp}.jsonl"));
            match File::create(&path) {
                Ok(file) => {
                    file_writer = Some(BufWriter::new(file));
                    log_path = Some(path);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to create test log file");
                }
            }

            let artifacts_dir = dir.join("artifacts").join(&sanitized);
            if fs::create_dir_all(&artifacts_dir).is_ok() {
                artifact_root = Some(artifacts_dir);
            }
        }

        Self {
            config: Arc::new(config),
            entries: Arc::new(Mutex::new(VecDeque::new())),
            start_time: Instant::now(),
            test_name: Arc::new(test_name.to_string()),
            file_writer: Arc::new(Mutex::new(file_writer)),
            log_path: Arc::new(log_path),
            artifact_root: Arc::new(artifact_root),
        }
    }

    /// Create a logger that only keeps entries in memory
    pub fn in_memory(test_name: &str) -> Self {
        Self::new(test_name, LoggerConfig::default())
    }

    /// Path of the JSONL file, when file logging is enabled.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Log an entry with the given level and source
    pub fn log(&self, level: LogLevel, source: LogSource, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            elapsed_ms: u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            level,
            source,
            message: message.into(),
        };

        if self.config.print_realtime {
            println!("{}: {entry}", self.test_name);
        }

        let mut writer = lock(&self.file_writer);
        if let Some(w) = writer.as_mut()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(w, "{json}");
            let _ = w.flush();
        }
        drop(writer);

        let mut entries = lock(&self.entries);
        entries.push_back(entry);
        if entries.len() > MAX_ENTRIES {
            entries.pop_front();
        }
    }

    /// Persist a text artifact next to the JSONL log.
    pub fn capture_artifact_text(&self, name: &str, content: &str) -> std::io::Result<PathBuf> {
        let Some(root) = self.artifact_root.as_deref() else {
            return Err(std::io::Error::other(
                "artifact capture requires logger log_dir to be configured",
            ));
        };
        let path = root.join(format!("{}.txt", sanitize_component(name)));
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, LogSource::Harness, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, LogSource::Harness, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, LogSource::Harness, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, LogSource::Harness, message);
    }

    /// Log a line read from a streaming child's stdout
    pub fn log_stdout(&self, process_name: &str, pid: u32, message: impl Into<String>) {
        self.log(
            LogLevel::Debug,
            LogSource::ProcessStdout {
                name: process_name.to_string(),
                pid,
            },
            message,
        );
    }

    /// Get all log entries
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    /// Search entries by message content
    pub fn search(&self, pattern: &str) -> Vec<LogEntry> {
        let pattern_lower = pattern.to_lowercase();
        lock(&self.entries)
            .iter()
            .filter(|e| e.message.to_lowercase().contains(&pattern_lower))
            .cloned()
            .collect()
    }

    /// Render every captured entry, one per line.
    pub fn render(&self) -> String {
        lock(&self.entries)
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

/// Builder for creating a TestLogger with custom configuration
pub struct TestLoggerBuilder {
    test_name: String,
    config: LoggerConfig,
}

impl TestLoggerBuilder {
    /// Create a new builder for the given test name.
    ///
    /// Logs go to `$MKIT_TEST_LOG_DIR` when set, otherwise to
    /// `target/test-logs/` under the workspace root when one can be found.
    pub fn new(test_name: &str) -> Self {
        let config = LoggerConfig {
            log_dir: Self::auto_detect_log_dir(),
            ..Default::default()
        };
        Self {
            test_name: test_name.to_string(),
            config,
        }
    }

    fn auto_detect_log_dir() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(LOG_DIR_ENV)
            && !dir.is_empty()
        {
            return Some(PathBuf::from(dir));
        }
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let workspace_root = find_workspace_root(Path::new(&manifest_dir))?;
            return Some(workspace_root.join("target").join("test-logs"));
        }
        let cwd = std::env::current_dir().ok()?;
        cwd.join("target")
            .exists()
            .then(|| cwd.join("target").join("test-logs"))
    }

    pub fn print_realtime(mut self, enabled: bool) -> Self {
        self.config.print_realtime = enabled;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    /// Keep entries in memory only.
    pub fn no_log_dir(mut self) -> Self {
        self.config.log_dir = None;
        self
    }

    pub fn build(self) -> TestLogger {
        TestLogger::new(&self.test_name, self.config)
    }
}
