//! Per-test harness and log capture.

pub mod harness;
pub mod logging;

pub use harness::{TestHarness, TestHarnessBuilder};
pub use logging::{LogEntry, LogLevel, LogSource, LoggerConfig, TestLogger, TestLoggerBuilder};
