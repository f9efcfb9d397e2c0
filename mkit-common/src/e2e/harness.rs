//! Per-test harness handle.
//!
//! Every test receives a [`TestHarness`]. It carries the shared invocation
//! config and capabilities, the test's logger and failure state, and wraps
//! the process runner so every command is logged against the right test.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::logging::{LogLevel, LogSource, TestLogger, TestLoggerBuilder};
use crate::capability::CapabilitySet;
use crate::config::InvocationConfig;
use crate::deadline::Deadline;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, RunResult, StreamingSession};
use crate::util::indent_lines;

/// Handle passed to every test and subtest
#[derive(Debug, Clone)]
pub struct TestHarness {
    name: Arc<String>,
    config: Arc<InvocationConfig>,
    caps: Arc<CapabilitySet>,
    logger: TestLogger,
    failed: Arc<AtomicBool>,
    /// Failure flags of enclosing tests, marked along with ours.
    ancestors: Vec<Arc<AtomicBool>>,
    env: Vec<(String, String)>,
}

impl TestHarness {
    pub fn new(test_name: &str, config: Arc<InvocationConfig>) -> Self {
        TestHarnessBuilder::new(test_name, config).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InvocationConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<InvocationConfig> {
        Arc::clone(&self.config)
    }

    pub fn caps(&self) -> &CapabilitySet {
        &self.caps
    }

    pub fn logger(&self) -> &TestLogger {
        &self.logger
    }

    /// Root deadline of `base_minutes`, scaled by the timeout multiplier.
    pub fn deadline_minutes(&self, base_minutes: u64) -> Deadline {
        Deadline::after(self.config.minutes(base_minutes))
    }

    /// A serial subtest sharing this test's logger; its failure fails us too.
    pub fn subtest(&self, name: &str) -> TestHarness {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.failed));
        TestHarness {
            name: Arc::new(format!("{}/{name}", self.name)),
            config: Arc::clone(&self.config),
            caps: Arc::clone(&self.caps),
            logger: self.logger.clone(),
            failed: Arc::new(AtomicBool::new(false)),
            ancestors,
            env: self.env.clone(),
        }
    }

    /// A copy whose commands run with `key=value` added to their environment.
    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> TestHarness {
        let key = key.into();
        let mut next = self.clone();
        next.env.retain(|(k, _)| *k != key);
        next.env.push((key, value.into()));
        next
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    // ----- command execution -----

    /// Argv for the tool binary followed by `args`.
    pub fn tool_argv<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.config.binary.to_string_lossy().into_owned());
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// Argv for kubectl against `profile`'s context.
    pub fn kubectl_argv<S: AsRef<str>>(&self, profile: &str, args: &[S]) -> Vec<String> {
        let mut argv = vec![
            self.config.kubectl.to_string_lossy().into_owned(),
            "--context".to_string(),
            profile.to_string(),
        ];
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    pub async fn run(&self, deadline: &Deadline, argv: &[String]) -> HarnessResult<RunResult> {
        process::run(&self.logger, deadline, argv, &self.env).await
    }

    pub async fn run_tool<S: AsRef<str>>(
        &self,
        deadline: &Deadline,
        args: &[S],
    ) -> HarnessResult<RunResult> {
        self.run(deadline, &self.tool_argv(args)).await
    }

    pub async fn run_kubectl<S: AsRef<str>>(
        &self,
        deadline: &Deadline,
        profile: &str,
        args: &[S],
    ) -> HarnessResult<RunResult> {
        self.run(deadline, &self.kubectl_argv(profile, args)).await
    }

    pub async fn json_run<T: DeserializeOwned>(
        &self,
        deadline: &Deadline,
        argv: &[String],
    ) -> HarnessResult<T> {
        process::json_run(&self.logger, deadline, argv, &self.env).await
    }

    pub async fn start(
        &self,
        deadline: &Deadline,
        argv: &[String],
    ) -> HarnessResult<StreamingSession> {
        process::start(&self.logger, deadline, argv, &self.env).await
    }

    /// Stop a streaming session; on a failed test, log what it left in its pipes.
    pub async fn stop_session(&self, session: &mut StreamingSession) {
        session.stop().await;
        if !self.failed() {
            return;
        }
        let (stdout, stderr) = session.drain_remaining(Duration::from_secs(1)).await;
        let pid = session.pid();
        let name = session.command();
        if !stdout.is_empty() {
            self.logger.log(
                LogLevel::Info,
                LogSource::ProcessStdout { name: name.clone(), pid },
                format!("(dbg) {name} stdout:\n{}", indent_lines(&String::from_utf8_lossy(&stdout), "\t")),
            );
        }
        if !stderr.is_empty() {
            self.logger.log(
                LogLevel::Warn,
                LogSource::ProcessStderr { name: name.clone(), pid },
                format!("(dbg) {name} stderr:\n{}", indent_lines(&String::from_utf8_lossy(&stderr), "\t")),
            );
        }
    }

    // ----- outcome -----

    /// Mark the test (and its ancestors) as failed with a reason
    pub fn mark_failed(&self, reason: &str) {
        self.failed.store(true, Ordering::SeqCst);
        for ancestor in &self.ancestors {
            ancestor.store(true, Ordering::SeqCst);
        }
        self.logger
            .error(format!("{} FAILED: {reason}", self.name));
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Build a skip outcome.
    pub fn skip(&self, reason: impl Into<String>) -> HarnessError {
        let reason = reason.into();
        self.logger.info(format!("skipping {}: {reason}", self.name));
        HarnessError::Skipped(reason)
    }

    /// Record `err` as this test's failure unless it is a skip, and pass it on.
    pub fn fail_with(&self, err: HarnessError) -> HarnessError {
        if !err.is_skip() {
            self.mark_failed(&err.to_string());
        }
        err
    }

    // ----- assertions -----

    /// Assert that a condition is true
    pub fn assert(&self, condition: bool, message: &str) -> HarnessResult<()> {
        if condition {
            self.logger.debug(format!("Assertion passed: {message}"));
            Ok(())
        } else {
            Err(self.fail_with(HarnessError::AssertionFailed(message.to_string())))
        }
    }

    /// Assert that two values are equal
    pub fn assert_eq<T: PartialEq + std::fmt::Debug>(
        &self,
        actual: T,
        expected: T,
        message: &str,
    ) -> HarnessResult<()> {
        if actual == expected {
            self.logger.debug(format!("Assertion passed: {message}"));
            Ok(())
        } else {
            Err(self.fail_with(HarnessError::AssertionFailed(format!(
                "{message}: expected {expected:?}, got {actual:?}"
            ))))
        }
    }

    /// Assert that a run exited 0
    pub fn assert_success(&self, result: &RunResult, context: &str) -> HarnessResult<()> {
        if result.success() {
            self.logger.debug(format!("Command succeeded: {context}"));
            Ok(())
        } else {
            Err(self.fail_with(HarnessError::AssertionFailed(format!(
                "{context}: {} exited {}\n{}",
                result.command(),
                result.exit_code,
                result.output()
            ))))
        }
    }

    /// Assert that a run's stdout contains `pattern`
    pub fn assert_stdout_contains(
        &self,
        result: &RunResult,
        pattern: &str,
        context: &str,
    ) -> HarnessResult<()> {
        if result.stdout_contains(pattern) {
            self.logger
                .debug(format!("Stdout contains expected pattern: {context} -> {pattern}"));
            Ok(())
        } else {
            Err(self.fail_with(HarnessError::AssertionFailed(format!(
                "{context}: expected {} stdout to contain {pattern:?}, got:\n{}",
                result.command(),
                result.stdout_str().trim()
            ))))
        }
    }
}

/// Builder for creating a TestHarness with custom configuration
pub struct TestHarnessBuilder {
    test_name: String,
    config: Arc<InvocationConfig>,
    caps: Option<CapabilitySet>,
    logger: Option<TestLogger>,
}

impl TestHarnessBuilder {
    pub fn new(test_name: &str, config: Arc<InvocationConfig>) -> Self {
        Self {
            test_name: test_name.to_string(),
            config,
            caps: None,
            logger: None,
        }
    }

    /// Override detected capabilities.
    pub fn caps(mut self, caps: CapabilitySet) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn logger(mut self, logger: TestLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> TestHarness {
        let caps = self
            .caps
            .unwrap_or_else(|| CapabilitySet::detect(&self.config));
        let logger = self
            .logger
            .unwrap_or_else(|| TestLoggerBuilder::new(&self.test_name).build());
        TestHarness {
            name: Arc::new(self.test_name),
            config: self.config,
            caps: Arc::new(caps),
            logger,
            failed: Arc::new(AtomicBool::new(false)),
            ancestors: Vec::new(),
            env: Vec::new(),
        }
    }
}
