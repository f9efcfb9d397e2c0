//! Test registry and runner.
//!
//! Serial tests run first, one at a time. Parallel tests then run
//! concurrently, each holding a governor permit for its whole duration.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mkit_common::capability::CapabilitySet;
use mkit_common::config::InvocationConfig;
use mkit_common::e2e::{TestHarness, TestHarnessBuilder, TestLoggerBuilder};
use mkit_common::error::{HarnessError, HarnessResult};
use mkit_common::governor::Governor;
use mkit_common::util::indent_lines;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub type TestFuture = Pin<Box<dyn Future<Output = HarnessResult<()>> + Send>>;

/// One top-level test.
#[derive(Clone, Copy)]
pub struct TestCase {
    pub name: &'static str,
    pub parallel: bool,
    pub run: fn(TestHarness) -> TestFuture,
}

impl TestCase {
    pub const fn new(name: &'static str, parallel: bool, run: fn(TestHarness) -> TestFuture) -> Self {
        Self { name, parallel, run }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

impl TestReport {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

/// Run a serial subtest of `h`.
///
/// A failing subtest fails its parent and returns `Err` so the caller can
/// stop with `?`. A skipped subtest returns `Ok`.
pub async fn subtest<F, Fut>(h: &TestHarness, name: &str, f: F) -> HarnessResult<()>
where
    F: FnOnce(TestHarness) -> Fut,
    Fut: Future<Output = HarnessResult<()>>,
{
    let sub = h.subtest(name);
    let started = Instant::now();
    h.logger().info(format!("=== RUN   {}", sub.name()));
    let result = f(sub.clone()).await;
    let took = format_secs(started.elapsed());
    match result {
        Ok(()) if !sub.failed() => {
            h.logger().info(format!("--- PASS: {} ({took})", sub.name()));
            Ok(())
        }
        Ok(()) => {
            h.logger().error(format!("--- FAIL: {} ({took})", sub.name()));
            Err(HarnessError::AssertionFailed(format!("{} failed", sub.name())))
        }
        Err(err) if err.is_skip() => {
            h.logger().info(format!("--- SKIP: {} ({took})", sub.name()));
            Ok(())
        }
        Err(err) => {
            if !sub.failed() {
                sub.mark_failed(&err.to_string());
            }
            h.logger().error(format!("--- FAIL: {} ({took})", sub.name()));
            Err(err)
        }
    }
}

fn format_secs(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

pub struct Suite {
    config: Arc<InvocationConfig>,
    caps: CapabilitySet,
    governor: Governor,
    log_dir: Option<PathBuf>,
    verbose: bool,
}

impl Suite {
    pub fn new(config: Arc<InvocationConfig>, governor: Governor) -> Self {
        let caps = CapabilitySet::detect(&config);
        Self {
            config,
            caps,
            governor,
            log_dir: None,
            verbose: false,
        }
    }

    /// Write each test's JSONL log under `dir`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Echo every log entry as it is recorded instead of only on failure.
    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    fn harness(&self, name: &str) -> TestHarness {
        let mut logger = TestLoggerBuilder::new(name).print_realtime(self.verbose);
        if let Some(dir) = &self.log_dir {
            logger = logger.log_dir(dir);
        }
        TestHarnessBuilder::new(name, Arc::clone(&self.config))
            .caps(self.caps.clone())
            .logger(logger.build())
            .build()
    }

    /// Run every case and report in completion order.
    pub async fn run(&self, cases: &[TestCase]) -> Vec<TestReport> {
        // The none driver hosts exactly one cluster, so nothing runs alongside.
        let allow_parallel = !self.caps.none_driver();
        let (parallel, serial): (Vec<TestCase>, Vec<TestCase>) = cases
            .iter()
            .copied()
            .partition(|c| c.parallel && allow_parallel);

        let mut reports = Vec::with_capacity(cases.len());
        for case in serial {
            let permit = self.governor.acquire().await;
            reports.push(run_case(self.harness(case.name), case).await);
            drop(permit);
        }

        let mut set = JoinSet::new();
        for case in parallel {
            let governor = self.governor.clone();
            let h = self.harness(case.name);
            set.spawn(async move {
                let _permit = governor.acquire().await;
                run_case(h, case).await
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => warn!(error = %err, "test task did not complete"),
            }
        }
        reports
    }
}

/// Run one case on its own task so a panic becomes a failure.
async fn run_case(h: TestHarness, case: TestCase) -> TestReport {
    println!("=== RUN   {}", case.name);
    let started = Instant::now();
    let task = tokio::spawn((case.run)(h.clone()));
    let outcome = match task.await {
        Ok(Ok(())) if !h.failed() => Outcome::Passed,
        Ok(Ok(())) => Outcome::Failed("a subtest failed".to_string()),
        Ok(Err(HarnessError::Skipped(reason))) => Outcome::Skipped(reason),
        Ok(Err(err)) => {
            if !h.failed() {
                h.mark_failed(&err.to_string());
            }
            Outcome::Failed(err.to_string())
        }
        Err(join) => {
            h.mark_failed(&format!("panicked: {join}"));
            Outcome::Failed(format!("panicked: {join}"))
        }
    };
    let duration = started.elapsed();
    debug!(test = case.name, ?outcome, "test finished");

    let took = format_secs(duration);
    match &outcome {
        Outcome::Passed => println!("--- PASS: {} ({took})", case.name),
        Outcome::Skipped(reason) => {
            println!("--- SKIP: {} ({took})", case.name);
            println!("    {reason}");
        }
        Outcome::Failed(_) => {
            println!("--- FAIL: {} ({took})", case.name);
            println!("{}", indent_lines(&h.logger().render(), "    "));
            if let Some(path) = h.logger().log_path() {
                println!("    log: {}", path.display());
            }
        }
    }
    TestReport {
        name: case.name.to_string(),
        outcome,
        duration,
    }
}

/// Print the closing summary; true when nothing failed.
pub fn summarize(reports: &[TestReport], elapsed: Duration) -> bool {
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| r.failed())
        .map(|r| r.name.as_str())
        .collect();
    let skipped = reports
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Skipped(_)))
        .count();
    let passed = reports.len() - failed.len() - skipped;
    let took = format_secs(elapsed);
    if failed.is_empty() {
        println!("PASS ({passed} passed, {skipped} skipped, {took})");
        true
    } else {
        println!(
            "FAIL ({passed} passed, {} failed, {skipped} skipped, {took}): {}",
            failed.len(),
            failed.join(" ")
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mkit_common::e2e::TestLogger;
    use mkit_common::governor::Decision;

    fn config() -> Arc<InvocationConfig> {
        Arc::new(InvocationConfig::builder().binary("sh").build().unwrap())
    }

    fn harness(name: &str) -> TestHarness {
        TestHarnessBuilder::new(name, config())
            .logger(TestLogger::in_memory(name))
            .build()
    }

    fn passing(_: TestHarness) -> TestFuture {
        Box::pin(async { Ok(()) })
    }

    fn skipping(h: TestHarness) -> TestFuture {
        Box::pin(async move { Err(h.skip("not on this driver")) })
    }

    fn failing(h: TestHarness) -> TestFuture {
        Box::pin(async move { h.assert_eq(1, 2, "math") })
    }

    fn panicking(_: TestHarness) -> TestFuture {
        Box::pin(async { panic!("boom") })
    }

    #[tokio::test]
    async fn test_subtests_short_circuit() {
        let h = harness("TestSerial");
        let mut ran = Vec::new();

        let result: HarnessResult<()> = async {
            subtest(&h, "first", |_| async { Ok(()) }).await?;
            ran.push("first");
            subtest(&h, "skipped", |s| async move { Err(s.skip("n/a")) }).await?;
            ran.push("skipped");
            subtest(&h, "second", |s| async move { s.assert(false, "broken") }).await?;
            ran.push("second");
            subtest(&h, "third", |_| async { Ok(()) }).await?;
            ran.push("third");
            Ok(())
        }
        .await;

        assert!(result.is_err());
        assert_eq!(ran, vec!["first", "skipped"]);
        assert!(h.failed());
        assert_eq!(h.logger().search("--- FAIL: TestSerial/second").len(), 1);
        assert_eq!(h.logger().search("--- SKIP: TestSerial/skipped").len(), 1);
    }

    #[tokio::test]
    async fn test_outcomes() {
        let governor = Governor::with_decision(Decision::Respected { requested: 2 });
        let suite = Suite::new(config(), governor);
        let cases = [
            TestCase::new("TestPass", true, passing),
            TestCase::new("TestSkip", true, skipping),
            TestCase::new("TestFail", false, failing),
            TestCase::new("TestPanic", true, panicking),
        ];

        let mut reports = suite.run(&cases).await;
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        let outcome = |name: &str| {
            reports
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.outcome.clone())
                .unwrap()
        };

        assert_eq!(reports.len(), 4);
        assert_eq!(outcome("TestPass"), Outcome::Passed);
        assert_eq!(outcome("TestSkip"), Outcome::Skipped("not on this driver".to_string()));
        assert!(matches!(outcome("TestFail"), Outcome::Failed(_)));
        assert!(matches!(outcome("TestPanic"), Outcome::Failed(ref m) if m.starts_with("panicked")));
        assert!(!summarize(&reports, Duration::from_secs(1)));
    }
}
