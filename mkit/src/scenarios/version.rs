use mkit_common::e2e::TestHarness;
use mkit_common::error::{HarnessError, HarnessResult};
use regex::Regex;

use crate::suite::{TestCase, TestFuture, subtest};

pub const CASE: TestCase = TestCase::new("TestVersion", true, start);

const SEMVER: &str = r"^v?\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$";

fn start(h: TestHarness) -> TestFuture {
    Box::pin(run(h))
}

async fn run(h: TestHarness) -> HarnessResult<()> {
    let semver = Regex::new(SEMVER).map_err(|e| HarnessError::Config(format!("semver pattern: {e}")))?;
    let deadline = h.deadline_minutes(1);
    let deadline = &deadline;

    subtest(&h, "short", |s| async move {
        let result = s.run_tool(deadline, &["version", "--short"]).await?;
        let version = result.stdout_str().trim().to_string();
        s.assert(
            semver.is_match(&version),
            &format!("version --short printed {version:?}, want a semantic version"),
        )
    })
    .await?;

    subtest(&h, "full", |s| async move {
        let result = s.run_tool(deadline, &["version"]).await?;
        s.assert_stdout_contains(&result, "version: v", "version")?;
        s.assert_stdout_contains(&result, "commit:", "version")
    })
    .await
}
