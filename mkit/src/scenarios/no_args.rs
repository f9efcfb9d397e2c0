use mkit_common::e2e::TestHarness;
use mkit_common::error::HarnessResult;

use crate::suite::{TestCase, TestFuture};

pub const CASE: TestCase = TestCase::new("TestMainNoArgs", true, start);

fn start(h: TestHarness) -> TestFuture {
    Box::pin(run(h))
}

/// The tool with no arguments prints usage and exits 0.
async fn run(h: TestHarness) -> HarnessResult<()> {
    let deadline = h.deadline_minutes(1);
    let result = h.run_tool::<&str>(&deadline, &[]).await?;
    h.assert_success(&result, "running with no args")
}
