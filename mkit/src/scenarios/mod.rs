//! Scenario clients shipped with the runner.

mod no_args;
mod start_stop;
mod version;

use crate::suite::TestCase;

/// Every registered test, in registration order.
pub fn all() -> Vec<TestCase> {
    vec![no_args::CASE, version::CASE, start_stop::CASE]
}
