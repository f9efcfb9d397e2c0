#![allow(dead_code)]

pub mod fixtures;
pub mod logging;

pub use fixtures::{FakeCluster, wait_until_gone};
pub use logging::init_test_logging;
