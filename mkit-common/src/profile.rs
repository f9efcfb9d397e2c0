//! Cluster profiles: naming, lifecycle and cleanup.
//!
//! Profile names are unique for the life of the process. A [`ProfileGuard`]
//! owns one profile for the duration of a test and deletes it when the test
//! ends, including when the test returns early or panics.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::constants::NONE_DRIVER_PROFILE;
use crate::deadline::Deadline;
use crate::e2e::harness::TestHarness;
use crate::error::{HarnessError, HarnessResult};
use crate::postmortem::post_mortem_logs;
use crate::process::RunResult;

/// Time allowed for `delete` during cleanup, before scaling.
const CLEANUP_MINUTES: u64 = 2;

#[derive(Default)]
struct Registry {
    issued: HashSet<String>,
    deleted: HashSet<String>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::default()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `<prefix>-<UTC timestamp>-<pid>`.
pub fn profile_name(prefix: &str, at: DateTime<Utc>, pid: u32) -> String {
    format!("{prefix}-{}-{pid}", at.format("%Y%m%d%H%M%S"))
}

/// Reserve a name not yet issued by this process, stepping the timestamp
/// forward one second on collision.
fn reserve(prefix: &str, mut at: DateTime<Utc>, pid: u32) -> String {
    let mut registry = registry();
    loop {
        let name = profile_name(prefix, at, pid);
        if registry.issued.insert(name.clone()) {
            return name;
        }
        at += chrono::Duration::seconds(1);
    }
}

/// Pick the profile name for a test.
///
/// A forced profile wins, then the fixed `none`-driver name; otherwise the
/// name is generated from `prefix`, the current time and our pid.
pub fn unique_profile(h: &TestHarness, prefix: &str) -> String {
    let name = if let Some(forced) = &h.config().forced_profile {
        forced.clone()
    } else if h.caps().none_driver() {
        NONE_DRIVER_PROFILE.to_string()
    } else {
        reserve(prefix, Utc::now(), std::process::id())
    };
    registry().deleted.remove(&name);
    name
}

fn already_deleted(profile: &str) -> bool {
    registry().deleted.contains(profile)
}

fn mark_deleted(profile: &str) {
    registry().deleted.insert(profile.to_string());
}

/// Delete `profile` and cancel the test's deadline.
///
/// Deletion runs on its own deadline so it still happens after the test's
/// deadline expired. Failures are logged, never returned. A second call for
/// the same profile only logs.
pub async fn cleanup(h: &TestHarness, profile: &str, cancel: &Deadline) {
    if already_deleted(profile) {
        h.logger()
            .debug(format!("{profile} already cleaned up, nothing to do"));
        cancel.cancel();
        return;
    }
    if h.config().cleanup {
        h.logger()
            .info(format!("Cleaning up \"{profile}\" profile ..."));
        let fresh = Deadline::after(h.config().minutes(CLEANUP_MINUTES));
        match h.run_tool(&fresh, &["delete", "-p", profile]).await {
            Ok(_) => mark_deleted(profile),
            Err(err) => h.logger().warn(format!("failed cleanup: {err}")),
        }
    } else {
        h.logger()
            .info(format!("skipping cleanup of {profile} (--cleanup=false)"));
    }
    cancel.cancel();
}

/// Like [`cleanup`], but a failed test first gets its post-mortem.
pub async fn cleanup_with_logs(h: &TestHarness, profile: &str, cancel: &Deadline) {
    if h.failed() {
        h.logger().error(format!(
            "*** {} FAILED at {}",
            h.name(),
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC")
        ));
        post_mortem_logs(h, profile, false).await;
    }
    cleanup(h, profile, cancel).await;
}

/// Value of one status field, e.g. `Host` or `APIServer`.
///
/// `status` exits non-zero for stopped components, so stdout is used either
/// way. Errors without output yield an empty string.
pub async fn status(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    key: &str,
    node: Option<&str>,
) -> String {
    let mut args = vec![
        "status".to_string(),
        format!("--format={{{{.{key}}}}}"),
        "-p".to_string(),
        profile.to_string(),
    ];
    if let Some(node) = node {
        args.push("-n".to_string());
        args.push(node.to_string());
    }
    match h.run_tool(deadline, &args).await {
        Ok(result) => result.stdout_str().trim().to_string(),
        Err(err) => {
            h.logger().debug(format!("status error: {err} (may be ok)"));
            err.run_result()
                .map(|r| r.stdout_str().trim().to_string())
                .unwrap_or_default()
        }
    }
}

/// Where a profile is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Unborn,
    Created,
    Running,
    Stopped,
    Deleted,
}

impl ProfileState {
    pub fn can_transition_to(self, next: ProfileState) -> bool {
        use ProfileState::*;
        matches!(
            (self, next),
            (Unborn, Created)
                | (Created, Running)
                | (Running, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Stopped, Stopped)
                | (_, Deleted)
        ) && self != Deleted
    }
}

impl fmt::Display for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProfileState::Unborn => "unborn",
            ProfileState::Created => "created",
            ProfileState::Running => "running",
            ProfileState::Stopped => "stopped",
            ProfileState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Owns one profile for the duration of a test.
///
/// Call [`ProfileGuard::cleanup_with_logs`] at the end of the test. If the
/// guard is dropped without that, `Drop` runs the same teardown
/// synchronously. A guard dropped while its task panics marks the test
/// failed first, so the teardown collects the post-mortem.
pub struct ProfileGuard {
    harness: TestHarness,
    name: String,
    state: ProfileState,
    deadline: Deadline,
    finished: bool,
}

impl ProfileGuard {
    /// Mint a profile name and a deadline scoped to it.
    pub fn acquire(h: &TestHarness, prefix: &str, deadline: &Deadline) -> Self {
        let name = unique_profile(h, prefix);
        h.logger().debug(format!("using profile {name}"));
        Self {
            harness: h.clone(),
            name,
            state: ProfileState::Unborn,
            deadline: deadline.scope(),
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProfileState {
        self.state
    }

    /// Cancelled once the profile is cleaned up.
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    fn transition(&mut self, next: ProfileState) -> HarnessResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HarnessError::AssertionFailed(format!(
                "profile {} cannot go from {} to {next}",
                self.name, self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// `start -p <profile> <extra> <start args>`.
    pub async fn start(&mut self, extra: &[&str]) -> HarnessResult<RunResult> {
        if self.state == ProfileState::Unborn {
            self.transition(ProfileState::Created)?;
        }
        if self.state == ProfileState::Deleted {
            return Err(HarnessError::AssertionFailed(format!(
                "profile {} was deleted",
                self.name
            )));
        }
        let mut args = vec!["start".to_string(), "-p".to_string(), self.name.clone()];
        args.extend(extra.iter().map(|a| a.to_string()));
        args.extend(self.harness.config().start_args());
        let result = self.harness.run_tool(&self.deadline, &args).await?;
        self.transition(ProfileState::Running)?;
        Ok(result)
    }

    /// `stop -p <profile>`.
    pub async fn stop(&mut self) -> HarnessResult<RunResult> {
        let result = self
            .harness
            .run_tool(&self.deadline, &["stop", "-p", self.name.as_str()])
            .await?;
        self.transition(ProfileState::Stopped)?;
        Ok(result)
    }

    pub async fn status(&self, key: &str) -> String {
        status(&self.harness, &self.deadline, &self.name, key, None).await
    }

    pub async fn cleanup(&mut self) {
        self.finished = true;
        cleanup(&self.harness, &self.name, &self.deadline).await;
        self.settle();
    }

    pub async fn cleanup_with_logs(&mut self) {
        self.finished = true;
        cleanup_with_logs(&self.harness, &self.name, &self.deadline).await;
        self.settle();
    }

    fn settle(&mut self) {
        if already_deleted(&self.name) {
            self.state = ProfileState::Deleted;
        }
    }
}

impl fmt::Debug for ProfileGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileGuard")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for ProfileGuard {
    fn drop(&mut self) {
        if self.finished || already_deleted(&self.name) || self.state == ProfileState::Unborn {
            self.deadline.cancel();
            return;
        }
        if std::thread::panicking() {
            self.harness
                .mark_failed(&format!("panicked while holding profile {}", self.name));
        }
        self.harness
            .logger()
            .warn(format!("profile {} dropped without cleanup", self.name));

        let teardown = || run_teardown(self.harness.clone(), self.name.clone(), self.deadline.clone());
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(teardown)
            }
            _ => teardown(),
        }
        self.settle();
    }
}

/// Run [`cleanup_with_logs`] to completion from synchronous code.
///
/// The work gets a private current-thread runtime on its own OS thread, so
/// it neither re-enters the caller's runtime nor needs one to exist.
fn run_teardown(harness: TestHarness, name: String, deadline: Deadline) {
    let logger = harness.logger().clone();
    let spawned = std::thread::Builder::new()
        .name("profile-teardown".to_string())
        .spawn(move || -> std::io::Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(cleanup_with_logs(&harness, &name, &deadline));
            Ok(())
        });
    match spawned.map(|thread| thread.join()) {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => logger.warn(format!("failed cleanup: teardown runtime: {err}")),
        Ok(Err(_)) => logger.warn("failed cleanup: teardown thread panicked"),
        Err(err) => logger.warn(format!("failed cleanup: teardown thread: {err}")),
    }
}
