//! Invocation configuration.
//!
//! Built once from command-line flags at process start and shared read-only
//! (behind an `Arc`) by every test.

pub mod env;

pub use env::{EnvError, HostEnv, parse_bool};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Default location of the binary under test, relative to the suite's
/// working directory.
pub const DEFAULT_BINARY: &str = "../../out/minikube";

/// Process-wide settings for one suite run.
#[derive(Debug, Clone)]
pub struct InvocationConfig {
    /// Path to the tool binary under test
    pub binary: PathBuf,
    /// Free-form tokens appended to every `start` invocation
    pub start_args: String,
    /// Root directory of fixture files
    pub testdata_dir: PathBuf,
    /// Fixed profile name replacing generated ones
    pub forced_profile: Option<String>,
    /// Whether profiles are deleted when a test finishes
    pub cleanup: bool,
    /// Whether failed tests dump the tool's logs
    pub postmortem_logs: bool,
    /// Scales every test deadline
    pub timeout_multiplier: f64,
    /// Opt into the slow gvisor subset
    pub gvisor: bool,
    /// kubectl used for all cluster observation
    pub kubectl: PathBuf,
    /// Environment snapshot taken at startup
    pub host: HostEnv,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            start_args: String::new(),
            testdata_dir: PathBuf::from("testdata"),
            forced_profile: None,
            cleanup: true,
            postmortem_logs: true,
            timeout_multiplier: 1.0,
            gvisor: false,
            kubectl: PathBuf::from("kubectl"),
            host: HostEnv::default(),
        }
    }
}

impl InvocationConfig {
    pub fn builder() -> InvocationConfigBuilder {
        InvocationConfigBuilder::default()
    }

    /// Start arguments split on whitespace, empty tokens dropped.
    pub fn start_args(&self) -> Vec<String> {
        self.start_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Apply the timeout multiplier to a base duration.
    pub fn scaled(&self, base: Duration) -> Duration {
        Duration::try_from_secs_f64(base.as_secs_f64() * self.timeout_multiplier).unwrap_or(base)
    }

    pub fn minutes(&self, n: u64) -> Duration {
        self.scaled(Duration::from_secs(n * 60))
    }

    pub fn seconds(&self, n: u64) -> Duration {
        self.scaled(Duration::from_secs(n))
    }

    /// Reject values that would make every deadline meaningless.
    pub fn validate(&self) -> HarnessResult<()> {
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier < 0.0 {
            return Err(HarnessError::Config(format!(
                "timeout multiplier must be a finite number >= 0, got {}",
                self.timeout_multiplier
            )));
        }
        if let Some(profile) = &self.forced_profile
            && profile.trim().is_empty()
        {
            return Err(HarnessError::Config(
                "forced profile name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Locate the tool binary, either as a path or on PATH.
    pub fn resolve_binary(&self) -> HarnessResult<PathBuf> {
        resolve_program(&self.binary)
    }

    pub fn resolve_kubectl(&self) -> HarnessResult<PathBuf> {
        resolve_program(&self.kubectl)
    }
}

fn resolve_program(program: &Path) -> HarnessResult<PathBuf> {
    if program.components().count() > 1 {
        return if program.is_file() {
            Ok(program.to_path_buf())
        } else {
            Err(HarnessError::Config(format!(
                "{} does not exist",
                program.display()
            )))
        };
    }
    which::which(program)
        .map_err(|e| HarnessError::Config(format!("{} not found: {e}", program.display())))
}

/// Builder for [`InvocationConfig`]
#[derive(Debug, Default)]
pub struct InvocationConfigBuilder {
    config: InvocationConfig,
}

impl InvocationConfigBuilder {
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary = path.into();
        self
    }

    pub fn start_args(mut self, args: impl Into<String>) -> Self {
        self.config.start_args = args.into();
        self
    }

    pub fn testdata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.testdata_dir = dir.into();
        self
    }

    pub fn forced_profile(mut self, profile: impl Into<String>) -> Self {
        self.config.forced_profile = Some(profile.into());
        self
    }

    pub fn cleanup(mut self, enabled: bool) -> Self {
        self.config.cleanup = enabled;
        self
    }

    pub fn postmortem_logs(mut self, enabled: bool) -> Self {
        self.config.postmortem_logs = enabled;
        self
    }

    pub fn timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.config.timeout_multiplier = multiplier;
        self
    }

    pub fn gvisor(mut self, enabled: bool) -> Self {
        self.config.gvisor = enabled;
        self
    }

    pub fn kubectl(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kubectl = path.into();
        self
    }

    pub fn host(mut self, host: HostEnv) -> Self {
        self.config.host = host;
        self
    }

    pub fn build(self) -> HarnessResult<InvocationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
