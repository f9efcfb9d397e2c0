//! Command-line flags.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use mkit_common::config::{DEFAULT_BINARY, HostEnv, InvocationConfig};
use mkit_common::e2e::logging::LOG_DIR_ENV;
use mkit_common::error::HarnessResult;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "mkit")]
#[command(author, version, about = "mkit - parallel e2e runner for a local-Kubernetes launcher")]
pub struct Cli {
    /// Path to the binary under test
    #[arg(long, env = "MKIT_BINARY", default_value = DEFAULT_BINARY)]
    pub binary: PathBuf,

    /// Arguments appended to every start invocation
    #[arg(long = "minikube-start-args", default_value = "", allow_hyphen_values = true)]
    pub start_args: String,

    /// Root directory of fixture files
    #[arg(long = "testdata-dir", default_value = "testdata")]
    pub testdata_dir: PathBuf,

    /// Use this profile name for every test instead of generated ones
    #[arg(long)]
    pub profile: Option<String>,

    /// Delete profiles when tests finish
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub cleanup: bool,

    /// Dump logs and pod state for failed tests
    #[arg(long = "postmortem-logs", default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub postmortem_logs: bool,

    /// Scale every test deadline
    #[arg(long = "timeout-multiplier", default_value_t = 1.0)]
    pub timeout_multiplier: f64,

    /// Include the slow gvisor scenarios
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub gvisor: bool,

    /// kubectl used for cluster observation
    #[arg(long, default_value = "kubectl")]
    pub kubectl: PathBuf,

    /// Number of tests run at once (default: cores / 1.75)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Only run tests whose name matches this regex
    #[arg(long, value_parser = Regex::new)]
    pub run: Option<Regex>,

    /// List test names and exit
    #[arg(long)]
    pub list: bool,

    /// Format of process diagnostics on stderr
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Directory for per-test JSONL logs
    #[arg(long = "log-dir", env = LOG_DIR_ENV)]
    pub log_dir: Option<PathBuf>,

    /// Also write process diagnostics to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Build the shared invocation config from the parsed flags.
    pub fn invocation_config(&self) -> HarnessResult<InvocationConfig> {
        let mut builder = InvocationConfig::builder()
            .binary(&self.binary)
            .start_args(self.start_args.clone())
            .testdata_dir(&self.testdata_dir)
            .cleanup(self.cleanup)
            .postmortem_logs(self.postmortem_logs)
            .timeout_multiplier(self.timeout_multiplier)
            .gvisor(self.gvisor)
            .kubectl(&self.kubectl)
            .host(HostEnv::capture());
        if let Some(profile) = &self.profile {
            builder = builder.forced_profile(profile.clone());
        }
        builder.build()
    }

    pub fn selects(&self, name: &str) -> bool {
        self.run.as_ref().is_none_or(|re| re.is_match(name))
    }
}
