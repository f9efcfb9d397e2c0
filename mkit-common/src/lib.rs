//! Shared runtime for the mkit integration suite.
//!
//! Runs the cluster tool and kubectl under hierarchical deadlines, manages
//! per-test profiles, and provides the waiting, retry and diagnostics
//! primitives every scenario is built from.

pub mod audit;
pub mod capability;
pub mod compare;
pub mod config;
pub mod constants;
pub mod deadline;
pub mod e2e;
pub mod error;
pub mod governor;
pub mod kube;
pub mod postmortem;
pub mod process;
pub mod profile;
pub mod retry;
pub mod util;

pub use capability::{Arch, CapabilitySet, ContainerRuntime, DriverFamily, HostOs};
pub use config::{HostEnv, InvocationConfig, InvocationConfigBuilder};
pub use deadline::Deadline;
pub use e2e::{TestHarness, TestHarnessBuilder, TestLogger};
pub use error::{HarnessError, HarnessResult};
pub use governor::{Decision, Governor};
pub use kube::{PodWaitOptions, kubectl_json, pod_wait, pod_wait_with, pvc_wait, volume_snapshot_wait};
pub use postmortem::post_mortem_logs;
pub use process::{RunResult, StreamingSession, json_run, read_line_with_timeout, run};
pub use profile::{ProfileGuard, ProfileState, cleanup, cleanup_with_logs, status, unique_profile};
pub use retry::{ExpoBackoff, RetryError, RetryExt, retry_expo};
