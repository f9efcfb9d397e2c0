//! A fake cluster tool and kubectl backed by shell scripts.
//!
//! State lives in files next to the scripts so tests can steer behavior
//! (pod readiness, PVC phase, flaky API) and inspect the calls made.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mkit_common::capability::{Arch, CapabilitySet, HostOs};
use mkit_common::config::{HostEnv, InvocationConfig, InvocationConfigBuilder};
use mkit_common::e2e::{TestHarness, TestHarnessBuilder, TestLogger};
use tempfile::TempDir;

const FAKE_TOOL: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/tool.calls"
if [ -n "$MKIT_FAKE_TAG" ]; then echo "$1 $MKIT_FAKE_TAG" >> "$dir/env.tags"; fi
case "$1" in
  version)
    echo "minikube version: v1.33.0"
    echo "commit: 5883c09216182566a63dff4c326a6fc9ed2982ff"
    ;;
  start)
    echo Running > "$dir/host"
    echo "Done! kubectl is now configured to use the cluster"
    ;;
  stop)
    echo Stopped > "$dir/host"
    echo "1 node stopped."
    ;;
  delete)
    rm -f "$dir/host"
    echo "Removed all traces"
    ;;
  status)
    st="$(cat "$dir/host" 2>/dev/null || echo Nonexistent)"
    echo "$st"
    [ "$st" = Running ] || exit 7
    ;;
  -p)
    echo "==> Audit <=="
    echo "| start | -p $2 |"
    ;;
  partial)
    echo $$ > "$dir/partial.pid"
    echo "partial output"
    echo "partial error" >&2
    sleep 60 &
    echo $! > "$dir/sleeper.pid"
    wait
    ;;
  flood)
    head -c 16777216 /dev/zero | tr '\000' 'x'
    ;;
  fail)
    echo "X Exiting due to GUEST_START" >&2
    exit 80
    ;;
  dashboard)
    echo "Verifying dashboard health ..."
    sleep 0.2
    echo "http://127.0.0.1:41235/api/v1/namespaces/kubernetes-dashboard/services/http:kubernetes-dashboard:/proxy/"
    sleep 60
    ;;
  *)
    echo "unknown command: $1" >&2
    exit 64
    ;;
esac
"#;

const FAKE_KUBECTL: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
n=$(($(cat "$dir/kubectl.count" 2>/dev/null || echo 0) + 1))
echo "$n" > "$dir/kubectl.count"
echo "$*" >> "$dir/kubectl.calls"
case "$*" in
  *"get po -l"*)
    if [ -f "$dir/flaky" ] && [ "$n" -eq 1 ]; then
      echo "The connection to the server localhost:8443 was refused" >&2
      exit 1
    fi
    if [ -f "$dir/no_pods" ]; then
      echo '{"kind":"List","items":[]}'
      exit 0
    fi
    ready_after="$(cat "$dir/ready_after" 2>/dev/null || echo 1)"
    if [ "$n" -ge "$ready_after" ]; then phase=Running; ready=True; reason=""; else phase=Pending; ready=False; reason=ContainersNotReady; fi
    cat <<JSON
{"kind":"List","items":[
 {"metadata":{"name":"kube-apiserver-p","uid":"u1","namespace":"kube-system"},
  "status":{"phase":"$phase","conditions":[{"type":"Ready","status":"$ready","reason":"$reason"}]}},
 {"metadata":{"name":"etcd-p","uid":"u2","namespace":"kube-system"},
  "status":{"phase":"Running","conditions":[{"type":"Ready","status":"True"}]}}]}
JSON
    ;;
  *"--field-selector=status.phase!=Running"*)
    printf "coredns-787d4945fb-x2b9s"
    ;;
  *"get pvc"*)
    cat "$dir/pvc_phase" 2>/dev/null || echo Pending
    ;;
  *"get volumesnapshot"*)
    if [ -f "$dir/snapshot_error" ] && [ "$n" -eq 1 ]; then
      echo 'error: the server doesn'"'"'t have a resource type "volumesnapshot"' >&2
      exit 1
    fi
    printf "%s" "$(cat "$dir/snapshot_ready" 2>/dev/null || echo false)"
    ;;
  *"get nodes"*)
    echo '{"kind":"List","items":[{"metadata":{"name":"p"}}]}'
    ;;
  *)
    echo "$*"
    ;;
esac
"#;

pub struct FakeCluster {
    pub dir: TempDir,
    pub tool: PathBuf,
    pub kubectl: PathBuf,
}

impl FakeCluster {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: creating fake cluster tool");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let tool = write_script(dir.path(), "minikube", FAKE_TOOL);
        let kubectl = write_script(dir.path(), "kubectl", FAKE_KUBECTL);
        Self { dir, tool, kubectl }
    }

    pub fn config(&self) -> InvocationConfigBuilder {
        InvocationConfig::builder()
            .binary(&self.tool)
            .kubectl(&self.kubectl)
            .start_args("--driver=kvm2")
    }

    pub fn harness(&self, name: &str) -> TestHarness {
        self.harness_with(name, self.config().build().expect("valid config"))
    }

    pub fn harness_with(&self, name: &str, config: InvocationConfig) -> TestHarness {
        let caps = CapabilitySet::derive(
            &config.start_args,
            &HostEnv::default(),
            HostOs::Linux,
            Arch::Amd64,
        );
        TestHarnessBuilder::new(name, Arc::new(config))
            .caps(caps)
            .logger(TestLogger::in_memory(name))
            .build()
    }

    pub fn set(&self, file: &str, content: &str) {
        fs::write(self.dir.path().join(file), content).expect("Failed to write state file");
    }

    pub fn read(&self, file: &str) -> String {
        fs::read_to_string(self.dir.path().join(file)).unwrap_or_default()
    }

    pub fn tool_calls(&self) -> Vec<String> {
        self.read("tool.calls").lines().map(str::to_string).collect()
    }

    pub fn kubectl_calls(&self) -> Vec<String> {
        self.read("kubectl.calls").lines().map(str::to_string).collect()
    }

    pub fn pid(&self, file: &str) -> u32 {
        self.read(file).trim().parse().expect("pid file")
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("Failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

/// Whether `pid` no longer runs. Zombies count as gone: an orphan killed
/// along with its group may wait a while for its new parent to reap it.
fn is_gone(pid: u32) -> bool {
    if !mkit_common::process::terminate::is_alive(pid) {
        return true;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => !Path::new("/proc/self").exists(),
    }
}

/// Poll until `pid` is gone, up to `limit`.
pub fn wait_until_gone(pid: u32, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if is_gone(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    is_gone(pid)
}
