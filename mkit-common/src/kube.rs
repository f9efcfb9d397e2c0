//! Waiting on cluster objects through kubectl.
//!
//! All observation goes through `kubectl --context <profile>`, decoding its
//! JSON output. Transient API errors are logged and retried until the wait's
//! own deadline runs out.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::deadline::Deadline;
use crate::e2e::harness::TestHarness;
use crate::error::{HarnessError, HarnessResult};
use crate::profile::status;
use crate::retry::{ExpoBackoff, RetryError, RetryExt, retry_expo};

#[derive(Debug, Clone, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Pod {
    /// Running, with every `Ready` condition true (and at least one present).
    pub fn is_ready(&self) -> bool {
        if self.status.phase != "Running" {
            return false;
        }
        let mut ready = self
            .status
            .conditions
            .iter()
            .filter(|c| c.kind == "Ready")
            .peekable();
        ready.peek().is_some() && ready.all(|c| c.status == "True")
    }

    /// Short-lived pods that ran to completion count as healthy.
    pub fn is_succeeded(&self) -> bool {
        self.status.phase == "Succeeded"
    }

    pub fn is_healthy(&self) -> bool {
        self.is_ready() || self.is_succeeded()
    }

    /// `"name" [uid] Phase: Type:Reason (message) / ...`
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "{:?} [{}] {}",
            self.metadata.name, self.metadata.uid, self.status.phase
        );
        for (i, c) in self.status.conditions.iter().enumerate() {
            if !c.reason.is_empty() {
                line.push_str(if i == 0 { ": " } else { " / " });
                line.push_str(&format!("{}:{}", c.kind, c.reason));
            }
            if !c.message.is_empty() {
                line.push_str(&format!(" ({})", c.message));
            }
        }
        line
    }
}

/// Polling cadence for [`pod_wait_with`].
#[derive(Debug, Clone)]
pub struct PodWaitOptions {
    /// First interval between polls.
    pub poll_initial: Duration,
    /// Intervals double up to this.
    pub poll_max: Duration,
}

impl Default for PodWaitOptions {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_secs(1),
            poll_max: Duration::from_secs(5),
        }
    }
}

/// Wait until every pod matching `selector` in `namespace` is ready.
///
/// Returns the sorted names of the matching pods. Zero matching pods never
/// counts as success.
pub async fn pod_wait(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    namespace: &str,
    selector: &str,
    timeout: Duration,
) -> HarnessResult<Vec<String>> {
    pod_wait_with(
        h,
        deadline,
        profile,
        namespace,
        selector,
        timeout,
        &PodWaitOptions::default(),
    )
    .await
}

pub async fn pod_wait_with(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    namespace: &str,
    selector: &str,
    timeout: Duration,
    options: &PodWaitOptions,
) -> HarnessResult<Vec<String>> {
    let wait = deadline.child(timeout);
    let started = Instant::now();
    let argv = h.kubectl_argv(
        profile,
        &["get", "po", "-l", selector, "-n", namespace, "-o=json"],
    );
    h.logger().info(format!(
        "(dbg) {}: waiting {} for pods matching {selector:?} in namespace {namespace:?} ...",
        h.name(),
        humantime::format_duration(timeout)
    ));

    let mut interval = options.poll_initial;
    let mut last_line: HashMap<String, String> = HashMap::new();
    let mut unhealthy: Vec<String> = Vec::new();

    loop {
        match h.json_run::<PodList>(&wait, &argv).await {
            Ok(list) if list.items.is_empty() => {
                h.logger()
                    .debug(format!("no pods matching {selector:?} in {namespace:?} yet"));
            }
            Ok(list) => {
                for pod in &list.items {
                    let line = pod.status_line();
                    if last_line.get(&pod.metadata.name) != Some(&line) {
                        h.logger().info(line.clone());
                        last_line.insert(pod.metadata.name.clone(), line);
                    }
                }
                unhealthy = list
                    .items
                    .iter()
                    .filter(|p| !p.is_healthy())
                    .map(|p| p.metadata.name.clone())
                    .collect();
                if unhealthy.is_empty() {
                    let names: BTreeSet<String> =
                        list.items.into_iter().map(|p| p.metadata.name).collect();
                    h.logger().info(format!(
                        "(dbg) {}: {selector} healthy within {}",
                        h.name(),
                        humantime::format_duration(round_millis(started.elapsed()))
                    ));
                    return Ok(names.into_iter().collect());
                }
            }
            Err(err @ HarnessError::Spawn { .. }) => return Err(err),
            Err(err) if wait.is_expired() => {
                h.logger().debug(format!("pod list ended by deadline: {err}"));
                break;
            }
            Err(err) => {
                h.logger().warn(format!(
                    "{}: WARNING: pod list for {namespace:?} {selector:?} returned: {err}",
                    h.name()
                ));
            }
        }
        if wait.sleep(interval, "pod wait").await.is_err() {
            break;
        }
        interval = (interval * 2).min(options.poll_max);
    }

    let operation = format!("pods {selector} in {namespace:?}");
    h.logger().error(format!(
        "***** {}: pod {selector:?} failed to start within {}: deadline exceeded ****",
        h.name(),
        humantime::format_duration(timeout)
    ));
    let diagnostics = show_pod_logs(h, profile, namespace, &unhealthy).await;
    Err(HarnessError::timeout(operation, timeout).with_diagnostics(diagnostics))
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Describe and fetch logs for `names`, returning what was collected.
///
/// Runs on a fresh deadline; the caller's has usually expired by now.
async fn show_pod_logs(h: &TestHarness, profile: &str, namespace: &str, names: &[String]) -> String {
    let deadline = Deadline::after(h.config().minutes(1));
    let apiserver = status(h, &deadline, profile, "APIServer", Some(profile)).await;
    if apiserver != "Running" {
        let msg = format!(
            "\"{profile}\" apiserver is not running, skipping kubectl commands (state=\"{apiserver}\")"
        );
        h.logger().info(msg.clone());
        return msg;
    }
    if names.is_empty() {
        return format!("no pods found in {namespace:?}");
    }

    h.logger().info(format!(
        "{}: showing logs for failed pods as of {}",
        h.name(),
        chrono::Utc::now().to_rfc3339()
    ));
    let mut collected = Vec::new();
    for name in names {
        for args in [
            ["describe", "po", name.as_str(), "-n", namespace],
            ["logs", name.as_str(), "-n", namespace, "--all-containers"],
        ] {
            match h.run_kubectl(&deadline, profile, &args).await {
                Ok(result) => {
                    let text = format!("(dbg) {}:\n{}", result.command(), result.stdout_str());
                    h.logger().info(text.clone());
                    collected.push(text);
                }
                Err(err) => {
                    h.logger().info(err.to_string());
                    collected.push(err.to_string());
                }
            }
        }
    }
    collected.join("\n")
}

/// Wait until PersistentVolumeClaim `name` is `Bound`. `Lost` fails at once.
pub async fn pvc_wait(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> HarnessResult<()> {
    h.logger().info(format!(
        "(dbg) {}: waiting {} for pvc {name:?} in namespace {namespace:?} ...",
        h.name(),
        humantime::format_duration(timeout)
    ));
    let wait = deadline.child(timeout);
    let backoff = ExpoBackoff::new(Duration::from_secs(1), Duration::from_secs(5), timeout)
        .with_deadline(&wait);
    let args = [
        "get",
        "pvc",
        name,
        "-o",
        "jsonpath={.status.phase}",
        "-n",
        namespace,
    ];

    let result = retry_expo(&backoff, || {
        let wait = &wait;
        let args = &args;
        async move {
            let run = match h.run_kubectl(wait, profile, args).await {
                Err(err @ HarnessError::Spawn { .. }) => return Err(RetryError::Terminal(err)),
                other => other.retriable()?,
            };
            match run.stdout_str().trim() {
                "Bound" => Ok(()),
                "Lost" => Err(RetryError::Terminal(HarnessError::AssertionFailed(format!(
                    "PVC {name:?} is LOST"
                )))),
                phase => Err(RetryError::Retriable(HarnessError::timeout(
                    format!("pvc {name:?} in {namespace:?} (phase {phase:?})"),
                    timeout,
                ))),
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(err @ HarnessError::Spawn { .. }) => Err(err),
        Err(err) if err.is_assertion() || err.is_timeout() => Err(err),
        Err(err) => Err(HarnessError::timeout(format!("pvc {name:?} in {namespace:?}"), timeout)
            .with_diagnostics(err.to_string())),
    }
}

/// Wait until VolumeSnapshot `name` reports `readyToUse: true`, polling
/// once a second. Failed or unparsable reads are logged and retried.
pub async fn volume_snapshot_wait(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> HarnessResult<()> {
    h.logger().info(format!(
        "(dbg) {}: waiting {} for volume snapshot {name:?} in namespace {namespace:?} ...",
        h.name(),
        humantime::format_duration(timeout)
    ));
    let wait = deadline.child(timeout);
    let args = [
        "get",
        "volumesnapshot",
        name,
        "-o",
        "jsonpath={.status.readyToUse}",
        "-n",
        namespace,
    ];

    loop {
        let observed = match h.run_kubectl(&wait, profile, &args).await {
            Ok(run) => run
                .stdout_str()
                .trim()
                .parse::<bool>()
                .map_err(|e| format!("{:?}: {e}", run.stdout_str().trim())),
            Err(err @ HarnessError::Spawn { .. }) => return Err(err),
            Err(_) if wait.is_expired() => break,
            Err(err) => Err(err.to_string()),
        };
        match observed {
            Ok(true) => return Ok(()),
            Ok(false) => h
                .logger()
                .debug(format!("volume snapshot {name:?} not ready yet")),
            Err(err) => h.logger().warn(format!(
                "{}: WARNING: volume snapshot get for {namespace:?} {name:?} returned: {err}",
                h.name()
            )),
        }
        if wait.sleep(Duration::from_secs(1), "volume snapshot wait").await.is_err() {
            break;
        }
    }

    h.logger().error(format!(
        "***** {}: volume snapshot {name:?} not ready within {}: deadline exceeded ****",
        h.name(),
        humantime::format_duration(timeout)
    ));
    Err(HarnessError::timeout(
        format!("volume snapshot {name:?} in {namespace:?}"),
        timeout,
    ))
}

/// Number of attempts [`kubectl_json`] makes.
const KUBECTL_JSON_ATTEMPTS: u32 = 3;

/// Run `kubectl --context <profile> <args> -o=json` and decode stdout,
/// retrying a couple of times to ride out apiserver restarts.
pub async fn kubectl_json<T: DeserializeOwned>(
    h: &TestHarness,
    deadline: &Deadline,
    profile: &str,
    args: &[&str],
) -> HarnessResult<T> {
    let mut argv = h.kubectl_argv(profile, args);
    argv.push("-o=json".to_string());

    let mut attempt = 1;
    loop {
        match h.json_run::<T>(deadline, &argv).await {
            Ok(value) => return Ok(value),
            Err(err @ (HarnessError::Spawn { .. } | HarnessError::Timeout { .. })) => {
                return Err(err);
            }
            Err(err) if attempt >= KUBECTL_JSON_ATTEMPTS => return Err(err),
            Err(err) => {
                h.logger()
                    .debug(format!("kubectl attempt {attempt} failed, retrying: {err}"));
            }
        }
        deadline.sleep(Duration::from_secs(2), "kubectl retry").await?;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(json: &str) -> Pod {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_ready_requires_running_and_ready_condition() {
        let ready = pod(r#"{"metadata":{"name":"a","uid":"u1"},"status":{"phase":"Running","conditions":[
            {"type":"Initialized","status":"True"},
            {"type":"Ready","status":"True"}]}}"#);
        assert!(ready.is_ready());

        let not_ready = pod(r#"{"metadata":{"name":"a"},"status":{"phase":"Running","conditions":[
            {"type":"Ready","status":"False","reason":"ContainersNotReady","message":"containers with unready status: [etcd]"}]}}"#);
        assert!(!not_ready.is_ready());

        let no_condition = pod(r#"{"metadata":{"name":"a"},"status":{"phase":"Running"}}"#);
        assert!(!no_condition.is_ready());

        let pending = pod(r#"{"metadata":{"name":"a"},"status":{"phase":"Pending","conditions":[
            {"type":"Ready","status":"True"}]}}"#);
        assert!(!pending.is_ready());
    }

    #[test]
    fn test_succeeded_is_healthy() {
        let done = pod(r#"{"metadata":{"name":"job"},"status":{"phase":"Succeeded"}}"#);
        assert!(!done.is_ready());
        assert!(done.is_healthy());
    }

    #[test]
    fn test_status_line() {
        let p = pod(r#"{"metadata":{"name":"busybox","uid":"123"},"status":{"phase":"Pending","conditions":[
            {"type":"Ready","status":"False","reason":"ContainersNotReady","message":"waiting"},
            {"type":"PodScheduled","status":"True"}]}}"#);
        assert_eq!(
            p.status_line(),
            "\"busybox\" [123] Pending: Ready:ContainersNotReady (waiting)"
        );
    }

    #[test]
    fn test_pod_list_tolerates_missing_fields() {
        let list: PodList = serde_json::from_str(r#"{"kind":"List","items":[{"metadata":{"name":"x"}}]}"#).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].status.phase, "");
        assert!(!list.items[0].is_healthy());

        let empty: PodList = serde_json::from_str(r#"{"kind":"List"}"#).unwrap();
        assert!(empty.items.is_empty());
    }
}
