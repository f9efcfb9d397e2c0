//! Diagnostics collected after a test fails.

use crate::deadline::Deadline;
use crate::e2e::harness::TestHarness;
use crate::e2e::logging::{LogLevel, LogSource};
use crate::process::RunResult;
use crate::profile::status;
use crate::util::node_name;

/// Deadline for each post-mortem command, before scaling.
const POSTMORTEM_MINUTES: u64 = 2;

/// Nodes inspected for multinode profiles.
const MULTINODE_NODES: usize = 3;

const RUNNING: &str = "Running";

fn log_result(h: &TestHarness, source: LogSource, result: &RunResult) {
    h.logger().log(
        LogLevel::Info,
        source,
        format!("(dbg) {}:\n{}", result.command(), result.output()),
    );
}

/// Dump driver state, the tool's logs and the non-running pods of a failed
/// test's profile.
///
/// Does nothing for passing tests. Each step is best effort: a failing
/// command is logged and ends the sequence.
pub async fn post_mortem_logs(h: &TestHarness, profile: &str, multinode: bool) {
    if !h.failed() {
        return;
    }
    if !h.config().postmortem_logs {
        h.logger().info("post-mortem logs disabled, oh well!");
        return;
    }

    let nodes = if multinode { MULTINODE_NODES } else { 1 };
    let test = h.name();
    h.logger()
        .info("-----------------------post-mortem--------------------------------");

    for n in 1..=nodes {
        let machine = node_name(profile, n);
        let deadline = Deadline::after(h.config().minutes(POSTMORTEM_MINUTES));

        if let Some(cli) = h.caps().driver.native_cli() {
            h.logger()
                .info(format!("======>  post-mortem[{test}]: {cli} inspect <======"));
            for args in [vec!["inspect", machine.as_str()], vec!["ps", "-a"]] {
                let mut argv = vec![cli.to_string()];
                argv.extend(args.iter().map(|a| a.to_string()));
                match h.run(&deadline, &argv).await {
                    Ok(result) => log_result(h, LogSource::Driver, &result),
                    Err(err) => h.logger().info(format!("failed to get {cli} {}: {err}", args[0])),
                }
            }
        }

        let node = if n == 1 { profile.to_string() } else { format!("m{n:02}") };
        let host = status(h, &deadline, profile, "Host", Some(&node)).await;
        if host != RUNNING {
            h.logger().info(format!(
                "\"{profile}\" host is not running, skipping log retrieval (state=\"{host}\")"
            ));
            return;
        }

        h.logger()
            .info(format!("<<< {test} FAILED: start of post-mortem logs <<<"));
        h.logger()
            .info(format!("======>  post-mortem[{test}]: minikube logs <======"));
        match h
            .run_tool(&deadline, &["-p", profile, "logs", "-n", "25"])
            .await
        {
            Ok(result) => {
                log_result(h, LogSource::Tool, &result);
                let artifact = format!("{machine}-logs");
                if let Err(err) = h.logger().capture_artifact_text(&artifact, &result.output()) {
                    tracing::debug!(error = %err, "could not save post-mortem logs artifact");
                }
            }
            Err(err) => {
                h.logger().info(format!("failed logs error: {err}"));
                return;
            }
        }

        let apiserver = status(h, &deadline, profile, "APIServer", Some(&node)).await;
        if apiserver != RUNNING {
            h.logger().info(format!(
                "\"{profile}\" apiserver is not running, skipping kubectl commands (state=\"{apiserver}\")"
            ));
            return;
        }

        let listed = h
            .run_kubectl(
                &deadline,
                profile,
                &[
                    "get",
                    "po",
                    "-o=jsonpath={.items[*].metadata.name}",
                    "-A",
                    "--field-selector=status.phase!=Running",
                ],
            )
            .await;
        let not_running: Vec<String> = match listed {
            Ok(result) => result
                .stdout_str()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Err(err) => {
                h.logger().info(format!("listing non-running pods: {err}"));
                return;
            }
        };
        h.logger()
            .info(format!("non-running pods: {}", not_running.join(" ")));
        if not_running.is_empty() {
            continue;
        }

        h.logger().info(format!(
            "======> post-mortem[{test}]: describe non-running pods <======"
        ));
        let mut args = vec!["describe".to_string(), "pod".to_string()];
        args.extend(not_running);
        match h.run_kubectl(&deadline, profile, &args).await {
            Ok(result) => log_result(h, LogSource::Kubectl, &result),
            Err(err) => {
                h.logger().info(format!("describe non-running pods: {err}"));
                return;
            }
        }
    }
    h.logger().info(format!("<<< {test} FAILED: end of post-mortem logs <<<"));
    h.logger()
        .info("---------------------/post-mortem---------------------------------");
}
