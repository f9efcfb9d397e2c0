//! Full lifecycle of one profile: start, soft start, wait for the control
//! plane, stop, restart and delete.

use mkit_common::audit::{audit_contains, audit_path};
use mkit_common::constants::API_PORT_TEST;
use mkit_common::e2e::TestHarness;
use mkit_common::error::HarnessResult;
use mkit_common::kube::pod_wait;
use mkit_common::profile::{ProfileGuard, ProfileState};

use crate::suite::{TestCase, TestFuture, subtest};

pub const CASE: TestCase = TestCase::new("TestStartStop", true, start);

fn start(h: TestHarness) -> TestFuture {
    Box::pin(run(h))
}

async fn run(h: TestHarness) -> HarnessResult<()> {
    let deadline = h.deadline_minutes(40);
    let mut profile = ProfileGuard::acquire(&h, "start-stop", &deadline);
    let result = steps(&h, &mut profile).await;
    profile.cleanup_with_logs().await;
    result
}

async fn steps(h: &TestHarness, profile: &mut ProfileGuard) -> HarnessResult<()> {
    let port = format!("--apiserver-port={API_PORT_TEST}");

    let p = &mut *profile;
    subtest(h, "FirstStart", |_| async move {
        p.start(&["--memory=3072", port.as_str(), "--wait=true"])
            .await
            .map(drop)
    })
    .await?;

    let p = &*profile;
    subtest(h, "Status", |s| async move {
        s.assert_eq(p.status("Host").await.as_str(), "Running", "host status")
    })
    .await?;

    let p = &mut *profile;
    subtest(h, "SoftStart", |_| async move {
        p.start(&["--alsologtostderr"]).await.map(drop)
    })
    .await?;

    let config = h.shared_config();
    let wait = profile.deadline().clone();
    let name = profile.name().to_string();
    subtest(h, "PodWait", |s| async move {
        let pods = pod_wait(
            &s,
            &wait,
            &name,
            "kube-system",
            "component=kube-apiserver",
            config.minutes(6),
        )
        .await?;
        s.logger().info(format!("control plane pods: {}", pods.join(", ")));
        Ok(())
    })
    .await?;

    let name = profile.name().to_string();
    subtest(h, "Audit", |s| async move {
        let path = audit_path(&s.config().host)?;
        if !path.exists() {
            return Err(s.skip(format!("no audit log at {}", path.display())));
        }
        let found = audit_contains(&path, &name)?;
        s.assert(found, &format!("audit log {} should mention {name}", path.display()))
    })
    .await?;

    let p = &mut *profile;
    subtest(h, "Stop", |s| async move {
        p.stop().await?;
        s.assert_eq(p.status("Host").await.as_str(), "Stopped", "host status after stop")
    })
    .await?;

    let p = &mut *profile;
    subtest(h, "SecondStart", |s| async move {
        p.start(&["--wait=true"]).await?;
        s.assert_eq(p.status("Host").await.as_str(), "Running", "host status after restart")
    })
    .await?;

    let p = &mut *profile;
    subtest(h, "Delete", |s| async move {
        if !s.config().cleanup {
            return Err(s.skip("--cleanup=false"));
        }
        p.cleanup().await;
        s.assert_eq(p.state(), ProfileState::Deleted, "profile state after delete")
    })
    .await
}
