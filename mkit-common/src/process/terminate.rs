//! Killing a child together with everything it spawned.
//!
//! Children are started as leaders of their own process group, so a single
//! signal reaches helpers they fork (ssh sessions, tunnels, port forwards).

use std::time::Duration;

use tokio::process::Child;

/// How long a child gets between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(100);

/// Put the child in its own process group.
pub(crate) fn isolate(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    // pid 0 would address our own group.
    if let Ok(raw) = i32::try_from(pid)
        && raw > 0
    {
        let _ = killpg(Pid::from_raw(raw), signal);
    }
}

/// Forcefully kill the process group led by `pid` without waiting.
///
/// Usable from `Drop` and from watcher tasks that do not own the child.
pub fn kill_group_now(pid: u32) {
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
}

/// Terminate the child and its group: SIGTERM, a short grace period, then
/// SIGKILL. Returns once the child has been reaped.
///
/// `pid` is the id captured at spawn time; the group outlives a leader that
/// has already been reaped.
pub async fn terminate(child: &mut Child, pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        let _ = tokio::time::timeout(grace, child.wait()).await;
        // Stragglers that ignored SIGTERM or outlived the leader.
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        kill_group_now(pid);
    }

    if let Err(error) = child.kill().await {
        tracing::debug!(pid, %error, "kill after group signal");
    }
    let _ = child.wait().await;
}

/// Whether a process with this pid still exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}
