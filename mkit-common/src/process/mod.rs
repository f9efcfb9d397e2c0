//! Process runner.
//!
//! Runs the tool, kubectl and driver CLIs to completion with both streams
//! captured, or starts them as long-lived [`StreamingSession`]s. The runner
//! never retries; callers wrap it in [`crate::retry`] when a failure is
//! transient.
//!
//! Output is buffered in memory without a cap. Test commands are short-lived
//! and their output is bounded in practice.

pub mod stream;
pub mod terminate;

pub use stream::{LineReader, StreamingSession, read_line_with_timeout, read_until_match, start};
pub use terminate::{TERMINATE_GRACE, kill_group_now, terminate};

use std::borrow::Cow;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use memchr::memmem;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::deadline::Deadline;
use crate::e2e::logging::TestLogger;
use crate::error::{HarnessError, HarnessResult};
use crate::util::{display_command, indent_lines};

/// Runs slower than this are logged at info instead of debug.
const SLOW_RUN: Duration = Duration::from_secs(1);

/// How long pipes may stay open after the child was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one command run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// The argv actually executed
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration: Duration,
}

impl RunResult {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    pub fn stdout_contains(&self, pattern: &str) -> bool {
        memmem::find(&self.stdout, pattern.as_bytes()).is_some()
    }

    pub fn stderr_contains(&self, pattern: &str) -> bool {
        memmem::find(&self.stderr, pattern.as_bytes()).is_some()
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout_str(), self.stderr_str())
    }

    /// The command line as a user would type it.
    pub fn command(&self) -> String {
        display_command(&self.args)
    }

    /// Both streams in indented blocks, empty streams omitted.
    pub fn output(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str("-- stdout --\n");
            out.push_str(&indent_lines(&self.stdout_str(), "\t"));
            out.push_str("\n-- /stdout --");
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("** stderr ** \n");
            out.push_str(&indent_lines(&self.stderr_str(), "\t"));
            out.push_str("\n** /stderr **");
        }
        out
    }
}

/// Exit code of a finished child; signals map to 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Buffer shared between a reader task and the runner, so bytes read before
/// a kill are still returned.
type Capture = Arc<Mutex<Vec<u8>>>;

fn spawn_capture<R>(reader: Option<R>) -> (Capture, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: Capture = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (buffer, handle)
}

fn take_capture(capture: &Capture) -> Vec<u8> {
    std::mem::take(
        &mut *capture
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    )
}

/// Wait for both reader tasks. A handle that already completed is not
/// polled again.
async fn drain(stdout: &mut JoinHandle<()>, stderr: &mut JoinHandle<()>) {
    for task in [stdout, stderr] {
        if !task.is_finished() {
            let _ = task.await;
        }
    }
}

pub(crate) fn build_command(argv: &[String], env: &[(String, String)]) -> HarnessResult<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(HarnessError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        });
    };
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    terminate::isolate(&mut command);
    Ok(command)
}

/// Run `argv` to completion under `deadline`.
///
/// Both streams are drained before returning. On expiry the child's process
/// group is terminated and reaped and the error carries what was captured.
pub async fn run(
    logger: &TestLogger,
    deadline: &Deadline,
    argv: &[String],
    env: &[(String, String)],
) -> HarnessResult<RunResult> {
    let shown = display_command(argv);
    logger.info(format!("(dbg) Run:  {shown}"));

    if deadline.is_expired() {
        return Err(HarnessError::Timeout {
            operation: shown,
            after: Duration::ZERO,
            partial: None,
            diagnostics: None,
        });
    }

    let mut command = build_command(argv, env)?;
    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
        command: shown.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    tracing::trace!(pid, command = %shown, "spawned");

    let (stdout_buf, mut stdout_task) = spawn_capture(child.stdout.take());
    let (stderr_buf, mut stderr_task) = spawn_capture(child.stderr.take());

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = deadline.done() => None,
    };

    let mut drained = false;
    if status.is_some() {
        // A background grandchild may still hold the pipes open.
        drained = tokio::select! {
            _ = drain(&mut stdout_task, &mut stderr_task) => true,
            _ = deadline.done() => false,
        };
    }
    if !drained {
        terminate::terminate(&mut child, pid, TERMINATE_GRACE).await;
        let finished =
            tokio::time::timeout(DRAIN_GRACE, drain(&mut stdout_task, &mut stderr_task)).await;
        if finished.is_err() {
            stdout_task.abort();
            stderr_task.abort();
        }
    }

    let result = RunResult {
        args: argv.to_vec(),
        stdout: take_capture(&stdout_buf),
        stderr: take_capture(&stderr_buf),
        exit_code: status.map(exit_code).unwrap_or(-1),
        duration: started.elapsed(),
    };
    let elapsed = humantime::format_duration(Duration::from_millis(
        u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
    ));

    if status.is_none() || !drained {
        logger.warn(format!("(dbg) Non-zero exit: {shown}: deadline exceeded ({elapsed})"));
        log_output(logger, &result);
        return Err(HarnessError::Timeout {
            operation: shown,
            after: result.duration,
            partial: Some(Box::new(result)),
            diagnostics: None,
        });
    }

    if !result.success() {
        logger.warn(format!(
            "(dbg) Non-zero exit: {shown}: exit status {} ({elapsed})",
            result.exit_code
        ));
        log_output(logger, &result);
        return Err(HarnessError::NonZeroExit {
            result: Box::new(result),
        });
    }

    if result.duration > SLOW_RUN {
        logger.info(format!("(dbg) Done: {shown}: ({elapsed})"));
    } else {
        logger.debug(format!("(dbg) done: {shown}: ({elapsed})"));
    }
    Ok(result)
}

fn log_output(logger: &TestLogger, result: &RunResult) {
    let output = result.output();
    if !output.is_empty() {
        logger.warn(output);
    }
}

/// Run `argv` and decode its stdout as JSON.
pub async fn json_run<T: DeserializeOwned>(
    logger: &TestLogger,
    deadline: &Deadline,
    argv: &[String],
    env: &[(String, String)],
) -> HarnessResult<T> {
    let result = run(logger, deadline, argv, env).await?;
    serde_json::from_slice(&result.stdout).map_err(|source| HarnessError::Decode {
        command: result.command(),
        source,
    })
}
