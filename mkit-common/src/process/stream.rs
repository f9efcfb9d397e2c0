//! Long-running children: dashboards, tunnels, mounts, `kubectl proxy`.

use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

use super::{TERMINATE_GRACE, build_command, terminate};
use crate::deadline::Deadline;
use crate::e2e::logging::TestLogger;
use crate::error::{HarnessError, HarnessResult};
use crate::util::display_command;

const READ_CHUNK: usize = 8 * 1024;

/// A child process under test control.
///
/// The session owns the child until [`stop`](Self::stop). Cancelling the
/// deadline it was started under kills the whole process group, which also
/// unblocks anyone reading its pipes. Dropping an unstopped session does the
/// same.
///
/// The kill on cancel runs on a watcher task. It only fires once the runtime
/// gets to poll that task, so a caller that blocks its worker thread (for
/// example with `std::thread::sleep` on a current-thread runtime) holds the
/// child alive until it yields.
#[derive(Debug)]
pub struct StreamingSession {
    args: Vec<String>,
    pid: u32,
    started: Instant,
    child: Child,
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
    watcher: Option<JoinHandle<()>>,
    logger: TestLogger,
    stopped: bool,
}

/// Start `argv` and return immediately with live readers.
pub async fn start(
    logger: &TestLogger,
    deadline: &Deadline,
    argv: &[String],
    env: &[(String, String)],
) -> HarnessResult<StreamingSession> {
    let shown = display_command(argv);
    logger.info(format!("(dbg) daemon: {shown}"));

    if deadline.is_expired() {
        return Err(HarnessError::timeout(shown, Duration::ZERO));
    }

    let mut command = build_command(argv, env)?;
    let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
        command: shown.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();

    let watched = deadline.clone();
    let watcher = tokio::spawn(async move {
        watched.done().await;
        tracing::debug!(pid, "deadline reached, killing streaming child");
        super::kill_group_now(pid);
    });

    Ok(StreamingSession {
        args: argv.to_vec(),
        pid,
        started: Instant::now(),
        stdout: child.stdout.take().map(LineReader::new),
        stderr: child.stderr.take().map(LineReader::new),
        child,
        watcher: Some(watcher),
        logger: logger.clone(),
        stopped: false,
    })
}

impl StreamingSession {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> String {
        display_command(&self.args)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stdout(&mut self) -> Option<&mut LineReader<ChildStdout>> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut LineReader<ChildStderr>> {
        self.stderr.as_mut()
    }

    /// Hand the stdout reader to another task. The pipe stays open until the
    /// session stops or the child exits.
    pub fn take_stdout(&mut self) -> Option<LineReader<ChildStdout>> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<LineReader<ChildStderr>> {
        self.stderr.take()
    }

    /// Read one line of stdout, waiting at most `timeout`.
    pub async fn read_stdout_line(&mut self, timeout: Duration) -> HarnessResult<String> {
        let reader = self.stdout.as_mut().ok_or_else(|| {
            HarnessError::Io(std::io::Error::other("stdout was taken from the session"))
        })?;
        let line = reader.read_line(timeout).await?;
        self.logger
            .log_stdout(&self.args[0], self.pid, line.trim_end().to_string());
        Ok(line)
    }

    /// Kill the child and its process group and reap it. Idempotent.
    pub async fn stop(&mut self) {
        if self.stopped {
            self.logger
                .debug(format!("{} already stopped", self.command()));
            return;
        }
        self.stopped = true;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        terminate(&mut self.child, self.pid, TERMINATE_GRACE).await;
        self.logger.debug(format!(
            "stopped {} after {}",
            self.command(),
            humantime::format_duration(Duration::from_secs(self.started.elapsed().as_secs()))
        ));
    }

    /// Whatever is still buffered in the pipes, read with a short bound.
    /// Meant for failed tests after [`stop`](Self::stop).
    pub async fn drain_remaining(&mut self, bound: Duration) -> (Vec<u8>, Vec<u8>) {
        let out = match self.stdout.as_mut() {
            Some(reader) => reader.read_remaining(bound).await,
            None => Vec::new(),
        };
        let err = match self.stderr.as_mut() {
            Some(reader) => reader.read_remaining(bound).await,
            None => Vec::new(),
        };
        (out, err)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if !self.stopped {
            super::kill_group_now(self.pid);
            let _ = self.child.start_kill();
        }
    }
}

/// Line reader that survives timeouts.
///
/// Bytes read before a timeout fires stay in `pending` and open the next
/// line, so a record written in pieces is never split or lost.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Read one newline-terminated record, failing with `Timeout` after `timeout`.
    ///
    /// The returned line keeps its terminator. A record cut short by end of
    /// stream is returned as-is; end of stream with nothing read is an
    /// `UnexpectedEof` error.
    pub async fn read_line(&mut self, timeout: Duration) -> HarnessResult<String> {
        match tokio::time::timeout(timeout, self.next_line()).await {
            Err(_) => Err(HarnessError::timeout("read line", timeout)),
            Ok(Err(e)) => Err(HarnessError::Io(e)),
            Ok(Ok(None)) => Err(HarnessError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before a line was read",
            ))),
            Ok(Ok(Some(line))) => Ok(String::from_utf8_lossy(&line).into_owned()),
        }
    }

    // The only await point is `read`, which is cancel safe; bytes land in
    // `pending` synchronously after it completes.
    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.pending) {
                return Ok(Some(self.pending.drain(..=pos).collect()));
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pending bytes plus whatever the stream yields within `bound`.
    pub async fn read_remaining(&mut self, bound: Duration) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(bound, self.inner.read_to_end(&mut rest)).await;
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(&rest);
        buf
    }
}

/// Free-function form of [`LineReader::read_line`].
pub async fn read_line_with_timeout<R>(
    reader: &mut LineReader<R>,
    timeout: Duration,
) -> HarnessResult<String>
where
    R: AsyncRead + Unpin,
{
    reader.read_line(timeout).await
}

/// Read lines until one matches `pattern`, within an overall `timeout`.
/// Returns the matching line without its terminator.
pub async fn read_until_match<R>(
    reader: &mut LineReader<R>,
    pattern: &Regex,
    timeout: Duration,
) -> HarnessResult<String>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(HarnessError::timeout(
                format!("waiting for output matching {pattern}"),
                timeout,
            ));
        }
        let line = match reader.read_line(remaining).await {
            Ok(line) => line,
            Err(HarnessError::Timeout { .. }) => {
                return Err(HarnessError::timeout(
                    format!("waiting for output matching {pattern}"),
                    timeout,
                ));
            }
            Err(e) => return Err(e),
        };
        let line = line.trim_end_matches(['\r', '\n']);
        if pattern.is_match(line) {
            return Ok(line.to_string());
        }
        tracing::trace!(line, "skipping non-matching line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_line_returns_first_record() {
        let mut reader = LineReader::new(&b"first\nsecond\n"[..]);
        let line = read_line_with_timeout(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(line, "first\n");
        assert_eq!(reader.read_line(Duration::from_secs(1)).await.unwrap(), "second\n");
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mut reader = LineReader::new(&b""[..]);
        let err = read_line_with_timeout(&mut reader, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));

        let mut reader = LineReader::new(&b"no newline"[..]);
        let line = read_line_with_timeout(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(line, "no newline");
    }

    #[tokio::test]
    async fn test_read_line_times_out_on_silent_stream() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut reader = LineReader::new(reader);
        let started = Instant::now();
        let err = read_line_with_timeout(&mut reader, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_line_split_across_timeout_is_kept_whole() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = LineReader::new(reader);

        writer.write_all(b"http://127.0.0.1:").await.unwrap();
        let err = reader.read_line(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_timeout());

        writer.write_all(b"41235/proxy/\n").await.unwrap();
        let line = reader.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line, "http://127.0.0.1:41235/proxy/\n");
    }

    #[tokio::test]
    async fn test_read_remaining_includes_pending_prefix() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = LineReader::new(reader);

        writer.write_all(b"partial").await.unwrap();
        assert!(reader.read_line(Duration::from_millis(50)).await.is_err());
        writer.write_all(b" tail\n").await.unwrap();
        drop(writer);

        let rest = reader.read_remaining(Duration::from_secs(1)).await;
        assert_eq!(rest, b"partial tail\n");
    }

    #[tokio::test]
    async fn test_read_until_match_skips_noise() {
        let input = b"* Verifying dashboard health ...\n* Launching proxy ...\nhttp://127.0.0.1:36123/api/v1/namespaces/kubernetes-dashboard/services/http:kubernetes-dashboard:/proxy/\n";
        let mut reader = LineReader::new(&input[..]);
        let pattern = Regex::new(crate::constants::DASHBOARD_URL_PATTERN).unwrap();
        let url = read_until_match(&mut reader, &pattern, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:36123/"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_stop_is_idempotent_and_reaps() {
        let logger = TestLogger::in_memory("stream_stop");
        let deadline = Deadline::after(Duration::from_secs(30));
        let argv: Vec<String> = ["sh", "-c", "echo ready; sleep 30"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut session = start(&logger, &deadline, &argv, &[]).await.unwrap();

        let line = session.read_stdout_line(Duration::from_secs(5)).await.unwrap();
        assert_eq!(line, "ready\n");

        let pid = session.pid();
        session.stop().await;
        session.stop().await;
        assert!(session.is_stopped());
        assert!(!super::super::terminate::is_alive(pid));
        assert!(!logger.search("already stopped").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_deadline_unblocks_reader() {
        let logger = TestLogger::in_memory("stream_cancel");
        let deadline = Deadline::after(Duration::from_secs(30));
        let argv: Vec<String> = ["sh", "-c", "sleep 30"].iter().map(|s| s.to_string()).collect();
        let mut session = start(&logger, &deadline, &argv, &[]).await.unwrap();
        let mut stdout = session.take_stdout().unwrap();

        let reader = tokio::spawn(async move { stdout.read_line(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        deadline.cancel();

        let read = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader still blocked")
            .unwrap();
        let err = read.unwrap_err();
        assert!(matches!(err, HarnessError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
        session.stop().await;
    }
}
