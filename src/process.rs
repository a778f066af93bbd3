use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to keep draining pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of one child process.
///
/// Output is decoded as UTF-8; invalid sequences are replaced with U+FFFD,
/// so a report may show replacement characters the program never wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// Exit code, `None` when killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Spawns a command and captures stdout and stderr separately.
///
/// The child gets its own process group (on unix) and a null stdin. If it is
/// still running after `timeout`, the whole group is killed and the result is
/// marked `timed_out`. When the child exits normally, descendants it left
/// behind in its group are killed as well, so no example leaks processes into
/// the next one.
///
/// # Errors
///
/// Only spawning errors are returned; a non-zero exit is a normal result.
pub async fn spawn_and_capture(mut cmd: Command, timeout: Duration) -> io::Result<Captured> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stderr"))?;

    let stdout_reader = OutputReader::spawn(stdout);
    let stderr_reader = OutputReader::spawn(stderr);

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            kill_process_group(pid);
            (status.code(), false)
        }
        Err(_) => {
            log::debug!("Process {:?} exceeded {:?}, killing it", pid, timeout);
            kill_process_group(pid);
            if let Err(e) = child.start_kill() {
                log::debug!("Failed to kill process {:?}: {}", pid, e);
            }
            if let Err(e) = child.wait().await {
                log::warn!("Failed to reap process {:?}: {}", pid, e);
            }
            (None, true)
        }
    };

    let (stdout, stderr) = tokio::join!(stdout_reader.finish(), stderr_reader.finish());

    Ok(Captured {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

/// Reads one child pipe in the background into a shared buffer, so whatever
/// arrived is still there if the reader has to be abandoned.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = tokio::spawn(read_into(reader, Arc::clone(&buffer)));
        Self { buffer, handle }
    }

    /// Waits for end of stream. A descendant that escaped the process group
    /// can hold the pipe open forever, so the wait is bounded and the bytes
    /// read so far are kept.
    async fn finish(self) -> String {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(DRAIN_GRACE, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Failed to join output reader: {}", e),
            Err(_) => {
                log::warn!("Output pipe still open after the process exited, keeping partial output");
                abort.abort();
            }
        }

        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn read_into<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
            Err(e) => {
                log::debug!("Stopped reading child output: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal. A group that no longer exists
    // yields ESRCH, which is fine to ignore.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_streams_separately() {
        let captured = spawn_and_capture(sh("echo out; echo err >&2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(captured.stdout, "out\n");
        assert_eq!(captured.stderr, "err\n");
        assert_eq!(captured.exit_code, Some(0));
        assert!(!captured.timed_out);
    }

    #[tokio::test]
    async fn test_reports_nonzero_exit() {
        let captured = spawn_and_capture(sh("echo partial; exit 7"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(captured.exit_code, Some(7));
        assert_eq!(captured.stdout, "partial\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let start = Instant::now();
        let captured = spawn_and_capture(
            sh("echo started; sleep 30 & sleep 30; echo never"),
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        assert!(captured.timed_out);
        assert_eq!(captured.exit_code, None);
        assert_eq!(captured.stdout, "started\n");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_descendant_does_not_block() {
        let start = Instant::now();
        let captured = spawn_and_capture(sh("sleep 30 & echo done"), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!captured.timed_out);
        assert_eq!(captured.exit_code, Some(0));
        assert_eq!(captured.stdout, "done\n");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_escaped_descendant_keeps_partial_output() {
        let start = Instant::now();
        let captured = spawn_and_capture(
            sh("echo important; echo warned >&2; setsid sleep 5 &"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(captured.exit_code, Some(0));
        assert_eq!(captured.stdout, "important\n");
        assert_eq!(captured.stderr, "warned\n");
        // Both pipes share one grace period
        assert!(start.elapsed() < DRAIN_GRACE * 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let captured = spawn_and_capture(sh("printf 'ok\\377\\n'"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(captured.stdout, "ok\u{FFFD}\n");
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let cmd = Command::new("/nonexistent/gfmxr-test-binary");
        assert!(spawn_and_capture(cmd, Duration::from_secs(1)).await.is_err());
    }
}
