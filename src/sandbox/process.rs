//! Supervised child processes: watchdog, capped capture, guaranteed kill.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::SandboxError;

/// How to tear down everything a child may have started
#[derive(Clone, Debug)]
pub(crate) enum Reaper {
    /// Kill the child only
    Child,
    /// Kill the child's whole process group (the child leads it)
    ProcessGroup,
    /// Kill a named container through its runtime CLI
    Container {
        /// Runtime binary
        runtime: String,
        /// Container name
        name: String,
    },
}

/// Kills the supervised tree when dropped while still armed.
///
/// Armed from spawn until the child has been reaped, so a cancelled
/// validation never leaves a runaway process behind.
struct KillGuard {
    reaper: Reaper,
    pid: Option<u32>,
    armed: bool,
}

impl KillGuard {
    fn kill(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        match &self.reaper {
            Reaper::Child => {}
            Reaper::ProcessGroup => kill_process_group(self.pid),
            Reaper::Container { runtime, name } => kill_container(runtime, name),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pgid = pid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// `docker kill` on a helper thread; safe to call from `Drop` outside a runtime
fn kill_container(runtime: &str, name: &str) {
    let runtime = runtime.to_string();
    let name = name.to_string();
    std::thread::spawn(move || {
        let status = std::process::Command::new(&runtime)
            .args(["kill", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            warn!(container = %name, error = %e, "failed to kill container");
        }
    });
}

/// What a supervised child left behind
#[derive(Debug)]
pub(crate) struct Supervised {
    /// Exit status, `None` when the watchdog fired
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Either stream hit the read cap
    pub truncated: bool,
    pub wall_time: Duration,
}

impl Supervised {
    pub(crate) const fn timed_out(&self) -> bool {
        self.status.is_none()
    }

    /// Terminating signal, if the child was killed by one
    #[cfg(unix)]
    pub(crate) fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.and_then(|s| s.signal())
    }

    #[cfg(not(unix))]
    pub(crate) fn signal(&self) -> Option<i32> {
        None
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub(crate) fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last few lines of stderr, for error messages
    pub(crate) fn stderr_tail(&self) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(5)..].join("\n")
    }
}

/// Drain a pipe, keeping at most `cap` bytes so the child never blocks on a full pipe
async fn read_capped<R>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 8_192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (buf, truncated)
}

/// Spawn `command`, feed it `stdin`, and wait at most `limit`.
///
/// On timeout the reaper tears the tree down and the result carries no
/// status. Output beyond `read_cap` bytes per stream is discarded.
pub(crate) async fn run_supervised(
    mut command: Command,
    stdin: Vec<u8>,
    limit: Duration,
    read_cap: usize,
    reaper: Reaper,
) -> Result<Supervised, SandboxError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => SandboxError::InterpreterNotFound(
            command.as_std().get_program().to_string_lossy().into_owned(),
        ),
        _ => SandboxError::Spawn(e),
    })?;
    let mut guard = KillGuard {
        reaper,
        pid: child.id(),
        armed: true,
    };

    let input = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let feed = async move {
        if let Some(mut input) = input {
            if let Err(e) = input.write_all(&stdin).await {
                // The child may exit before reading its input
                debug!(error = %e, "child closed stdin early");
            }
        }
    };

    let outcome = tokio::time::timeout(limit, async {
        let ((), status, out, err) = tokio::join!(
            feed,
            child.wait(),
            read_capped(stdout, read_cap),
            read_capped(stderr, read_cap)
        );
        (status, out, err)
    })
    .await;

    match outcome {
        Ok((status, (stdout, out_truncated), (stderr, err_truncated))) => {
            guard.disarm();
            let status = status?;
            debug!(?status, elapsed = ?start.elapsed(), "child exited");
            Ok(Supervised {
                status: Some(status),
                stdout,
                stderr,
                truncated: out_truncated || err_truncated,
                wall_time: start.elapsed(),
            })
        }
        Err(_) => {
            warn!(limit = ?limit, "watchdog fired, killing child");
            guard.kill();
            if let Err(e) = child.kill().await {
                debug!(error = %e, "child already exited");
            }
            Ok(Supervised {
                status: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                truncated: false,
                wall_time: start.elapsed(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watchdog_kills_process_group() {
        let mut command = Command::new("sh");
        // the background sleep shares the group and must die with it
        command
            .args(["-c", "sleep 30 & sleep 30"])
            .process_group(0);

        let started = Instant::now();
        let result = run_supervised(
            command,
            Vec::new(),
            Duration::from_millis(200),
            1024,
            Reaper::ProcessGroup,
        )
        .await
        .unwrap();

        assert!(result.timed_out());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let mut command = Command::new("sh");
        command.args(["-c", "head -c 100000 /dev/zero"]);

        let result = run_supervised(command, Vec::new(), Duration::from_secs(10), 1000, Reaper::Child)
            .await
            .unwrap();

        assert!(!result.timed_out());
        assert_eq!(result.stdout.len(), 1000);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let mut command = Command::new("cat");
        command.arg("-");

        let result = run_supervised(
            command,
            b"ping".to_vec(),
            Duration::from_secs(10),
            1024,
            Reaper::Child,
        )
        .await
        .unwrap();

        assert_eq!(result.stdout_text(), "ping");
        assert_eq!(result.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let command = Command::new("codegate-no-such-interpreter");
        let err = run_supervised(command, Vec::new(), Duration::from_secs(1), 16, Reaper::Child)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }
}
