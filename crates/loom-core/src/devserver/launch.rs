use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::platform::process::terminate_child_tree;

/// Captured output kept per attempt for classification and error excerpts.
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Shell invocation for `command` with the dev-server environment applied.
pub fn shell_command(command: &str, cwd: &Path, path_env: &OsString) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    cmd.current_dir(cwd)
        .env("PATH", path_env)
        .env("BROWSER", "none")
        .env("FORCE_COLOR", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        // New session so the whole tree can be signalled through its group.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.kill_on_drop(true);
    cmd
}

/// Merge the child's stdout and stderr into one line channel.
///
/// The channel closes once both streams reach EOF.
pub fn forward_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        pump(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump(stderr, tx);
    }
    rx
}

fn pump<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Append `line` to `buf`, dropping the oldest text beyond `cap` bytes.
pub fn push_tail(buf: &mut String, line: &str, cap: usize) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > cap {
        let mut cut = buf.len() - cap;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// Deadline and stop timings for a dependency install.
#[derive(Debug, Clone, Copy)]
pub struct InstallLimits {
    pub timeout: Duration,
    pub stop_grace: Duration,
    pub stop_ceiling: Duration,
}

/// Why a dependency install did not succeed.
#[derive(Debug)]
pub enum InstallError<T> {
    /// The command failed or timed out; carries the captured output or reason.
    Failed(String),
    /// A message arrived on the cancel channel; the install tree was stopped.
    Cancelled(T),
}

/// Run a dependency install to completion, passing each output line to
/// `on_line`.
///
/// A message on `cancel` stops the install's whole process tree and is handed
/// back in [`InstallError::Cancelled`].
pub async fn run_install<T, F>(
    command: &str,
    cwd: &Path,
    path_env: &OsString,
    limits: InstallLimits,
    cancel: &mut mpsc::UnboundedReceiver<T>,
    mut on_line: F,
) -> Result<(), InstallError<T>>
where
    F: FnMut(&str),
{
    let mut child = shell_command(command, cwd, path_env)
        .spawn()
        .map_err(|e| InstallError::Failed(format!("failed to run `{command}`: {e}")))?;
    let mut lines = forward_output(&mut child);
    let mut output = String::new();

    let deadline = tokio::time::Instant::now() + limits.timeout;
    let mut open = true;
    let mut cancel_open = true;
    let status = loop {
        tokio::select! {
            biased;

            request = cancel.recv(), if cancel_open => match request {
                Some(request) => {
                    debug!(command, "install cancelled");
                    terminate_child_tree(&mut child, limits.stop_grace, limits.stop_ceiling).await;
                    return Err(InstallError::Cancelled(request));
                }
                None => cancel_open = false,
            },
            line = lines.recv(), if open => match line {
                Some(line) => {
                    on_line(&line);
                    push_tail(&mut output, &line, OUTPUT_TAIL_BYTES);
                }
                None => open = false,
            },
            status = child.wait() => break status,
            _ = tokio::time::sleep_until(deadline) => {
                debug!(command, "install timed out");
                terminate_child_tree(&mut child, limits.stop_grace, limits.stop_ceiling).await;
                return Err(InstallError::Failed(format!(
                    "`{command}` timed out after {}s\n{output}",
                    limits.timeout.as_secs()
                )));
            }
        }
    };

    // Pick up lines still buffered in the readers.
    while let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(100), lines.recv()).await {
        on_line(&line);
        push_tail(&mut output, &line, OUTPUT_TAIL_BYTES);
    }

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(InstallError::Failed(format!(
            "`{command}` exited with code {}\n{output}",
            status.code().unwrap_or(-1)
        ))),
        Err(e) => Err(InstallError::Failed(format!("failed waiting for `{command}`: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_env() -> OsString {
        std::env::var_os("PATH").unwrap_or_default()
    }

    #[test]
    fn tail_buffer_keeps_newest_text() {
        let mut buf = String::new();
        push_tail(&mut buf, "first", 13);
        push_tail(&mut buf, "second", 13);
        assert_eq!(buf, "first\nsecond\n");
        push_tail(&mut buf, "third", 13);
        assert_eq!(buf, "second\nthird\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn both_streams_reach_the_channel_with_env_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut child = shell_command(
            "echo out:$BROWSER; echo err:$FORCE_COLOR >&2",
            tmp.path(),
            &path_env(),
        )
        .spawn()
        .unwrap();
        let mut rx = forward_output(&mut child);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["err:0".to_string(), "out:none".to_string()]);
        assert!(child.wait().await.unwrap().success());
    }

    fn limits(timeout: Duration) -> InstallLimits {
        InstallLimits {
            timeout,
            stop_grace: Duration::from_millis(200),
            stop_ceiling: Duration::from_secs(3),
        }
    }

    fn failure(err: InstallError<()>) -> String {
        match err {
            InstallError::Failed(detail) => detail,
            InstallError::Cancelled(()) => panic!("install was cancelled"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_streams_output_and_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (_cancel_tx, mut cancel) = mpsc::unbounded_channel::<()>();
        let mut seen = Vec::new();
        let ok = run_install(
            "echo fetching; touch installed",
            tmp.path(),
            &path_env(),
            limits(Duration::from_secs(5)),
            &mut cancel,
            |line| seen.push(line.to_string()),
        )
        .await;
        assert!(ok.is_ok());
        assert_eq!(seen, vec!["fetching".to_string()]);
        assert!(tmp.path().join("installed").exists());

        let err = run_install(
            "echo 'E404 not found' >&2; exit 3",
            tmp.path(),
            &path_env(),
            limits(Duration::from_secs(5)),
            &mut cancel,
            |_| {},
        )
        .await
        .unwrap_err();
        let detail = failure(err);
        assert!(detail.contains("code 3"));
        assert!(detail.contains("E404"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_timeout_kills_the_command() {
        let tmp = tempfile::tempdir().unwrap();
        let (_cancel_tx, mut cancel) = mpsc::unbounded_channel::<()>();
        let err = run_install(
            "sleep 30",
            tmp.path(),
            &path_env(),
            limits(Duration::from_millis(200)),
            &mut cancel,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(failure(err).contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_install_stops_its_whole_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let (cancel_tx, mut cancel) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = cancel_tx.send("stop");
        });

        let started = std::time::Instant::now();
        let err = run_install(
            "sleep 2; touch finished",
            tmp.path(),
            &path_env(),
            limits(Duration::from_secs(30)),
            &mut cancel,
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled("stop")));
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!tmp.path().join("finished").exists());
    }
}
