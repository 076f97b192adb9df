//! Platform-aware process termination.
//!
//! Dev servers are started as process-group leaders so that stopping one also
//! stops the bundler workers and file watchers it forks.

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Poll interval while waiting for a non-child process to disappear.
const EXIT_POLL: Duration = Duration::from_millis(50);

#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillErrorKind {
    NoSuchProcess,
    PermissionDenied,
    Other(i32),
}

#[cfg(unix)]
fn classify_kill_error(errno: nix::errno::Errno) -> KillErrorKind {
    match errno {
        nix::errno::Errno::ESRCH => KillErrorKind::NoSuchProcess,
        nix::errno::Errno::EPERM => KillErrorKind::PermissionDenied,
        other => KillErrorKind::Other(other as i32),
    }
}

/// Returns `true` if a process with `pid` exists (even if owned by someone else).
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None::<Signal>) {
            Ok(()) => true,
            Err(e) => classify_kill_error(e) == KillErrorKind::PermissionDenied,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Session id and process group id of `pid`, or `None` once it is gone.
pub fn session_and_group(pid: u32) -> Option<(u32, u32)> {
    #[cfg(unix)]
    {
        use nix::unistd::{getpgid, getsid, Pid};

        let pid = Pid::from_raw(i32::try_from(pid).ok()?);
        let sid = getsid(Some(pid)).ok()?;
        let pgid = getpgid(Some(pid)).ok()?;
        Some((
            u32::try_from(sid.as_raw()).ok()?,
            u32::try_from(pgid.as_raw()).ok()?,
        ))
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        None
    }
}

/// Terminate an arbitrary process by PID: SIGTERM, wait up to `grace` for it
/// to go away, then SIGKILL. Returns once the process is gone or SIGKILL has
/// been sent.
pub async fn terminate_process(pid: u32, grace: Duration) {
    debug!(pid, "terminating process");

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);

        if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
            match classify_kill_error(e) {
                KillErrorKind::NoSuchProcess => {
                    debug!(pid, "process already exited before SIGTERM");
                    return;
                }
                KillErrorKind::PermissionDenied => {
                    warn!(pid, "permission denied sending SIGTERM");
                    return;
                }
                KillErrorKind::Other(errno) => {
                    warn!(pid, errno, "failed sending SIGTERM");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !process_exists(pid) {
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL failed (process may have already exited)");
        }
    }

    #[cfg(windows)]
    {
        let _ = grace;
        let output = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await;

        match output {
            Ok(o) if !o.status.success() => {
                let stderr = String::from_utf8_lossy(&o.stderr);
                debug!(pid, %stderr, "taskkill failed (process may have already exited)");
            }
            Err(e) => {
                debug!(pid, error = %e, "failed to execute taskkill");
            }
            _ => {}
        }
    }
}

/// Stop a supervised child and everything in its process group.
///
/// SIGTERM to the group, up to `grace` for the child to exit, then SIGKILL to
/// the group, then up to `ceiling` in total. Returns whether the exit was
/// confirmed. Never waits longer than `ceiling`.
pub async fn terminate_child_tree(child: &mut Child, grace: Duration, ceiling: Duration) -> bool {
    let Some(pid) = child.id() else {
        // Already reaped.
        return true;
    };
    let started = tokio::time::Instant::now();

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);
        if let Err(e) = signal::killpg(group, Signal::SIGTERM) {
            match classify_kill_error(e) {
                KillErrorKind::NoSuchProcess => {
                    debug!(pid, "process group already exited before SIGTERM");
                }
                KillErrorKind::PermissionDenied => {
                    warn!(pid, "permission denied sending SIGTERM to process group");
                    let _ = child.start_kill();
                }
                KillErrorKind::Other(errno) => {
                    warn!(
                        pid,
                        errno, "failed sending SIGTERM to process group; falling back to child.kill"
                    );
                    let _ = child.start_kill();
                }
            }
        }

        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            // The leader is gone; make sure no stragglers keep the port bound.
            let _ = signal::killpg(group, Signal::SIGKILL);
            return true;
        }

        debug!(pid, "escalating to SIGKILL");
        if let Err(e) = signal::killpg(group, Signal::SIGKILL) {
            debug!(pid, error = %e, "SIGKILL to process group failed");
        }
    }

    #[cfg(not(unix))]
    {
        terminate_process(pid, grace).await;
    }

    let _ = child.start_kill();
    let remaining = ceiling.saturating_sub(started.elapsed());
    match tokio::time::timeout(remaining, child.wait()).await {
        Ok(_) => true,
        Err(_) => {
            warn!(pid, "process did not confirm exit before the stop ceiling");
            false
        }
    }
}
