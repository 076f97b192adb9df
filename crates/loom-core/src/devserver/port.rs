//! Find and stop whatever is listening on a TCP port.
//!
//! On Linux the socket table is read straight from `/proc`, so freeing a port
//! never spawns anything. Other unix systems fall back to `lsof -t`.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::platform::process::{session_and_group, terminate_process};

/// TCP state code for LISTEN in `/proc/net/tcp`.
#[cfg(any(target_os = "linux", test))]
const TCP_LISTEN: &str = "0A";

/// Socket inodes listening on `port` in a `/proc/net/tcp`-format table.
#[cfg(any(target_os = "linux", test))]
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, hex_port) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(hex_port, 16).ok()?;
            if local_port != port || !state.eq_ignore_ascii_case(TCP_LISTEN) {
                return None;
            }
            inode.parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

/// Inode from a `socket:[12345]` fd link target.
#[cfg(any(target_os = "linux", test))]
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn owners_from_proc(port: u16) -> Vec<u32> {
    let mut inodes: Vec<u64> = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(raw) = std::fs::read_to_string(table) {
            inodes.extend(listening_inodes(&raw, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let Ok(procs) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = Vec::new();
    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' processes are unreadable; skip them quietly.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|target| socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn owners_from_lsof(port: u16) -> Vec<u32> {
    let Ok(lsof) = which::which("lsof") else {
        debug!(port, "lsof not available; cannot look up port owner");
        return Vec::new();
    };
    let output = tokio::process::Command::new(lsof)
        .args(["-t", "-n", "-P", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .stdin(std::process::Stdio::null())
        .output()
        .await;
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
        Err(e) => {
            debug!(port, error = %e, "lsof failed");
            Vec::new()
        }
    }
}

/// Every pid holding a listening socket on `port`.
pub async fn listening_pids(port: u16) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    let mut pids = owners_from_proc(port);
    #[cfg(all(unix, not(target_os = "linux")))]
    let mut pids = owners_from_lsof(port).await;
    #[cfg(not(unix))]
    let mut pids: Vec<u32> = Vec::new();

    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Whether `pid` is one of `leaders` or runs inside a session or process
/// group led by one of them. Supervised servers are session leaders, so this
/// covers every descendant that has not detached itself.
fn is_shielded(pid: u32, leaders: &[u32]) -> bool {
    if leaders.contains(&pid) {
        return true;
    }
    session_and_group(pid)
        .is_some_and(|(sid, pgid)| leaders.contains(&sid) || leaders.contains(&pgid))
}

/// Terminate the processes listening on `port`, except this process and
/// anything belonging to the session leaders in `protected`. Returns the pids
/// that were signalled.
pub async fn free_port(port: u16, protected: &[u32], grace: Duration) -> Vec<u32> {
    let me = std::process::id();
    let owners = listening_pids(port).await;
    let targets: Vec<u32> = owners
        .iter()
        .copied()
        .filter(|pid| *pid != me && !is_shielded(*pid, protected))
        .collect();

    if targets.is_empty() {
        if !owners.is_empty() {
            warn!(port, ?owners, "port is held by a protected process; not killing it");
        } else {
            debug!(port, "no listening process found");
        }
        return targets;
    }

    for pid in &targets {
        info!(port, pid, "terminating process holding port");
        terminate_process(*pid, grace).await;
    }
    targets
}
