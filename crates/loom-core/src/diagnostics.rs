//! Descriptor-table diagnostics for the transient descriptor fault.
//!
//! Everything here inspects the process through the filesystem and `fstat`
//! only. Spawning `lsof` or similar would create exactly the kind of child that
//! trips over leaked descriptors.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::config::DiagnosticsConfig;

/// Receives a notification the first time a retry chain hits the transient
/// descriptor fault.
pub trait FaultRecorder: Send + Sync {
    fn record(&self, context: &str, queue_depth: usize, handle_count: usize);
}

/// Recorder that drops everything. Used where diagnostics are not wanted.
pub struct NoopRecorder;

impl FaultRecorder for NoopRecorder {
    fn record(&self, _context: &str, _queue_depth: usize, _handle_count: usize) {}
}

/// Per-type descriptor counts. When the table was larger than the sample
/// limit, counts are scaled up from the sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorBreakdown {
    pub pipes: usize,
    pub sockets: usize,
    pub files: usize,
    pub directories: usize,
    pub char_devices: usize,
    pub other: usize,
    /// Descriptors that vanished between listing and `fstat`.
    pub closed: usize,
    pub sampled: usize,
    pub scaled: bool,
}

/// One emitted diagnostics record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorReport {
    pub context: String,
    pub queue_depth: usize,
    pub handle_count: usize,
    pub open_descriptors: Option<usize>,
    pub breakdown: Option<DescriptorBreakdown>,
}

/// Throttled descriptor-table recorder.
///
/// Emits at most once per throttle interval. The first emission of a
/// recorder's lifetime also carries a per-type breakdown.
pub struct DescriptorDiagnostics {
    throttle: Duration,
    sample_limit: usize,
    last_emit: Mutex<Option<Instant>>,
    breakdown_done: AtomicBool,
}

impl DescriptorDiagnostics {
    pub fn new(throttle: Duration, sample_limit: usize) -> Self {
        Self {
            throttle,
            sample_limit: sample_limit.max(1),
            last_emit: Mutex::new(None),
            breakdown_done: AtomicBool::new(false),
        }
    }

    pub fn from_config(cfg: &DiagnosticsConfig) -> Self {
        Self::new(Duration::from_millis(cfg.throttle_ms), cfg.sample_limit)
    }

    /// Record a fault occurrence. Returns the report that was logged, or
    /// `None` when the call fell inside the throttle interval.
    pub fn capture(
        &self,
        context: &str,
        queue_depth: usize,
        handle_count: usize,
    ) -> Option<DescriptorReport> {
        {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.throttle {
                    return None;
                }
            }
            *last = Some(now);
        }

        let descriptors = list_open_descriptors();
        let open_descriptors = descriptors.as_ref().map(Vec::len);

        let breakdown = if self.breakdown_done.swap(true, Ordering::SeqCst) {
            None
        } else {
            descriptors
                .as_deref()
                .map(|fds| categorize(fds, self.sample_limit))
        };

        let report = DescriptorReport {
            context: context.to_string(),
            queue_depth,
            handle_count,
            open_descriptors,
            breakdown,
        };

        match &report.breakdown {
            Some(b) => warn!(
                context,
                queue_depth,
                handle_count,
                open_descriptors = ?open_descriptors,
                pipes = b.pipes,
                sockets = b.sockets,
                files = b.files,
                directories = b.directories,
                char_devices = b.char_devices,
                other = b.other,
                closed = b.closed,
                sampled = b.sampled,
                scaled = b.scaled,
                "transient descriptor fault; descriptor table breakdown"
            ),
            None => warn!(
                context,
                queue_depth,
                handle_count,
                open_descriptors = ?open_descriptors,
                "transient descriptor fault"
            ),
        }

        Some(report)
    }
}

impl Default for DescriptorDiagnostics {
    fn default() -> Self {
        Self::from_config(&DiagnosticsConfig::default())
    }
}

impl FaultRecorder for DescriptorDiagnostics {
    fn record(&self, context: &str, queue_depth: usize, handle_count: usize) {
        let _ = self.capture(context, queue_depth, handle_count);
    }
}

/// List this process's open descriptor numbers without spawning anything.
///
/// Returns `None` on platforms with no descriptor directory.
pub fn list_open_descriptors() -> Option<Vec<i32>> {
    let dir = if Path::new("/proc/self/fd").is_dir() {
        "/proc/self/fd"
    } else if Path::new("/dev/fd").is_dir() {
        "/dev/fd"
    } else {
        return None;
    };

    // Collect before returning so the directory's own descriptor is closed
    // by the time callers stat the entries.
    let mut fds: Vec<i32> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    fds.sort_unstable();
    Some(fds)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorKind {
    Pipe,
    Socket,
    File,
    Directory,
    CharDevice,
    Other,
    Closed,
}

#[cfg(unix)]
fn descriptor_kind(fd: i32) -> DescriptorKind {
    // SAFETY: `fstat` only writes into the zeroed buffer we hand it and does
    // not take ownership of `fd`.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return DescriptorKind::Closed;
    }
    match stat.st_mode & libc::S_IFMT {
        libc::S_IFIFO => DescriptorKind::Pipe,
        libc::S_IFSOCK => DescriptorKind::Socket,
        libc::S_IFREG => DescriptorKind::File,
        libc::S_IFDIR => DescriptorKind::Directory,
        libc::S_IFCHR => DescriptorKind::CharDevice,
        _ => DescriptorKind::Other,
    }
}

#[cfg(not(unix))]
fn descriptor_kind(_fd: i32) -> DescriptorKind {
    DescriptorKind::Other
}

/// Categorize at most `sample_limit` descriptors, spread evenly across the
/// table, and scale the counts back up to the full table size.
fn categorize(fds: &[i32], sample_limit: usize) -> DescriptorBreakdown {
    let total = fds.len();
    let stride = total.div_ceil(sample_limit).max(1);
    let sample: Vec<i32> = fds.iter().copied().step_by(stride).collect();

    let mut counts = DescriptorBreakdown {
        sampled: sample.len(),
        scaled: stride > 1,
        ..Default::default()
    };
    for fd in &sample {
        let slot = match descriptor_kind(*fd) {
            DescriptorKind::Pipe => &mut counts.pipes,
            DescriptorKind::Socket => &mut counts.sockets,
            DescriptorKind::File => &mut counts.files,
            DescriptorKind::Directory => &mut counts.directories,
            DescriptorKind::CharDevice => &mut counts.char_devices,
            DescriptorKind::Other => &mut counts.other,
            DescriptorKind::Closed => &mut counts.closed,
        };
        *slot += 1;
    }

    if counts.scaled && !sample.is_empty() {
        let scale = |n: usize| (n * total + sample.len() / 2) / sample.len();
        counts.pipes = scale(counts.pipes);
        counts.sockets = scale(counts.sockets);
        counts.files = scale(counts.files);
        counts.directories = scale(counts.directories);
        counts.char_devices = scale(counts.char_devices);
        counts.other = scale(counts.other);
        counts.closed = scale(counts.closed);
    }

    counts
}
