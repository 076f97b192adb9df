use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::classify::{classify_exit, extract_port_hint, extract_ready_url, ExitCause};
use super::crash::CrashHistory;
use super::launch::{
    forward_output, push_tail, run_install, shell_command, InstallError, InstallLimits,
    OUTPUT_TAIL_BYTES,
};
use super::port::free_port;
use super::probe::{candidate_ports, port_of_url, probe_ports};
use super::project::resolve_commands;
use super::{
    DevServerError, DevServerEvent, DevServerPolicy, DevServerStage, DevServerStatus,
    StartOutcome,
};
use crate::diagnostics::{FaultRecorder, NoopRecorder};
use crate::error::excerpt;
use crate::fault::is_transient_descriptor_fault;
use crate::platform::paths::augmented_path;
use crate::platform::process::terminate_child_tree;
use crate::repo::root::absolute;
use crate::spawn_gate::SpawnGate;

const EVENT_CAPACITY: usize = 1024;

/// How long to keep reading buffered output after the process has exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

/// Slack on top of the stop ceiling for the monitor to report back.
const STOP_MARGIN: Duration = Duration::from_secs(1);

type StopReply = oneshot::Sender<()>;
type Lines = mpsc::UnboundedReceiver<String>;

/// One live (or starting) dev server.
struct Entry {
    generation: u64,
    stage: DevServerStage,
    url: Option<String>,
    pid: Option<u32>,
    stop_tx: mpsc::UnboundedSender<StopReply>,
}

struct Inner {
    policy: DevServerPolicy,
    processes: Mutex<HashMap<PathBuf, Entry>>,
    crashes: CrashHistory,
    gate: Arc<SpawnGate>,
    recorder: Arc<dyn FaultRecorder>,
    events: broadcast::Sender<DevServerEvent>,
    next_generation: AtomicU64,
}

/// How one attempt's wait for readiness ended.
enum Watch {
    Ready(String),
    TimedOut { hint: Option<u16> },
    Exited { code: Option<i32>, output: String },
    Stopped(StopReply),
}

/// Owns at most one dev server per project path.
///
/// Cloning is cheap; clones share the same process table, crash history and
/// event stream.
#[derive(Clone)]
pub struct DevServerSupervisor {
    inner: Arc<Inner>,
}

impl DevServerSupervisor {
    pub fn new(
        policy: DevServerPolicy,
        gate: Arc<SpawnGate>,
        recorder: Arc<dyn FaultRecorder>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let crashes = CrashHistory::new(policy.crash_window, policy.max_crashes);
        Self {
            inner: Arc::new(Inner {
                policy,
                processes: Mutex::new(HashMap::new()),
                crashes,
                gate,
                recorder,
                events,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Supervisor with its own spawn gate and no fault recorder.
    pub fn with_policy(policy: DevServerPolicy) -> Self {
        Self::new(policy, Arc::new(SpawnGate::default()), Arc::new(NoopRecorder))
    }

    pub fn policy(&self) -> &DevServerPolicy {
        &self.inner.policy
    }

    /// Status, output and exit events for every project.
    pub fn subscribe(&self) -> broadcast::Receiver<DevServerEvent> {
        self.inner.events.subscribe()
    }

    /// Start the dev server for `project`.
    ///
    /// `command` overrides the configured and detected start command. Resolves
    /// once the server is ready (with or without a confirmed URL) or the
    /// attempt loop gives up. A second start for a project that already has an
    /// entry is rejected with [`DevServerError::AlreadyRunning`].
    pub async fn start(
        &self,
        project: &Path,
        command: Option<&str>,
    ) -> Result<StartOutcome, DevServerError> {
        let project = absolute(project);

        let crashes = self.inner.crashes.count(&project);
        if crashes >= self.inner.policy.max_crashes {
            let err = DevServerError::CrashLoop {
                crashes,
                window_secs: self.inner.crashes.window().as_secs(),
            };
            warn!(project = %project.display(), crashes, "refusing to start crash-looping dev server");
            self.emit_status(&project, DevServerStage::Error, err.to_string(), None);
            return Err(err);
        }

        let (generation, stop_rx) = self.reserve(&project)?;
        let result = self.run_attempts(&project, generation, stop_rx, command).await;
        if let Err(e) = &result {
            if !matches!(e, DevServerError::Stopped) {
                self.emit_status(&project, DevServerStage::Error, e.to_string(), None);
            }
            self.release(&project, generation);
        }
        result
    }

    /// Stop one project's server, or every server when `project` is `None`.
    ///
    /// Resolves once termination is confirmed or the stop ceiling has passed.
    pub async fn stop(&self, project: Option<&Path>) {
        match project {
            Some(project) => self.stop_one(&absolute(project)).await,
            None => {
                let projects = self.running_projects();
                let mut stops = JoinSet::new();
                for project in projects {
                    let this = self.clone();
                    stops.spawn(async move { this.stop_one(&project).await });
                }
                while stops.join_next().await.is_some() {}
            }
        }
    }

    pub fn status(&self, project: &Path) -> DevServerStatus {
        let project = absolute(project);
        let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        match processes.get(&project) {
            Some(entry) => DevServerStatus {
                running: true,
                url: entry.url.clone(),
                stage: Some(entry.stage),
                pid: entry.pid,
            },
            None => DevServerStatus::default(),
        }
    }

    pub fn clear_crash_history(&self, project: &Path) {
        let project = absolute(project);
        self.inner.crashes.clear(&project);
        info!(project = %project.display(), "cleared crash history");
    }

    pub fn crash_count(&self, project: &Path) -> usize {
        self.inner.crashes.count(&absolute(project))
    }

    pub fn running_projects(&self) -> Vec<PathBuf> {
        let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes.keys().cloned().collect()
    }

    fn reserve(
        &self,
        project: &Path,
    ) -> Result<(u64, mpsc::UnboundedReceiver<StopReply>), DevServerError> {
        let mut processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        if processes.contains_key(project) {
            return Err(DevServerError::AlreadyRunning);
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        processes.insert(
            project.to_path_buf(),
            Entry {
                generation,
                stage: DevServerStage::Starting,
                url: None,
                pid: None,
                stop_tx,
            },
        );
        Ok((generation, stop_rx))
    }

    /// Drop the entry for `project` if it still belongs to `generation`.
    fn release(&self, project: &Path, generation: u64) {
        let mut processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        if processes
            .get(project)
            .is_some_and(|entry| entry.generation == generation)
        {
            processes.remove(project);
        }
    }

    /// Record the pid of a fresh attempt. `false` if the entry is gone.
    fn attach_pid(&self, project: &Path, generation: u64, pid: Option<u32>) -> bool {
        let mut processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        match processes.get_mut(project) {
            Some(entry) if entry.generation == generation => {
                entry.pid = pid;
                true
            }
            _ => false,
        }
    }

    /// Session leaders of servers supervised for other projects. Every
    /// supervised shell calls `setsid`, so its descendants share its session.
    fn protected_pids(&self, project: &Path) -> Vec<u32> {
        let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes
            .iter()
            .filter(|(path, _)| path.as_path() != project)
            .filter_map(|(_, entry)| entry.pid)
            .collect()
    }

    /// Ports already claimed by other projects' detected URLs.
    fn claimed_ports(&self, project: &Path) -> Vec<u16> {
        let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
        processes
            .iter()
            .filter(|(path, _)| path.as_path() != project)
            .filter_map(|(_, entry)| entry.url.as_deref().and_then(port_of_url))
            .collect()
    }

    fn transition(
        &self,
        project: &Path,
        generation: u64,
        stage: DevServerStage,
        message: impl Into<String>,
        url: Option<String>,
    ) {
        {
            let mut processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = processes.get_mut(project) {
                if entry.generation == generation {
                    entry.stage = stage;
                }
            }
        }
        self.emit_status(project, stage, message, url);
    }

    fn emit_status(
        &self,
        project: &Path,
        stage: DevServerStage,
        message: impl Into<String>,
        url: Option<String>,
    ) {
        let message = message.into();
        debug!(project = %project.display(), %stage, %message, "dev server stage");
        let _ = self.inner.events.send(DevServerEvent::Status {
            project_path: project.to_path_buf(),
            stage,
            message,
            url,
        });
    }

    fn emit_output(&self, project: &Path, text: &str) {
        let _ = self.inner.events.send(DevServerEvent::Output {
            project_path: project.to_path_buf(),
            text: text.to_string(),
        });
    }

    fn note_descriptor_fault(&self, recorded: &mut bool) {
        if *recorded {
            return;
        }
        *recorded = true;
        let live = {
            let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
            processes.len()
        };
        self.inner.recorder.record("devserver.start", 0, live);
    }

    async fn run_attempts(
        &self,
        project: &Path,
        generation: u64,
        mut stop_rx: mpsc::UnboundedReceiver<StopReply>,
        command: Option<&str>,
    ) -> Result<StartOutcome, DevServerError> {
        let policy = &self.inner.policy;
        let commands = resolve_commands(
            project,
            command,
            policy.command.as_deref(),
            policy.install_command.as_deref(),
        )
        .ok_or(DevServerError::NoCommand)?;
        let path_env = augmented_path(std::env::var_os("PATH"), &policy.extra_path_dirs);

        self.transition(
            project,
            generation,
            DevServerStage::Starting,
            format!("Starting `{}`", commands.start),
            None,
        );

        let mut installed = false;
        let mut recorded_fault = false;
        let mut last_output = String::new();

        for attempt in 1..=policy.max_attempts {
            if let Ok(reply) = stop_rx.try_recv() {
                let _ = reply.send(());
                return Err(DevServerError::Stopped);
            }
            self.inner.gate.wait().await;

            let mut child = match shell_command(&commands.start, project, &path_env).spawn() {
                Ok(child) => child,
                Err(e) if is_transient_descriptor_fault(&e) => {
                    warn!(project = %project.display(), attempt, error = %e, "transient descriptor fault while spawning");
                    self.note_descriptor_fault(&mut recorded_fault);
                    self.transition(
                        project,
                        generation,
                        DevServerStage::Retrying,
                        "Spawn hit a bad file descriptor; retrying",
                        None,
                    );
                    last_output = e.to_string();
                    tokio::time::sleep(policy.bad_descriptor_delay).await;
                    continue;
                }
                Err(e) => return Err(DevServerError::Spawn(e)),
            };

            let pid = child.id();
            if !self.attach_pid(project, generation, pid) {
                terminate_child_tree(&mut child, policy.stop_grace, policy.stop_ceiling).await;
                return Err(DevServerError::Stopped);
            }
            info!(project = %project.display(), attempt, pid, "dev server spawned");
            let mut lines = forward_output(&mut child);

            match self
                .watch_startup(project, &mut child, &mut lines, &mut stop_rx)
                .await
            {
                Watch::Ready(url) => {
                    return self
                        .become_ready(project, generation, child, lines, stop_rx, Some(url))
                        .await;
                }
                Watch::TimedOut { hint } => {
                    debug!(project = %project.display(), ?hint, "no URL in output; probing ports");
                    let url = self.probe_for_url(project, hint).await;
                    return self
                        .become_ready(project, generation, child, lines, stop_rx, url)
                        .await;
                }
                Watch::Stopped(reply) => {
                    terminate_child_tree(&mut child, policy.stop_grace, policy.stop_ceiling).await;
                    let _ = self.inner.events.send(DevServerEvent::Exited {
                        project_path: project.to_path_buf(),
                        exit_code: None,
                    });
                    let _ = reply.send(());
                    return Err(DevServerError::Stopped);
                }
                Watch::Exited { code, output } => {
                    let cause = classify_exit(&output);
                    debug!(project = %project.display(), attempt, ?code, ?cause, "dev server exited during startup");
                    match cause {
                        ExitCause::MissingDeps if !installed => {
                            installed = true;
                            self.install(
                                project,
                                generation,
                                &commands.install,
                                &path_env,
                                &mut stop_rx,
                            )
                            .await?;
                        }
                        ExitCause::PortInUse { port: Some(port) } => {
                            self.transition(
                                project,
                                generation,
                                DevServerStage::KillingPort,
                                format!("Port {port} is in use; freeing it"),
                                None,
                            );
                            let protected = self.protected_pids(project);
                            free_port(port, &protected, policy.stop_grace).await;
                            tokio::time::sleep(policy.port_release_delay).await;
                            self.transition(
                                project,
                                generation,
                                DevServerStage::Retrying,
                                format!("Retrying after freeing port {port}"),
                                None,
                            );
                        }
                        ExitCause::BadDescriptor => {
                            warn!(project = %project.display(), attempt, "dev server hit a bad file descriptor; retrying");
                            self.note_descriptor_fault(&mut recorded_fault);
                            self.transition(
                                project,
                                generation,
                                DevServerStage::Retrying,
                                "Bad file descriptor; retrying",
                                None,
                            );
                            tokio::time::sleep(policy.bad_descriptor_delay).await;
                        }
                        _ => {
                            let crashes = self.inner.crashes.record(project);
                            warn!(project = %project.display(), ?code, crashes, "dev server crashed during startup");
                            return Err(DevServerError::Crashed {
                                exit_code: code,
                                detail: excerpt(&output, policy.excerpt_bytes),
                            });
                        }
                    }
                    last_output = output;
                }
            }
        }

        Err(DevServerError::AttemptsExhausted {
            attempts: policy.max_attempts,
            detail: excerpt(&last_output, policy.excerpt_bytes),
        })
    }

    /// Wait for a URL, an exit, a stop request or the startup timeout.
    async fn watch_startup(
        &self,
        project: &Path,
        child: &mut Child,
        lines: &mut Lines,
        stop_rx: &mut mpsc::UnboundedReceiver<StopReply>,
    ) -> Watch {
        let deadline = tokio::time::Instant::now() + self.inner.policy.startup_timeout;
        let mut output = String::new();
        let mut lines_open = true;
        let mut stop_open = true;

        loop {
            tokio::select! {
                biased;

                request = stop_rx.recv(), if stop_open => match request {
                    Some(reply) => return Watch::Stopped(reply),
                    None => stop_open = false,
                },
                line = lines.recv(), if lines_open => match line {
                    Some(line) => {
                        self.emit_output(project, &line);
                        push_tail(&mut output, &line, OUTPUT_TAIL_BYTES);
                        if let Some(url) = extract_ready_url(&line) {
                            return Watch::Ready(url);
                        }
                    }
                    None => lines_open = false,
                },
                status = child.wait() => {
                    while let Ok(Some(line)) = tokio::time::timeout(DRAIN_WINDOW, lines.recv()).await {
                        self.emit_output(project, &line);
                        push_tail(&mut output, &line, OUTPUT_TAIL_BYTES);
                    }
                    let code = status.ok().and_then(|s| s.code());
                    return Watch::Exited { code, output };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Watch::TimedOut { hint: extract_port_hint(&output) };
                }
            }
        }
    }

    async fn install(
        &self,
        project: &Path,
        generation: u64,
        command: &str,
        path_env: &std::ffi::OsString,
        stop_rx: &mut mpsc::UnboundedReceiver<StopReply>,
    ) -> Result<(), DevServerError> {
        let policy = &self.inner.policy;
        self.transition(
            project,
            generation,
            DevServerStage::Installing,
            format!("Installing dependencies with `{command}`"),
            None,
        );
        info!(project = %project.display(), command, "installing dependencies");

        let events = self.inner.events.clone();
        let project_path = project.to_path_buf();
        let limits = InstallLimits {
            timeout: policy.install_timeout,
            stop_grace: policy.stop_grace,
            stop_ceiling: policy.stop_ceiling,
        };
        let result = run_install(command, project, path_env, limits, stop_rx, |line| {
            let _ = events.send(DevServerEvent::Output {
                project_path: project_path.clone(),
                text: line.to_string(),
            });
        })
        .await;
        match result {
            Ok(()) => {}
            Err(InstallError::Cancelled(reply)) => {
                info!(project = %project.display(), "install stopped");
                let _ = self.inner.events.send(DevServerEvent::Exited {
                    project_path: project.to_path_buf(),
                    exit_code: None,
                });
                let _ = reply.send(());
                return Err(DevServerError::Stopped);
            }
            Err(InstallError::Failed(detail)) => {
                return Err(DevServerError::InstallFailed {
                    detail: excerpt(&detail, policy.excerpt_bytes),
                });
            }
        }

        self.transition(
            project,
            generation,
            DevServerStage::Starting,
            "Dependencies installed; starting again",
            None,
        );
        Ok(())
    }

    async fn probe_for_url(&self, project: &Path, hint: Option<u16>) -> Option<String> {
        let excluded = self.claimed_ports(project);
        let ports = candidate_ports(hint, &self.inner.policy.probe_ports, &excluded);
        let url = probe_ports(&ports, self.inner.policy.probe_timeout).await;
        match &url {
            Some(url) => info!(project = %project.display(), url, "found dev server by probing"),
            None => warn!(project = %project.display(), "no URL detected; assuming the server is up"),
        }
        url
    }

    async fn become_ready(
        &self,
        project: &Path,
        generation: u64,
        mut child: Child,
        lines: Lines,
        stop_rx: mpsc::UnboundedReceiver<StopReply>,
        url: Option<String>,
    ) -> Result<StartOutcome, DevServerError> {
        let pid = child.id();
        let attached = {
            let mut processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
            match processes.get_mut(project) {
                Some(entry) if entry.generation == generation => {
                    entry.url = url.clone();
                    true
                }
                _ => false,
            }
        };
        if !attached {
            let policy = &self.inner.policy;
            terminate_child_tree(&mut child, policy.stop_grace, policy.stop_ceiling).await;
            return Err(DevServerError::Stopped);
        }

        let message = match &url {
            Some(url) => format!("Ready at {url}"),
            None => "Server is running but no URL was detected".to_string(),
        };
        self.transition(project, generation, DevServerStage::Ready, message, url.clone());
        info!(project = %project.display(), pid, url = ?url, "dev server ready");

        let this = self.clone();
        let project_path = project.to_path_buf();
        tokio::spawn(async move {
            this.monitor(project_path, generation, child, lines, stop_rx)
                .await;
        });

        Ok(StartOutcome { url, pid })
    }

    /// Forward output until the process exits or a stop request arrives,
    /// then drop the entry and announce the exit.
    async fn monitor(
        self,
        project: PathBuf,
        generation: u64,
        mut child: Child,
        mut lines: Lines,
        mut stop_rx: mpsc::UnboundedReceiver<StopReply>,
    ) {
        let policy = &self.inner.policy;
        let mut lines_open = true;
        let mut stop_open = true;
        let mut reply: Option<StopReply> = None;

        let exit_code = loop {
            tokio::select! {
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.emit_output(&project, &line),
                    None => lines_open = false,
                },
                status = child.wait() => {
                    while let Ok(Some(line)) = tokio::time::timeout(DRAIN_WINDOW, lines.recv()).await {
                        self.emit_output(&project, &line);
                    }
                    break status.ok().and_then(|s| s.code());
                }
                request = stop_rx.recv(), if stop_open => match request {
                    Some(request) => {
                        info!(project = %project.display(), "stopping dev server");
                        terminate_child_tree(&mut child, policy.stop_grace, policy.stop_ceiling).await;
                        reply = Some(request);
                        break child.try_wait().ok().flatten().and_then(|s| s.code());
                    }
                    None => stop_open = false,
                },
            }
        };

        self.release(&project, generation);
        info!(project = %project.display(), ?exit_code, "dev server exited");
        let _ = self.inner.events.send(DevServerEvent::Exited {
            project_path: project,
            exit_code,
        });
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn stop_one(&self, project: &Path) {
        let target = {
            let processes = self.inner.processes.lock().unwrap_or_else(|e| e.into_inner());
            processes
                .get(project)
                .map(|entry| (entry.generation, entry.stop_tx.clone()))
        };
        let Some((generation, stop_tx)) = target else {
            debug!(project = %project.display(), "no dev server to stop");
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if stop_tx.send(reply_tx).is_ok() {
            let wait = self.inner.policy.stop_ceiling + STOP_MARGIN;
            if tokio::time::timeout(wait, reply_rx).await.is_err() {
                warn!(project = %project.display(), "dev server did not confirm stop in time; releasing it anyway");
            }
        }
        self.release(project, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DevServerPolicy {
        DevServerPolicy {
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(300),
            stop_ceiling: Duration::from_secs(3),
            port_release_delay: Duration::from_millis(10),
            bad_descriptor_delay: Duration::from_millis(10),
            ..DevServerPolicy::default()
        }
    }

    #[tokio::test]
    async fn missing_command_is_reported_and_slot_released() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = DevServerSupervisor::with_policy(policy());
        let mut events = supervisor.subscribe();

        let err = supervisor.start(tmp.path(), None).await.unwrap_err();
        assert!(matches!(err, DevServerError::NoCommand));
        assert!(!supervisor.status(tmp.path()).running);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            DevServerEvent::Status {
                stage: DevServerStage::Error,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_for_same_project_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = DevServerSupervisor::with_policy(policy());

        let outcome = supervisor
            .start(tmp.path(), Some("echo http://localhost:45123/; sleep 30"))
            .await
            .unwrap();
        assert_eq!(outcome.url.as_deref(), Some("http://localhost:45123/"));

        let err = supervisor
            .start(tmp.path(), Some("echo again; sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, DevServerError::AlreadyRunning));

        supervisor.stop(Some(tmp.path())).await;
        assert!(!supervisor.status(tmp.path()).running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bad_descriptor_exits_are_retried_without_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = DevServerSupervisor::with_policy(policy());

        let cmd = "if [ ! -f tried ]; then touch tried; echo 'spawn EBADF' >&2; exit 1; fi; \
                   echo 'Local: http://127.0.0.1:45124'; sleep 30";
        let outcome = supervisor.start(tmp.path(), Some(cmd)).await.unwrap();
        assert_eq!(outcome.url.as_deref(), Some("http://localhost:45124/"));
        assert_eq!(supervisor.crash_count(tmp.path()), 0);

        supervisor.stop(None).await;
        assert!(supervisor.running_projects().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repeated_remediable_exits_exhaust_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = DevServerSupervisor::with_policy(DevServerPolicy {
            max_attempts: 2,
            ..policy()
        });

        let err = supervisor
            .start(tmp.path(), Some("echo 'Bad file descriptor' >&2; exit 1"))
            .await
            .unwrap_err();
        match err {
            DevServerError::AttemptsExhausted { attempts, detail } => {
                assert_eq!(attempts, 2);
                assert!(detail.contains("Bad file descriptor"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(supervisor.crash_count(tmp.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_after_ready_is_announced_and_not_a_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = DevServerSupervisor::with_policy(policy());
        let mut events = supervisor.subscribe();

        supervisor
            .start(
                tmp.path(),
                Some("echo http://localhost:45125/; sleep 0.3; exit 7"),
            )
            .await
            .unwrap();

        let exit_code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(DevServerEvent::Exited { exit_code, .. }) = events.recv().await {
                    return exit_code;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(exit_code, Some(7));
        assert!(!supervisor.status(tmp.path()).running);
        assert_eq!(supervisor.crash_count(tmp.path()), 0);
    }
}
