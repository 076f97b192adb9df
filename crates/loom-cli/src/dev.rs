use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use loom_core::config::LoomConfig;
use loom_core::devserver::{DevServerEvent, DevServerPolicy, DevServerSupervisor};
use loom_core::diagnostics::DescriptorDiagnostics;
use loom_core::spawn_gate::SpawnGate;

/// How long the printer gets to flush buffered events before exiting.
const FLUSH_WINDOW: Duration = Duration::from_secs(1);

/// How a `loom dev` session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevOutcome {
    FailedToStart,
    Interrupted,
    Exited(Option<i32>),
}

pub async fn run_dev(
    config: &LoomConfig,
    path: &Path,
    command: Option<&str>,
    json: bool,
    clear_crashes: bool,
) -> Result<ExitCode> {
    let supervisor = DevServerSupervisor::new(
        DevServerPolicy::from_config(&config.devserver),
        Arc::new(SpawnGate::new(Duration::from_millis(config.repo.spawn_gate_ms))),
        Arc::new(DescriptorDiagnostics::from_config(&config.diagnostics)),
    );
    if clear_crashes {
        supervisor.clear_crash_history(path);
    }

    let code = match supervise(supervisor, path, command, json).await? {
        DevOutcome::FailedToStart => ExitCode::from(1),
        DevOutcome::Interrupted => ExitCode::SUCCESS,
        DevOutcome::Exited(code) => {
            ExitCode::from(code.and_then(|c| u8::try_from(c).ok()).unwrap_or(1))
        }
    };
    Ok(code)
}

async fn supervise(
    supervisor: DevServerSupervisor,
    path: &Path,
    command: Option<&str>,
    json: bool,
) -> Result<DevOutcome> {
    let printer = tokio::spawn(print_events(supervisor.subscribe(), json));
    // Subscribed before start: the server may exit right after becoming ready.
    let exits = supervisor.subscribe();

    let outcome = match supervisor.start(path, command).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "dev server failed to start");
            finish(supervisor, printer).await;
            return Ok(DevOutcome::FailedToStart);
        }
    };
    match &outcome.url {
        Some(url) => eprintln!("dev server ready at {url} (pid {:?})", outcome.pid),
        None => eprintln!("dev server running, URL unknown (pid {:?})", outcome.pid),
    }

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            eprintln!("stopping...");
            supervisor.stop(None).await;
            DevOutcome::Interrupted
        }
        exit_code = wait_for_exit(exits) => {
            eprintln!("dev server exited with code {exit_code:?}");
            DevOutcome::Exited(exit_code)
        }
    };

    finish(supervisor, printer).await;
    Ok(result)
}

async fn wait_for_exit(mut events: broadcast::Receiver<DevServerEvent>) -> Option<i32> {
    loop {
        match events.recv().await {
            Ok(DevServerEvent::Exited { exit_code, .. }) => return exit_code,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Close the event stream and let the printer drain what is already buffered.
/// Returns how many events it printed, or `None` if it had to be cut off.
async fn finish(
    supervisor: DevServerSupervisor,
    mut printer: JoinHandle<usize>,
) -> Option<usize> {
    drop(supervisor);
    match tokio::time::timeout(FLUSH_WINDOW, &mut printer).await {
        Ok(Ok(printed)) => Some(printed),
        _ => {
            printer.abort();
            None
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<DevServerEvent>, json: bool) -> usize {
    let mut printed = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                printed += 1;
                if json {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                    continue;
                }
                match event {
                    DevServerEvent::Status {
                        stage, message, ..
                    } => eprintln!("[{stage}] {message}"),
                    DevServerEvent::Output { text, .. } => println!("{text}"),
                    DevServerEvent::Exited { .. } => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("... {skipped} events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    printed
}
