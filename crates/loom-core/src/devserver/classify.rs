//! Best-effort interpretation of dev server output.
//!
//! These are pattern matches against third-party tool output, not a contract.
//! Every function here is pure so the heuristics can be swapped or extended
//! without touching the startup protocol.

use std::sync::OnceLock;

use regex::Regex;

use crate::fault::text_signals_descriptor_fault;

/// Why a dev server exited before reporting a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Dependencies are not installed.
    MissingDeps,
    /// The port it wanted is taken. `port` is `None` if no number could be
    /// extracted from the output.
    PortInUse { port: Option<u16> },
    /// The transient descriptor fault.
    BadDescriptor,
    Unknown,
}

const MISSING_DEPS_SIGNALS: &[&str] = &[
    "cannot find module",
    "module not found",
    "err_module_not_found",
    "cannot find package",
    "could not resolve",
    "command not found",
    "is not recognized as an internal or external command",
    "node_modules missing",
];

const PORT_IN_USE_SIGNALS: &[&str] = &["eaddrinuse", "address already in use"];

/// Classify captured output from a process that exited before becoming ready.
///
/// Checked in order: missing dependencies, port in use, descriptor fault.
pub fn classify_exit(output: &str) -> ExitCause {
    let lower = output.to_ascii_lowercase();

    if MISSING_DEPS_SIGNALS.iter().any(|s| lower.contains(s)) {
        return ExitCause::MissingDeps;
    }
    if PORT_IN_USE_SIGNALS.iter().any(|s| lower.contains(s))
        || port_in_use_regex().is_match(output)
    {
        return ExitCause::PortInUse {
            port: extract_conflicting_port(output),
        };
    }
    if text_signals_descriptor_fault(output) {
        return ExitCause::BadDescriptor;
    }
    ExitCause::Unknown
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ANSI regex")
    })
}

fn ready_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(https?)://(localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})(/[^\s'\x22]*)?",
        )
        .expect("valid URL regex")
    })
}

fn port_in_use_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)port\s+:?(\d{2,5})\s+is\s+(?:already\s+)?in\s+use").expect("valid regex")
    })
}

fn conflicting_port_regexes() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?i)address already in use[^\n]*?:(\d{2,5})\b",
            r"(?i)eaddrinuse[^\n]*?:(\d{2,5})\b",
            r"(?i)port\s+:?(\d{2,5})\s+is\s+(?:already\s+)?in\s+use",
            r"(?i)(?:eaddrinuse|address already in use)[^\n]*?\bport\s+(\d{2,5})\b",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid port regex"))
        .collect()
    })
}

fn port_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\bport)[\s:=]+(\d{2,5})\b")
            .expect("valid port hint regex")
    })
}

/// Remove terminal escape sequences. Bundlers colour the port number
/// separately, which splits URLs apart if left in.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// First loopback URL with a port in `line`, host normalised to `localhost`.
pub fn extract_ready_url(line: &str) -> Option<String> {
    let clean = strip_ansi(line);
    let caps = ready_url_regex().captures(&clean)?;
    let scheme = caps.get(1)?.as_str().to_ascii_lowercase();
    let port: u16 = caps.get(3)?.as_str().parse().ok()?;
    let path = caps.get(4).map(|m| m.as_str()).unwrap_or("/");
    Some(format!("{scheme}://localhost:{port}{path}"))
}

/// Port named in an address-in-use error, if any.
pub fn extract_conflicting_port(output: &str) -> Option<u16> {
    let clean = strip_ansi(output);
    conflicting_port_regexes()
        .iter()
        .filter_map(|re| re.captures(&clean))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .find(|port| *port > 0)
}

/// Any port the output mentions; used to order active probes.
pub fn extract_port_hint(output: &str) -> Option<u16> {
    let clean = strip_ansi(output);
    port_hint_regex()
        .captures_iter(&clean)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .find(|port| *port > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_effort_vite_url_with_colour_codes() {
        let line = "  \x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m";
        assert_eq!(
            extract_ready_url(line).as_deref(),
            Some("http://localhost:5173/")
        );
    }

    #[test]
    fn best_effort_next_and_wildcard_hosts() {
        assert_eq!(
            extract_ready_url("- Local:        http://localhost:3000").as_deref(),
            Some("http://localhost:3000/")
        );
        assert_eq!(
            extract_ready_url("Listening on http://0.0.0.0:8080/app").as_deref(),
            Some("http://localhost:8080/app")
        );
        assert_eq!(
            extract_ready_url("server at http://[::1]:4321").as_deref(),
            Some("http://localhost:4321/")
        );
        assert_eq!(extract_ready_url("see https://example.com:443/docs"), None);
        assert_eq!(extract_ready_url("compiling..."), None);
    }

    #[test]
    fn best_effort_missing_dependency_detection() {
        let out = "Error: Cannot find module 'vite'\nRequire stack:\n- /app/x.js";
        assert_eq!(classify_exit(out), ExitCause::MissingDeps);
        assert_eq!(classify_exit("sh: 1: next: command not found"), ExitCause::MissingDeps);
        assert_eq!(
            classify_exit("[ERR_MODULE_NOT_FOUND]: Cannot find package 'react'"),
            ExitCause::MissingDeps
        );
    }

    #[test]
    fn best_effort_port_in_use_detection() {
        let node = "Error: listen EADDRINUSE: address already in use :::3000";
        assert_eq!(
            classify_exit(node),
            ExitCause::PortInUse { port: Some(3000) }
        );

        let ipv4 = "OSError: [Errno 98] Address already in use 127.0.0.1:8000";
        assert_eq!(
            classify_exit(ipv4),
            ExitCause::PortInUse { port: Some(8000) }
        );

        let vite = "error when starting dev server:\nError: Port 5173 is already in use";
        assert_eq!(
            classify_exit(vite),
            ExitCause::PortInUse { port: Some(5173) }
        );

        assert_eq!(
            classify_exit("bind failed: address already in use"),
            ExitCause::PortInUse { port: None }
        );
    }

    #[test]
    fn best_effort_descriptor_fault_and_unknown() {
        assert_eq!(
            classify_exit("spawn EBADF\n    at ChildProcess.spawn"),
            ExitCause::BadDescriptor
        );
        assert_eq!(
            classify_exit("SyntaxError: Unexpected token '}'"),
            ExitCause::Unknown
        );
    }

    #[test]
    fn port_hint_from_banner() {
        assert_eq!(extract_port_hint("Starting server on port 4200..."), Some(4200));
        assert_eq!(extract_port_hint("ready - started server on 0.0.0.0:3000"), Some(3000));
        assert_eq!(extract_port_hint("compiled successfully"), None);
    }
}
