//! Classification of the transient "bad file descriptor" fault.
//!
//! Pty sessions owned by the embedded terminal leak descriptors into children
//! spawned while they are being torn down. The resulting spawn/exec failures
//! clear up on their own once the terminal's process has fully exited, so they
//! are retried instead of surfaced.

use std::error::Error;

/// OS error code for a bad descriptor.
#[cfg(unix)]
const EBADF: i32 = libc::EBADF;
/// `ERROR_INVALID_HANDLE`, the Win32 counterpart.
#[cfg(not(unix))]
const EBADF: i32 = 6;

/// Bounds the `source()` walk in case an error chain loops back on itself.
const MAX_CHAIN_DEPTH: usize = 16;

/// Message fragments that identify the fault, lowercase.
const FAULT_SIGNALS: &[&str] = &["ebadf", "bad file descriptor"];

/// Returns `true` if `err`, or anything in its `source()` chain, is the
/// transient descriptor fault.
///
/// Checks, per link: the OS error code of an `io::Error`, then the rendered
/// message.
pub fn is_transient_descriptor_fault(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    let mut depth = 0;

    while let Some(link) = current {
        if depth >= MAX_CHAIN_DEPTH {
            break;
        }
        if let Some(io) = link.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(EBADF) {
                return true;
            }
        }
        if text_signals_descriptor_fault(&link.to_string()) {
            return true;
        }
        current = link.source();
        depth += 1;
    }

    false
}

/// Returns `true` if free-form output (an error message, captured stderr)
/// mentions the descriptor fault.
pub fn text_signals_descriptor_fault(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    FAULT_SIGNALS.iter().any(|signal| lower.contains(signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("wrapper")]
    struct Wrapper {
        #[source]
        inner: Outer,
    }

    #[test]
    fn raw_os_error_is_detected() {
        let err = std::io::Error::from_raw_os_error(EBADF);
        assert!(is_transient_descriptor_fault(&err));
    }

    #[cfg(unix)]
    #[test]
    fn code_follows_the_platform_errno() {
        assert_eq!(EBADF, libc::EBADF);
        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert!(is_transient_descriptor_fault(&err));
    }

    #[test]
    fn message_is_detected() {
        let err = std::io::Error::other("spawn failed: EBADF");
        assert!(is_transient_descriptor_fault(&err));

        let err = std::io::Error::other("fatal: Bad file descriptor");
        assert!(is_transient_descriptor_fault(&err));
    }

    #[test]
    fn nested_cause_is_detected() {
        let err = Wrapper {
            inner: Outer {
                inner: std::io::Error::from_raw_os_error(EBADF),
            },
        };
        assert!(is_transient_descriptor_fault(&err));
    }

    #[test]
    fn unrelated_errors_are_not_transient() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!is_transient_descriptor_fault(&err));

        let err = Wrapper {
            inner: Outer {
                inner: std::io::Error::other("permission denied"),
            },
        };
        assert!(!is_transient_descriptor_fault(&err));
    }

    #[test]
    fn text_signal_is_case_insensitive() {
        assert!(text_signals_descriptor_fault("Error: BAD FILE DESCRIPTOR"));
        assert!(!text_signals_descriptor_fault("file not found"));
    }
}
