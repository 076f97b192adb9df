use thiserror::Error;

use crate::config::ConfigError;
use crate::devserver::DevServerError;
use crate::repo::GitExecError;

/// Top-level error type for the loom-core library.
#[derive(Debug, Error)]
pub enum LoomError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Dev server supervision error.
    #[error("dev server error: {0}")]
    DevServer(#[from] DevServerError),

    /// Repository command error.
    #[error("git error: {0}")]
    Git(#[from] GitExecError),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, LoomError>;

/// Cut `text` down to at most `max_bytes`, keeping the tail where tools print
/// the actual failure, and never splitting a UTF-8 character.
pub fn excerpt(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_short_text() {
        assert_eq!(excerpt("  boom \n", 10), "boom");
    }

    #[test]
    fn excerpt_keeps_the_tail() {
        let out = excerpt("aaaaaaaaaaERROR", 5);
        assert_eq!(out, "...ERROR");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let out = excerpt("ééééé", 3);
        assert!(out.starts_with("..."));
        assert_eq!(out.trim_start_matches('.'), "é");
    }
}
