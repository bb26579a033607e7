//! Command-line errors

use thiserror::Error;

/// Invocation errors, reported before any pool state is touched.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("key not in pool (by value or fingerprint)")]
    UnknownKey,
}

/// Result alias using CLI Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        assert_eq!(
            Error::Usage("fail <key> <status>".into()).to_string(),
            "usage: fail <key> <status>"
        );
        assert_eq!(
            Error::UnknownCommand("rotate".into()).to_string(),
            "unknown command: rotate"
        );
    }
}
