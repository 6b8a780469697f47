//! Application error type.
//!
//! `AppError` wraps the core's [`CoreError`] together with everything the
//! collaborators around it can fail with: configuration loading, device and
//! file I/O, capture-file parsing and JSON encoding. By using `#[from]`, the
//! `?` operator converts the underlying errors directly.
//!
//! ## Recovery
//!
//! - **`Core(MalformedPacket)`**: transient. The poll loop drops the frame and
//!   keeps polling.
//! - **`Core(InvalidHoldTime)`**, **`Config`**, **`Configuration`**: permanent.
//!   Abort startup and fix the configuration.
//! - **`Io`**, **`Transport`**: may be transient. The poll loop tolerates a
//!   bounded run of consecutive failures before giving up.
//! - **`ReplayParse`**: permanent for that capture file.

use keytar_core::CoreError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Primary error type for the keytar application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Decoder or detector error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or device I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The packet source failed in a way that is not plain I/O.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A capture file line is not valid hex.
    #[error("Replay parse error at line {line}: {message}")]
    ReplayParse {
        /// 1-based line number in the capture file.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// Payload encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(Box::new(err))
    }
}

impl AppError {
    /// Whether the poll loop may keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Core(CoreError::MalformedPacket { .. })
                | AppError::Io(_)
                | AppError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_is_transparent() {
        let err: AppError = CoreError::MalformedPacket {
            len: 3,
            required: 9,
        }
        .into();
        assert_eq!(err.to_string(), "Malformed packet: 3 bytes, at least 9 required");
        assert!(err.is_transient());
    }

    #[test]
    fn test_configuration_errors_are_permanent() {
        assert!(!AppError::Core(CoreError::InvalidHoldTime).is_transient());
        assert!(!AppError::Configuration("bad".into()).is_transient());
        let parse = AppError::ReplayParse {
            line: 4,
            message: "odd number of hex digits".into(),
        };
        assert_eq!(
            parse.to_string(),
            "Replay parse error at line 4: odd number of hex digits"
        );
        assert!(!parse.is_transient());
    }
}
