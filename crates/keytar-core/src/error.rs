//! Error types for the keytar core.
//!
//! Only two operations can fail: decoding a report that is too short to hold
//! the switch bytes, and constructing a [`ChordDetector`](crate::ChordDetector)
//! with a zero hold time. Everything else is total over its input.

use thiserror::Error;

/// Convenience alias for results produced by the core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Errors raised by the decoder and detector constructors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// The report is shorter than the last byte the decoder reads.
    ///
    /// **Recovery Strategy**: discard the frame and keep polling. A partial
    /// decode must never reach the edge tracker or the chord detector.
    #[error("Malformed packet: {len} bytes, at least {required} required")]
    MalformedPacket {
        /// Length of the rejected buffer.
        len: usize,
        /// Minimum length the decoder accepts.
        required: usize,
    },

    /// The chord detector was configured with a zero hold time.
    ///
    /// **Error Type**: Permanent. Fix the configuration and restart.
    #[error("Invalid hold time: must be greater than zero")]
    InvalidHoldTime,

    /// A switch index outside `0..=24`.
    #[error("Invalid switch index {0}: must be in 0..=24")]
    InvalidSwitchIndex(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_packet_message() {
        let err = CoreError::MalformedPacket {
            len: 5,
            required: 9,
        };
        assert_eq!(
            err.to_string(),
            "Malformed packet: 5 bytes, at least 9 required"
        );
    }
}
