//! Protocol errors

use thiserror::Error;

/// Errors raised while decoding bench traffic
///
/// None of these are fatal to a session: the read loop logs them and moves
/// on to the next frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Token shorter than header plus trailer
    #[error("frame is too short: {0} bytes")]
    FrameTooShort(usize),

    /// Channel id other than Text or Data
    #[error("frame channel {0} is not supported")]
    UnsupportedChannel(u8),

    /// Header length disagrees with the payload
    #[error("frame payload length mismatch: header says {expected}, got {actual}")]
    LengthMismatch {
        /// Length from the header word
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// Trailer does not match the payload CRC
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC computed over the payload
        expected: u32,
        /// CRC carried in the trailer
        actual: u32,
    },

    /// Empty telemetry payload
    #[error("telemetry payload is too short: {0} bytes")]
    PayloadTooShort(usize),

    /// Telemetry payload not a whole number of entries
    #[error("telemetry payload is not 8-byte aligned: {0} bytes")]
    PayloadMisaligned(usize),

    /// First entry is not the `0x1000` version tag
    #[error("telemetry version {0:#010x} is not supported")]
    UnsupportedVersion(u32),

    /// Transport read failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
