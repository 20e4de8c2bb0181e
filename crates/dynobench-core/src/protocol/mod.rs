//! Bench Wire Protocol
//!
//! Host side of the dynamometer serial protocol.
//!
//! Inbound traffic is a byte stream of marker-delimited frames:
//!
//! ```text
//! STREAM: ... | SYNC | HDR | payload ... | CRC | END | ...
//! TOKEN:             < HDR | payload ... | CRC >
//! ```
//!
//! Outbound traffic is plain ASCII command lines (`/name=arg1,arg2\n`).

mod codec;
pub mod commands;
mod error;
mod frame;
pub mod telemetry;

pub use codec::TokenCodec;
pub use commands::{Command, COMMANDS};
pub use error::ProtocolError;
pub use frame::{Channel, ChecksumPolicy, Frame};
pub use telemetry::{Telemetry, TELEMETRY_COLUMNS, TELEMETRY_VERSION};

/// Frame start marker
pub const SYNC_MARKER: [u8; 4] = [0xC1; 4];

/// Frame end marker
pub const END_MARKER: [u8; 4] = [0xC2; 4];

/// Unmatched bytes the decoder buffers before it starts dropping noise
pub const RESYNC_WINDOW: usize = 256;

/// Default baud rate of the bench controller
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default `Control` response deadline in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
