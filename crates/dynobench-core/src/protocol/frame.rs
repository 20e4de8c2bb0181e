//! Frame parsing/encoding
//!
//! Frame token format (everything between the sync and end markers):
//! - 4 bytes: header word (little-endian): bits 24..32 channel id, bits 0..16 payload length
//! - N bytes: payload
//! - 4 bytes: CRC32 of the payload (little-endian)

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::{ProtocolError, END_MARKER, SYNC_MARKER};

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

/// Frame sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Human-readable command response
    Text,
    /// Binary telemetry record
    Data,
}

impl Channel {
    /// Wire id of the channel
    pub fn id(&self) -> u8 {
        match self {
            Channel::Text => 0,
            Channel::Data => 1,
        }
    }

    fn from_id(id: u8) -> Result<Self, ProtocolError> {
        match id {
            0 => Ok(Channel::Text),
            1 => Ok(Channel::Data),
            other => Err(ProtocolError::UnsupportedChannel(other)),
        }
    }
}

/// How the frame trailer is validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Trailer must equal the CRC32 (IEEE) of the payload
    #[default]
    Crc32,
    /// Trailer is not checked
    Ignore,
}

impl ChecksumPolicy {
    fn validate(&self, payload: &[u8], received: u32) -> Result<(), ProtocolError> {
        match self {
            ChecksumPolicy::Ignore => Ok(()),
            ChecksumPolicy::Crc32 => {
                let expected = crc32fast::hash(payload);
                if expected == received {
                    Ok(())
                } else {
                    Err(ProtocolError::ChecksumMismatch {
                        expected,
                        actual: received,
                    })
                }
            }
        }
    }
}

/// A decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the frame arrived on
    pub channel: Channel,
    /// Payload without header and trailer
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame
    pub fn new(channel: Channel, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Parse a token produced by [`TokenCodec`](super::TokenCodec)
    pub fn parse(token: &[u8], checksum: ChecksumPolicy) -> Result<Self, ProtocolError> {
        if token.len() < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::FrameTooShort(token.len()));
        }

        let header = LittleEndian::read_u32(&token[..HEADER_LEN]);
        let payload = &token[HEADER_LEN..token.len() - TRAILER_LEN];
        let trailer = LittleEndian::read_u32(&token[token.len() - TRAILER_LEN..]);

        let channel = Channel::from_id((header >> 24) as u8)?;

        let expected = (header & 0xFFFF) as usize;
        if expected != payload.len() {
            return Err(ProtocolError::LengthMismatch {
                expected,
                actual: payload.len(),
            });
        }

        checksum.validate(payload, trailer)?;

        Ok(Self::new(channel, payload))
    }

    /// Encode the frame as it appears on the wire, markers included
    ///
    /// Payloads longer than 65535 bytes cannot be described by the header.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(&SYNC_MARKER);

        let mut word = [0u8; 4];
        let header = (u32::from(self.channel.id()) << 24) | (self.payload.len() as u32 & 0xFFFF);
        LittleEndian::write_u32(&mut word, header);
        bytes.extend_from_slice(&word);

        bytes.extend_from_slice(&self.payload);

        LittleEndian::write_u32(&mut word, crc32fast::hash(&self.payload));
        bytes.extend_from_slice(&word);

        bytes.extend_from_slice(&END_MARKER);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        SYNC_MARKER.len() + HEADER_LEN + self.payload.len() + TRAILER_LEN + END_MARKER.len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Channel::Text => write!(f, "FRAME-TEXT<{}>", String::from_utf8_lossy(&self.payload)),
            Channel::Data => {
                write!(f, "FRAME-DATA<")?;
                for b in &self.payload {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ">")
            }
        }
    }
}
