//! Stream tokenizer
//!
//! Cuts the raw serial byte stream into frame tokens. A token is everything
//! strictly between a [`SYNC_MARKER`] and the next [`END_MARKER`]; bytes outside
//! marker pairs are line noise and get dropped.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{ProtocolError, END_MARKER, RESYNC_WINDOW, SYNC_MARKER};

/// `tokio_util` decoder yielding raw frame tokens
///
/// Memory stays bounded on a noisy line: once more than [`RESYNC_WINDOW`]
/// unmatched bytes are buffered the decoder keeps only the newest
/// [`RESYNC_WINDOW`] of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCodec;

impl TokenCodec {
    /// Create a new tokenizer
    pub fn new() -> Self {
        Self
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for TokenCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let sync = find(src, &SYNC_MARKER);

            if let Some(start) = sync {
                let body = start + SYNC_MARKER.len();
                if let Some(len) = find(&src[body..], &END_MARKER) {
                    let mut consumed = src.split_to(body + len + END_MARKER.len());
                    consumed.advance(body);
                    consumed.truncate(len);
                    return Ok(Some(consumed.freeze()));
                }
            }

            // No complete pair anywhere in the buffer, so nothing before the
            // newest window can start one
            if src.len() > RESYNC_WINDOW {
                let excess = src.len() - RESYNC_WINDOW;
                src.advance(excess);
                continue;
            }

            // Noise in front of a pending sync marker is never part of a frame
            if let Some(start) = sync {
                src.advance(start);
            }
            return Ok(None);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(token) => Ok(Some(token)),
            None if buf.is_empty() => Ok(None),
            None => Ok(Some(buf.split().freeze())),
        }
    }
}
