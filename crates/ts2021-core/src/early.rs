//! Early payload framing.
//!
//! The first 9 bytes the server sends over the secure channel are either an
//! HTTP/2 frame header or an early payload header of the same length:
//!
//! Wire format: `[5-byte magic 0xFF 0xFF 0xFF 'T' 'S'][4-byte big-endian length][JSON EarlyNoise]`
//!
//! An HTTP/2 frame header carries its frame type in byte 4, and no frame type
//! is `'T'`, so a reader can tell both apart from the first 5 bytes alone.

use crate::error::{ControlError, ControlResult};
use crate::tailcfg::EarlyNoise;
use std::io::Write;

/// Magic prefix of the early payload.
pub const EARLY_PAYLOAD_MAGIC: [u8; 5] = *b"\xff\xff\xffTS";

/// Magic plus length prefix.
pub const EARLY_HEADER_LEN: usize = 9;

/// Upper bound on an early payload body.
pub const MAX_EARLY_PAYLOAD_LEN: usize = 1 << 20;

/// Write an early payload to a buffered sink.
///
/// Each part is a separate write; the caller owns buffering and flushing.
pub fn write_early_payload<W: Write + ?Sized>(writer: &mut W, early: &EarlyNoise) -> ControlResult<()> {
    let json = serde_json::to_vec(early)?;
    let len = u32::try_from(json.len())
        .map_err(|_| ControlError::Codec("early payload too large".into()))?;

    writer.write_all(&EARLY_PAYLOAD_MAGIC)?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&json)?;
    Ok(())
}

/// Whether `prefix` starts with the early payload magic.
///
/// Needs at least 5 bytes; shorter input is never a match.
pub fn is_early_payload_header(prefix: &[u8]) -> bool {
    prefix.len() >= EARLY_PAYLOAD_MAGIC.len() && prefix[..EARLY_PAYLOAD_MAGIC.len()] == EARLY_PAYLOAD_MAGIC
}

/// Outcome of feeding bytes into an [`EarlyPayloadDecoder`].
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// Not enough bytes yet to decide.
    NeedMore,
    /// A complete early payload, plus any bytes that followed it.
    Early(EarlyNoise, Vec<u8>),
    /// The stream does not start with an early payload; all buffered bytes
    /// belong to the inner transport.
    NotEarly(Vec<u8>),
}

/// Client-side decoder that strips an optional early payload off the front
/// of the server's byte stream.
#[derive(Debug, Default)]
pub struct EarlyPayloadDecoder {
    buffer: Vec<u8>,
}

impl EarlyPayloadDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and report whether a decision can be made.
    pub fn feed(&mut self, data: &[u8]) -> ControlResult<Decoded> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() < EARLY_PAYLOAD_MAGIC.len() {
            return Ok(Decoded::NeedMore);
        }
        if !is_early_payload_header(&self.buffer) {
            return Ok(Decoded::NotEarly(std::mem::take(&mut self.buffer)));
        }
        if self.buffer.len() < EARLY_HEADER_LEN {
            return Ok(Decoded::NeedMore);
        }

        let len = u32::from_be_bytes([self.buffer[5], self.buffer[6], self.buffer[7], self.buffer[8]]) as usize;
        if len > MAX_EARLY_PAYLOAD_LEN {
            return Err(ControlError::Codec(format!(
                "early payload too large: {len} bytes (max {MAX_EARLY_PAYLOAD_LEN})"
            )));
        }
        if self.buffer.len() < EARLY_HEADER_LEN + len {
            return Ok(Decoded::NeedMore);
        }

        let early: EarlyNoise = serde_json::from_slice(&self.buffer[EARLY_HEADER_LEN..EARLY_HEADER_LEN + len])?;
        let rest = self.buffer.split_off(EARLY_HEADER_LEN + len);
        self.buffer.clear();
        Ok(Decoded::Early(early, rest))
    }
}
