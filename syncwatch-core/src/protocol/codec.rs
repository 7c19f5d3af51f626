//! Newline-delimited JSON framing
//!
//! The decoder yields `Result<Envelope, CodecError>` items. Per-frame
//! problems (unknown kind, bad shape, oversized line) come back inside the
//! item so a `Framed` stream keeps running; only I/O failures end it.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::messages::{Envelope, KNOWN_KINDS};

/// Upper bound on a single frame, newline excluded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("unknown message kind: {kind}")]
    UnknownMessage { kind: String },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the underlying stream is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

/// One decoded line
pub type Decoded = Result<Envelope, CodecError>;

/// Parse a single line (without its terminator) into an envelope
pub fn decode_line(line: &str) -> Decoded {
    let value: Value =
        serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let kind = match value.as_object() {
        Some(object) if object.len() == 1 => object.keys().next().cloned().unwrap_or_default(),
        _ => {
            return Err(CodecError::Malformed(
                "frame must be an object with exactly one key".to_string(),
            ))
        }
    };

    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(CodecError::UnknownMessage { kind });
    }

    serde_json::from_value(value).map_err(|e| CodecError::Malformed(format!("{kind}: {e}")))
}

/// Serialize an envelope to its wire line, terminator included
pub fn encode_line(envelope: &Envelope) -> Result<String, CodecError> {
    let mut line =
        serde_json::to_string(envelope).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if line.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            limit: MAX_FRAME_LEN,
        });
    }
    line.push_str("\r\n");
    Ok(line)
}

pub struct EnvelopeCodec {
    lines: LinesCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        }
    }

    fn lift(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Decoded>, CodecError> {
        match result {
            Ok(Some(line)) => Ok(Some(decode_line(line.trim()))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(CodecError::FrameTooLarge {
                limit: MAX_FRAME_LEN,
            }))),
            Err(LinesCodecError::Io(e)) => Err(CodecError::Io(e)),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, CodecError> {
        loop {
            let next = self.lines.decode(src);
            if matches!(&next, Ok(Some(line)) if line.trim().is_empty()) {
                continue;
            }
            return Self::lift(next);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, CodecError> {
        loop {
            let next = self.lines.decode_eof(src);
            if matches!(&next, Ok(Some(line)) if line.trim().is_empty()) {
                continue;
            }
            return Self::lift(next);
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = encode_line(&item)?;
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
