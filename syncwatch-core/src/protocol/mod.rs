//! Wire protocol: message types and line framing

pub mod codec;
pub mod messages;

pub use codec::{decode_line, encode_line, CodecError, Decoded, EnvelopeCodec, MAX_FRAME_LEN};
pub use messages::*;
