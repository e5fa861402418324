use thiserror::Error;

/// Framing errors raised while decoding a capture buffer.
///
/// These are recoverable: the decoder abandons the current segment and
/// resynchronizes at the next marker boundary. Trace data published before
/// the error stays valid.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("odd sample buffer length {0}")]
    OddBufferLength(usize),
    #[error("repeat escape left a partially decoded block open")]
    InvalidEscape,
    #[error("segment marker carries invalid decoder state {0}")]
    InvalidMarker(u8),
}
