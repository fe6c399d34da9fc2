//! Public error surface. Recoverable parser errors stay local to `params`;
//! everything that reaches a caller of the decode loop goes through
//! [`DecoderError`].

use thiserror::Error;

/// Fatal kernel I/O failure surfaced to the caller, carrying enough context
/// to decide whether to restart the pipeline.
#[derive(Debug, Error)]
#[error("decoder stream failed (kernel errno {code}) after {frames_decoded} frames decoded")]
pub struct DecoderStreamException {
    pub code: i32,
    pub frames_decoded: u64,
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("device not found or failed to open: {0}")]
    DeviceNotFound(String),

    #[error("device does not support required mode: {control}")]
    UnsupportedMode { control: &'static str },

    #[error("format negotiation rejected: {reason}")]
    FormatRejected { reason: String },

    #[error("payload of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    OversizePayload { len: usize, capacity: usize },

    #[error(transparent)]
    DecoderStream(#[from] DecoderStreamException),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("misuse: {0}")]
    Misuse(&'static str),
}
