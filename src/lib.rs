//! H.264 Annex-B bitstream parsing plus a stateless V4L2 decode orchestrator.
//!
//! [`segmenter`]/[`nal`]/[`params`] turn an Annex-B byte stream into parsed
//! SPS/PPS/slice headers. [`device`]/[`buffers`]/[`request`]/[`control`]/
//! [`dpb`] wrap the kernel's stateless-codec request API. [`decode_loop`]
//! ties the two halves together; [`sharing`] hands decoded frames to a
//! caller-supplied consumer.

pub mod bitreader;
pub mod buffers;
pub mod config;
pub mod control;
pub mod decode_loop;
pub mod device;
pub mod dpb;
pub mod eg;
pub mod error;
pub mod ioctl;
pub mod nal;
pub mod params;
pub mod request;
pub mod segmenter;
pub mod sharing;
pub mod stream;

pub use decode_loop::{DecodeLoop, DecodeStats};
pub use error::{DecoderError, DecoderStreamException};
