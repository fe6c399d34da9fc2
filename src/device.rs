//! V4L2 stateless-decoder device handle: capability query, format
//! negotiation, and the two device-wide decode-mode controls.
//!
//! Generalizes the `v4l`-crate mmap pattern used elsewhere in this codebase
//! for webcam capture to the coded-input/decoded-output multiplanar queue
//! pair a stateless decoder exposes. A real stateless-codec driver only
//! implements `VIDIOC_G_FMT`/`VIDIOC_S_FMT` against `v4l2_format.fmt.pix_mp`
//! on these `*_MPLANE` queues — the `v4l` crate's `Capture`/`Output` traits
//! negotiate the single-planar `pix` union member and are rejected with
//! `EINVAL`, so format negotiation goes through raw ioctls alongside the
//! stateless-mode controls and media-controller request allocation.

use crate::error::DecoderError;
use crate::ioctl::{PlaneFormat, V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE};
use std::os::fd::AsRawFd;
use v4l::Device as V4lDevice;

/// FOURCC for the Annex-B-framed coded input format stateless H.264
/// decoders expect (distinct from the stream FOURCC stateful decoders use).
pub const CODED_FOURCC: &[u8; 4] = b"S264";
pub const DECODED_FOURCC: &[u8; 4] = b"NV12";

// V4L2_CID_MPEG_VIDEO_H264_DECODE_MODE, value V4L2_MPEG_VIDEO_H264_DECODE_MODE_FRAME_BASED.
const CID_H264_DECODE_MODE: u32 = 0x00990957;
const DECODE_MODE_FRAME_BASED: i32 = 1;
// V4L2_CID_MPEG_VIDEO_H264_START_CODE, value V4L2_MPEG_VIDEO_H264_START_CODE_ANNEX_B.
const CID_H264_START_CODE: u32 = 0x00990958;
const START_CODE_ANNEX_B: i32 = 1;

/// What a multiplanar queue actually negotiated. The driver assigns
/// `num_planes` and per-plane geometry independently of what was requested;
/// callers must size buffers off these fields, never the request.
#[derive(Debug, Clone)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub num_planes: u32,
    pub planes: Vec<PlaneFormat>,
}

impl NegotiatedFormat {
    /// Byte stride of the first plane. Correct for every format this decoder
    /// negotiates: the coded-input `S264` queue and NV12 decoded output both
    /// carry their geometry in a single V4L2 plane.
    pub fn bytes_per_line(&self) -> u32 {
        self.planes.first().map(|p| p.bytes_per_line).unwrap_or(0)
    }

    /// Total bytes across all planes, for sizing a single backing buffer
    /// (DMA-BUF or MMAP) per queued frame.
    pub fn size_image(&self) -> u32 {
        self.planes.iter().map(|p| p.size_image).sum()
    }
}

impl From<crate::ioctl::MplaneFormat> for NegotiatedFormat {
    fn from(f: crate::ioctl::MplaneFormat) -> Self {
        NegotiatedFormat {
            width: f.width,
            height: f.height,
            num_planes: f.num_planes,
            planes: f.planes,
        }
    }
}

pub struct Device {
    pub(crate) inner: V4lDevice,
    media_fd: std::fs::File,
}

impl Device {
    pub fn open(device_path: &str, media_device_path: &str) -> Result<Self, DecoderError> {
        let inner = V4lDevice::with_path(device_path)
            .map_err(|e| DecoderError::DeviceNotFound(format!("{device_path}: {e}")))?;

        let media_fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(media_device_path)
            .map_err(|e| DecoderError::DeviceNotFound(format!("{media_device_path}: {e}")))?;

        let device = Device { inner, media_fd };
        device.set_stateless_mode_controls()?;
        Ok(device)
    }

    fn set_stateless_mode_controls(&self) -> Result<(), DecoderError> {
        self.set_simple_control(CID_H264_DECODE_MODE, DECODE_MODE_FRAME_BASED)
            .map_err(|_| DecoderError::UnsupportedMode {
                control: "H264_DECODE_MODE=FRAME_BASED",
            })?;
        self.set_simple_control(CID_H264_START_CODE, START_CODE_ANNEX_B)
            .map_err(|_| DecoderError::UnsupportedMode {
                control: "H264_START_CODE=ANNEX_B",
            })?;
        Ok(())
    }

    fn set_simple_control(&self, id: u32, value: i32) -> anyhow::Result<()> {
        crate::ioctl::s_ctrl(self.inner.handle().fd(), id, value)
    }

    /// Negotiates the coded-input (output-queue) format via `VIDIOC_S_FMT`
    /// against `fmt.pix_mp`. Callers must use the returned geometry, not the
    /// requested one, for buffer sizing.
    pub fn negotiate_coded_format(&self, width: u32, height: u32) -> Result<NegotiatedFormat, DecoderError> {
        crate::ioctl::s_fmt_mplane(self.raw_fd(), V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, width, height, CODED_FOURCC)
            .map(NegotiatedFormat::from)
            .map_err(|e| DecoderError::FormatRejected { reason: e.to_string() })
    }

    /// Negotiates the decoded-output (capture-queue) format, preferring the
    /// caller's pixel format, via `VIDIOC_S_FMT` against `fmt.pix_mp`.
    pub fn negotiate_decoded_format(
        &self,
        width: u32,
        height: u32,
        preferred_fourcc: &str,
    ) -> Result<NegotiatedFormat, DecoderError> {
        let fourcc: [u8; 4] = preferred_fourcc
            .as_bytes()
            .try_into()
            .unwrap_or(*DECODED_FOURCC);
        crate::ioctl::s_fmt_mplane(self.raw_fd(), V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, width, height, &fourcc)
            .map(NegotiatedFormat::from)
            .map_err(|e| DecoderError::FormatRejected { reason: e.to_string() })
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.handle().fd()
    }

    pub fn media_raw_fd(&self) -> std::os::fd::RawFd {
        self.media_fd.as_raw_fd()
    }
}
