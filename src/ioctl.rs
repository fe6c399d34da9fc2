//! Raw ioctl plumbing for the handful of kernel interfaces the `v4l` crate
//! doesn't wrap: setting a simple device control by numeric id, and
//! media-controller request allocation/queue/reinit.

use anyhow::{bail, Result};
use std::os::fd::RawFd;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((ty as u32) << IOC_TYPESHIFT) | ((nr as u32) << IOC_NRSHIFT) | ((size as u32) << IOC_SIZESHIFT)
}

const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

const fn io(ty: u8, nr: u8) -> u32 {
    ioc(0, ty, nr, 0)
}

#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

fn vidioc_s_ctrl(size: usize) -> u32 {
    iowr(b'V', 28, size)
}

/// Sets a simple (non-extended) 32-bit integer control, used for the two
/// device-wide stateless decode-mode controls.
pub fn s_ctrl(fd: RawFd, id: u32, value: i32) -> Result<()> {
    let mut ctrl = V4l2Control { id, value };
    let req = vidioc_s_ctrl(std::mem::size_of::<V4l2Control>());
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut ctrl as *mut V4l2Control) };
    if ret != 0 {
        bail!("VIDIOC_S_CTRL({id:#x}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

const MEDIA_IOC_TYPE: u8 = b'|';

fn media_ioc_request_alloc() -> u32 {
    iowr(MEDIA_IOC_TYPE, 0x05, std::mem::size_of::<i32>())
}

fn media_request_ioc_queue() -> u32 {
    io(MEDIA_IOC_TYPE, 0x80)
}

fn media_request_ioc_reinit() -> u32 {
    io(MEDIA_IOC_TYPE, 0x81)
}

/// Allocates one media-controller request, returning its file descriptor.
pub fn request_alloc(media_fd: RawFd) -> Result<RawFd> {
    let mut out_fd: i32 = -1;
    let req = media_ioc_request_alloc();
    let ret = unsafe { libc::ioctl(media_fd, req as libc::c_ulong, &mut out_fd as *mut i32) };
    if ret != 0 {
        bail!("MEDIA_IOC_REQUEST_ALLOC failed: {}", std::io::Error::last_os_error());
    }
    Ok(out_fd)
}

/// Submits (queues) a request that already carries controls and a queued
/// coded buffer.
pub fn request_queue(request_fd: RawFd) -> Result<()> {
    let req = media_request_ioc_queue();
    let ret = unsafe { libc::ioctl(request_fd, req as libc::c_ulong, std::ptr::null_mut::<libc::c_void>()) };
    if ret != 0 {
        bail!("MEDIA_REQUEST_IOC_QUEUE failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Returns a completed request to the free state so it can carry a new
/// frame's controls.
pub fn request_reinit(request_fd: RawFd) -> Result<()> {
    let req = media_request_ioc_reinit();
    let ret = unsafe { libc::ioctl(request_fd, req as libc::c_ulong, std::ptr::null_mut::<libc::c_void>()) };
    if ret != 0 {
        bail!("MEDIA_REQUEST_IOC_REINIT failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

pub const VIDEO_MAX_PLANES: usize = 8;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;
pub const V4L2_BUF_FLAG_REQUEST_FD: u32 = 0x0080_0000;

#[repr(C)]
struct V4l2RequestBuffers {
    count: u32,
    typ: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2PlaneUnion {
    mem_offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Plane {
    pub bytesused: u32,
    pub length: u32,
    m: V4l2PlaneUnion,
    pub data_offset: u32,
    reserved: [u32; 11],
}

impl V4l2Plane {
    fn zeroed() -> Self {
        V4l2Plane {
            bytesused: 0,
            length: 0,
            m: V4l2PlaneUnion { mem_offset: 0 },
            data_offset: 0,
            reserved: [0; 11],
        }
    }

    /// A plane descriptor carrying only `bytesused`, for queuing an MMAP
    /// buffer whose offset the kernel already knows from `QUERYBUF`.
    pub fn with_bytesused(bytesused: u32) -> Self {
        V4l2Plane {
            bytesused,
            ..Self::zeroed()
        }
    }

    /// A plane descriptor carrying a DMA-BUF fd, for queuing a DMABUF-memory
    /// buffer.
    pub fn with_dmabuf_fd(fd: i32) -> Self {
        let mut p = Self::zeroed();
        p.set_dmabuf_fd(fd);
        p
    }

    pub fn mem_offset(&self) -> u32 {
        unsafe { self.m.mem_offset }
    }

    pub fn set_dmabuf_fd(&mut self, fd: i32) {
        self.m.fd = fd;
    }
}

#[repr(C)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut V4l2Plane,
    fd: i32,
}

/// Mirrors `struct v4l2_buffer` for the multiplanar queues a stateless
/// decoder uses. `timestamp`/`timecode` are zeroed; the kernel fills them in
/// on dequeue and this layer doesn't consume them.
#[repr(C)]
struct V4l2Buffer {
    index: u32,
    typ: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: [u8; 16],
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

fn vidioc_reqbufs() -> u32 {
    iowr(b'V', 8, std::mem::size_of::<V4l2RequestBuffers>())
}

fn vidioc_querybuf() -> u32 {
    iowr(b'V', 9, std::mem::size_of::<V4l2Buffer>())
}

fn vidioc_qbuf() -> u32 {
    iowr(b'V', 15, std::mem::size_of::<V4l2Buffer>())
}

fn vidioc_dqbuf() -> u32 {
    iowr(b'V', 17, std::mem::size_of::<V4l2Buffer>())
}

fn vidioc_streamon() -> u32 {
    iowr(b'V', 18, std::mem::size_of::<i32>())
}

fn vidioc_streamoff() -> u32 {
    iowr(b'V', 19, std::mem::size_of::<i32>())
}

/// Requests `count` buffers of `memory` type (MMAP or DMABUF) on the given
/// multiplanar queue, returning the number the driver actually allocated.
pub fn reqbufs(fd: RawFd, buf_type: u32, memory: u32, count: u32) -> Result<u32> {
    let mut rb = V4l2RequestBuffers {
        count,
        typ: buf_type,
        memory,
        capabilities: 0,
        flags: 0,
        reserved: [0; 3],
    };
    let req = vidioc_reqbufs();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut rb as *mut V4l2RequestBuffers) };
    if ret != 0 {
        bail!("VIDIOC_REQBUFS failed: {}", std::io::Error::last_os_error());
    }
    Ok(rb.count)
}

/// Queries the per-plane mmap offsets and lengths for one MMAP-backed
/// buffer, used to `mmap()` the coded-input pool's slots.
pub fn querybuf(fd: RawFd, buf_type: u32, memory: u32, index: u32, num_planes: usize) -> Result<Vec<V4l2Plane>> {
    let mut planes = vec![V4l2Plane::zeroed(); num_planes.max(1)];
    let mut buf = V4l2Buffer {
        index,
        typ: buf_type,
        bytesused: 0,
        flags: 0,
        field: 0,
        timestamp: unsafe { std::mem::zeroed() },
        timecode: [0; 16],
        sequence: 0,
        memory,
        m: V4l2BufferM { planes: planes.as_mut_ptr() },
        length: planes.len() as u32,
        reserved2: 0,
        request_fd: -1,
    };
    let req = vidioc_querybuf();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut buf as *mut V4l2Buffer) };
    if ret != 0 {
        bail!("VIDIOC_QUERYBUF failed: {}", std::io::Error::last_os_error());
    }
    Ok(planes)
}

/// Queues buffer `index` with the given per-plane byte-used counts (and,
/// for DMABUF memory, fds). `request_fd` binds the queue operation to a
/// media-controller request when `Some`.
pub fn qbuf(
    fd: RawFd,
    buf_type: u32,
    memory: u32,
    index: u32,
    planes: &mut [V4l2Plane],
    request_fd: Option<RawFd>,
) -> Result<()> {
    let mut buf = V4l2Buffer {
        index,
        typ: buf_type,
        bytesused: 0,
        flags: request_fd.map_or(0, |_| V4L2_BUF_FLAG_REQUEST_FD),
        field: 0,
        timestamp: unsafe { std::mem::zeroed() },
        timecode: [0; 16],
        sequence: 0,
        memory,
        m: V4l2BufferM { planes: planes.as_mut_ptr() },
        length: planes.len() as u32,
        reserved2: 0,
        request_fd: request_fd.unwrap_or(-1),
    };
    let req = vidioc_qbuf();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut buf as *mut V4l2Buffer) };
    if ret != 0 {
        bail!("VIDIOC_QBUF(index={index}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Dequeues the next completed buffer on `buf_type`, returning its index.
/// Returns a raw `io::Error` (rather than `anyhow::Error`) so callers can
/// inspect `raw_os_error()` to special-case `EAGAIN`.
pub fn dqbuf(fd: RawFd, buf_type: u32, memory: u32, num_planes: usize) -> std::io::Result<u32> {
    let mut planes = vec![V4l2Plane::zeroed(); num_planes.max(1)];
    let mut buf = V4l2Buffer {
        index: 0,
        typ: buf_type,
        bytesused: 0,
        flags: 0,
        field: 0,
        timestamp: unsafe { std::mem::zeroed() },
        timecode: [0; 16],
        sequence: 0,
        memory,
        m: V4l2BufferM { planes: planes.as_mut_ptr() },
        length: planes.len() as u32,
        reserved2: 0,
        request_fd: -1,
    };
    let req = vidioc_dqbuf();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut buf as *mut V4l2Buffer) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(buf.index)
}

pub fn streamon(fd: RawFd, buf_type: u32) -> Result<()> {
    let mut t = buf_type as i32;
    let req = vidioc_streamon();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut t as *mut i32) };
    if ret != 0 {
        bail!("VIDIOC_STREAMON failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn streamoff(fd: RawFd, buf_type: u32) -> Result<()> {
    let mut t = buf_type as i32;
    let req = vidioc_streamoff();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut t as *mut i32) };
    if ret != 0 {
        bail!("VIDIOC_STREAMOFF failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

const V4L2_FIELD_NONE: u32 = 1;

/// One plane's negotiated geometry within a multiplanar format.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneFormat {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// What `VIDIOC_G_FMT`/`VIDIOC_S_FMT` negotiated on a `*_MPLANE` queue: the
/// driver fills in `num_planes` and per-plane geometry independently of what
/// the caller asked for, so every field here must be read back, never assumed.
#[derive(Debug, Clone)]
pub struct MplaneFormat {
    pub width: u32,
    pub height: u32,
    pub num_planes: u32,
    pub planes: Vec<PlaneFormat>,
}

// Mirrors `struct v4l2_plane_pix_format`. Kernel-packed: no implicit padding
// between `sizeimage`/`bytesperline` and the reserved tail.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct V4l2PlanePixFormat {
    sizeimage: u32,
    bytesperline: u32,
    reserved: [u16; 6],
}

// Mirrors `struct v4l2_pix_format_mplane`.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct V4l2PixFormatMplane {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    colorspace: u32,
    plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    num_planes: u8,
    flags: u8,
    encoding: u8,
    quantization: u8,
    xfer_func: u8,
    reserved: [u8; 7],
}

const V4L2_FORMAT_FMT_UNION_SIZE: usize = 200;

// Mirrors the anonymous `fmt` union in `struct v4l2_format`; only the
// multiplanar pixel-format variant this decoder needs is named, the rest of
// the union's 200 bytes are reserved for the other `v4l2_format` variants.
#[repr(C)]
union V4l2FormatFmt {
    pix_mp: V4l2PixFormatMplane,
    raw: [u8; V4L2_FORMAT_FMT_UNION_SIZE],
}

#[repr(C)]
struct V4l2Format {
    typ: u32,
    fmt: V4l2FormatFmt,
}

fn vidioc_g_fmt() -> u32 {
    iowr(b'V', 4, std::mem::size_of::<V4l2Format>())
}

fn vidioc_s_fmt() -> u32 {
    iowr(b'V', 5, std::mem::size_of::<V4l2Format>())
}

fn zeroed_format(buf_type: u32) -> V4l2Format {
    let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
    fmt.typ = buf_type;
    fmt
}

fn mplane_format_from_raw(raw: &V4l2PixFormatMplane) -> MplaneFormat {
    let width = raw.width;
    let height = raw.height;
    let num_planes = (raw.num_planes as u32).clamp(1, VIDEO_MAX_PLANES as u32);
    let plane_fmt = raw.plane_fmt;
    let planes = plane_fmt[..num_planes as usize]
        .iter()
        .map(|p| PlaneFormat {
            bytes_per_line: p.bytesperline,
            size_image: p.sizeimage,
        })
        .collect();
    MplaneFormat {
        width,
        height,
        num_planes,
        planes,
    }
}

/// Reads back the currently-set format on a multiplanar queue (`*_MPLANE`
/// buffer type) via `VIDIOC_G_FMT`. Real stateless-decoder drivers only
/// implement `pix_mp`-shaped negotiation on these queues; single-planar
/// `v4l2_pix_format` ioctls are rejected with `EINVAL`.
pub fn g_fmt_mplane(fd: RawFd, buf_type: u32) -> Result<MplaneFormat> {
    let mut fmt = zeroed_format(buf_type);
    let req = vidioc_g_fmt();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut fmt as *mut V4l2Format) };
    if ret != 0 {
        bail!("VIDIOC_G_FMT failed: {}", std::io::Error::last_os_error());
    }
    Ok(mplane_format_from_raw(unsafe { &fmt.fmt.pix_mp }))
}

/// Negotiates `width`/`height`/`fourcc` on a multiplanar queue via
/// `VIDIOC_S_FMT` and returns what the driver actually accepted — callers
/// must size buffers off the returned per-plane geometry, not the request.
pub fn s_fmt_mplane(fd: RawFd, buf_type: u32, width: u32, height: u32, fourcc: &[u8; 4]) -> Result<MplaneFormat> {
    let mut fmt = zeroed_format(buf_type);
    unsafe {
        fmt.fmt.pix_mp.width = width;
        fmt.fmt.pix_mp.height = height;
        fmt.fmt.pix_mp.pixelformat = u32::from_le_bytes(*fourcc);
        fmt.fmt.pix_mp.field = V4L2_FIELD_NONE;
    }
    let req = vidioc_s_fmt();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut fmt as *mut V4l2Format) };
    if ret != 0 {
        bail!("VIDIOC_S_FMT failed: {}", std::io::Error::last_os_error());
    }
    Ok(mplane_format_from_raw(unsafe { &fmt.fmt.pix_mp }))
}

const V4L2_CTRL_WHICH_REQUEST_VAL: u32 = 0x0f00_0000;

#[repr(C)]
union V4l2ExtControlValue {
    value: i32,
    value64: i64,
    ptr: *mut libc::c_void,
}

#[repr(C)]
struct V4l2ExtControl {
    id: u32,
    size: u32,
    reserved2: [u32; 1],
    value: V4l2ExtControlValue,
}

#[repr(C)]
struct V4l2ExtControls {
    which: u32,
    count: u32,
    error_idx: u32,
    request_fd: i32,
    reserved: [u32; 1],
    controls: *mut V4l2ExtControl,
}

fn vidioc_s_ext_ctrls() -> u32 {
    iowr(b'V', 72, std::mem::size_of::<V4l2ExtControls>())
}

/// One kernel control payload to set via `VIDIOC_S_EXT_CTRLS`: a control id
/// paired with a raw struct pointer the kernel copies `size_of::<T>()` bytes
/// from.
pub struct ExtControl<'a> {
    pub id: u32,
    pub size: u32,
    pub ptr: *mut libc::c_void,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> ExtControl<'a> {
    pub fn from_payload<T>(id: u32, payload: &'a mut T) -> Self {
        ExtControl {
            id,
            size: std::mem::size_of::<T>() as u32,
            ptr: payload as *mut T as *mut libc::c_void,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Submits one or more stateless-codec control payloads bound to a
/// media-controller request, as the decode loop does once per slice for the
/// SPS/PPS/slice-params/decode-params quartet.
pub fn s_ext_ctrls(fd: RawFd, request_fd: RawFd, controls: &mut [ExtControl]) -> Result<()> {
    let mut raw: Vec<V4l2ExtControl> = controls
        .iter()
        .map(|c| V4l2ExtControl {
            id: c.id,
            size: c.size,
            reserved2: [0],
            value: V4l2ExtControlValue { ptr: c.ptr },
        })
        .collect();

    let mut ext = V4l2ExtControls {
        which: V4L2_CTRL_WHICH_REQUEST_VAL,
        count: raw.len() as u32,
        error_idx: 0,
        request_fd,
        reserved: [0],
        controls: raw.as_mut_ptr(),
    };
    let req = vidioc_s_ext_ctrls();
    let ret = unsafe { libc::ioctl(fd, req as libc::c_ulong, &mut ext as *mut V4l2ExtControls) };
    if ret != 0 {
        bail!(
            "VIDIOC_S_EXT_CTRLS failed at control {}: {}",
            ext.error_idx,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_request_codes_are_stable() {
        // Pin the computed request-code values so an accidental edit to the
        // bit-packing constants above is caught immediately.
        assert_eq!(vidioc_s_ctrl(8), 0xc008561c);
        assert_eq!(media_ioc_request_alloc(), 0xc004007c);
        assert_eq!(media_request_ioc_queue(), 0x00007c80);
        assert_eq!(media_request_ioc_reinit(), 0x00007c81);
        assert_eq!(vidioc_reqbufs(), iowr(b'V', 8, std::mem::size_of::<V4l2RequestBuffers>()));
        assert_eq!(vidioc_qbuf(), iowr(b'V', 15, std::mem::size_of::<V4l2Buffer>()));
        assert_eq!(vidioc_g_fmt(), iowr(b'V', 4, std::mem::size_of::<V4l2Format>()));
        assert_eq!(vidioc_s_fmt(), iowr(b'V', 5, std::mem::size_of::<V4l2Format>()));
    }

    #[test]
    fn mplane_format_from_raw_clamps_num_planes_to_reported_count() {
        let mut raw = V4l2PixFormatMplane {
            width: 1920,
            height: 1080,
            pixelformat: 0,
            field: 0,
            colorspace: 0,
            plane_fmt: [V4l2PlanePixFormat {
                sizeimage: 0,
                bytesperline: 0,
                reserved: [0; 6],
            }; VIDEO_MAX_PLANES],
            num_planes: 2,
            flags: 0,
            encoding: 0,
            quantization: 0,
            xfer_func: 0,
            reserved: [0; 7],
        };
        raw.plane_fmt[0] = V4l2PlanePixFormat {
            sizeimage: 3_110_400,
            bytesperline: 1920,
            reserved: [0; 6],
        };
        raw.plane_fmt[1] = V4l2PlanePixFormat {
            sizeimage: 1_555_200,
            bytesperline: 1920,
            reserved: [0; 6],
        };
        let parsed = mplane_format_from_raw(&raw);
        assert_eq!(parsed.num_planes, 2);
        assert_eq!(parsed.planes.len(), 2);
        assert_eq!(parsed.planes[0].size_image, 3_110_400);
        assert_eq!(parsed.planes[1].bytes_per_line, 1920);
    }

    #[test]
    fn ext_control_from_payload_captures_size_and_pointer() {
        let mut payload = [0u8; 8];
        let ctrl = ExtControl::from_payload(CID_PLACEHOLDER, &mut payload);
        assert_eq!(ctrl.size, 8);
        assert!(!ctrl.ptr.is_null());
    }

    const CID_PLACEHOLDER: u32 = 0x00a2_0900;
}
