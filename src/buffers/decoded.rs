//! Decoded-output pool: the CAPTURE_MPLANE queue a stateless decoder writes
//! NV12 frames into. Supports both memory types a caller may pick via
//! `Config::use_dma_prime_buffers`: DMA-BUF (slots owned and mmap'd
//! externally, only registered here) and MMAP (slots allocated and mapped by
//! this pool itself, the same way `CodedPool` maps its OUTPUT_MPLANE queue).

use crate::error::DecoderError;
use crate::ioctl;
use std::os::fd::RawFd;

const BUF_TYPE: u32 = ioctl::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;

struct MappedPlane {
    ptr: *mut u8,
    len: usize,
}

impl Drop for MappedPlane {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: only ever touched through `&mut self` call sites on `DecodedPool`.
unsafe impl Send for MappedPlane {}

enum Backing {
    /// Caller-owned DMA-BUF fds, one per slot.
    DmaBuf { fds: Vec<RawFd> },
    /// This pool's own kernel-allocated, mmap'd plane-0 regions.
    Mmap { planes: Vec<MappedPlane> },
}

impl Backing {
    fn slot_count(&self) -> usize {
        match self {
            Backing::DmaBuf { fds } => fds.len(),
            Backing::Mmap { planes } => planes.len(),
        }
    }

    fn memory_type(&self) -> u32 {
        match self {
            Backing::DmaBuf { .. } => ioctl::V4L2_MEMORY_DMABUF,
            Backing::Mmap { .. } => ioctl::V4L2_MEMORY_MMAP,
        }
    }

    fn plane_for_queue(&self, index: usize) -> ioctl::V4l2Plane {
        match self {
            Backing::DmaBuf { fds } => ioctl::V4l2Plane::with_dmabuf_fd(fds[index]),
            Backing::Mmap { .. } => ioctl::V4l2Plane::with_bytesused(0),
        }
    }
}

/// Registered decoded-output pool, DMA-BUF- or MMAP-backed depending on how
/// it was constructed.
pub struct DecodedPool {
    fd: RawFd,
    backing: Backing,
    /// Slots a downstream consumer currently holds; `recycle` is the only
    /// way to clear one and it must be called at most once per dequeue.
    held: Vec<bool>,
}

impl DecodedPool {
    /// Registers `fds.len()` caller-owned DMA-BUF regions as queue slots.
    /// `size` must be at least the negotiated `size_image`; `_flags` mirrors
    /// the export flags the caller used when creating the DMA-BUFs and is
    /// not otherwise consumed here.
    pub fn init_dmabuf(fd: RawFd, fds: Vec<RawFd>, size: u32, _flags: u32) -> Result<Self, DecoderError> {
        let requested = fds.len() as u32;
        let allocated = ioctl::reqbufs(fd, BUF_TYPE, ioctl::V4L2_MEMORY_DMABUF, requested)
            .map_err(|e| DecoderError::DeviceNotFound(format!("VIDIOC_REQBUFS: {e}")))?;
        if allocated != requested {
            return Err(DecoderError::DeviceNotFound(format!(
                "kernel granted {allocated} decoded-output buffers, requested {requested}"
            )));
        }
        let _ = size;
        let held = vec![false; fds.len()];
        Ok(DecodedPool {
            fd,
            backing: Backing::DmaBuf { fds },
            held,
        })
    }

    /// Requests `count` kernel-allocated buffers and memory-maps each one's
    /// plane 0, used when `Config::use_dma_prime_buffers` is `false` and
    /// there's no external DMA-BUF producer to register slots from.
    pub fn init_mmap(fd: RawFd, count: u32) -> Result<Self, DecoderError> {
        let allocated = ioctl::reqbufs(fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, count)
            .map_err(|e| DecoderError::DeviceNotFound(format!("VIDIOC_REQBUFS: {e}")))?;

        let mut planes = Vec::with_capacity(allocated as usize);
        for index in 0..allocated {
            let plane_fmts = ioctl::querybuf(fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, index, 1)
                .map_err(|e| DecoderError::DeviceNotFound(format!("VIDIOC_QUERYBUF: {e}")))?;
            let plane_fmt = &plane_fmts[0];
            let len = plane_fmt.length as usize;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ,
                    libc::MAP_SHARED,
                    fd,
                    plane_fmt.mem_offset() as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(DecoderError::DeviceNotFound(format!(
                    "mmap of decoded buffer {index} failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            planes.push(MappedPlane { ptr: ptr as *mut u8, len });
        }

        let held = vec![false; planes.len()];
        Ok(DecodedPool {
            fd,
            backing: Backing::Mmap { planes },
            held,
        })
    }

    /// Queues every registered slot, making it available to the kernel.
    pub fn enqueue_all(&mut self) -> Result<(), DecoderError> {
        for index in 0..self.backing.slot_count() {
            self.queue_slot(index)?;
        }
        Ok(())
    }

    fn queue_slot(&mut self, index: usize) -> Result<(), DecoderError> {
        let memory = self.backing.memory_type();
        let mut planes = vec![self.backing.plane_for_queue(index)];
        ioctl::qbuf(self.fd, BUF_TYPE, memory, index as u32, &mut planes, None)
            .map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
        self.held[index] = false;
        Ok(())
    }

    /// Polls for a completed decoded-output buffer, returning its slot index
    /// or `None` on timeout. Cancellation (via `cancel`) is honored at the
    /// same poll granularity.
    pub fn wait_ready(&mut self, timeout_ms: i32, cancel: &std::sync::atomic::AtomicBool) -> Result<Option<usize>, DecoderError> {
        use std::sync::atomic::Ordering;
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let step_ms = timeout_ms.clamp(0, 1000).max(1);
        let mut elapsed = 0i32;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let ret = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, step_ms) };
            if ret < 0 {
                return Err(DecoderError::DeviceNotFound(std::io::Error::last_os_error().to_string()));
            }
            if ret == 0 {
                elapsed += step_ms;
                if elapsed >= timeout_ms.max(step_ms) {
                    return Ok(None);
                }
                continue;
            }
            let index = ioctl::dqbuf(self.fd, BUF_TYPE, self.backing.memory_type(), 1)
                .map_err(|e| DecoderError::DeviceNotFound(e.to_string()))? as usize;
            self.held[index] = true;
            return Ok(Some(index));
        }
    }

    /// Returns a held slot to the kernel. Must be called exactly once per
    /// slot the consumer was handed via `wait_ready`.
    pub fn recycle(&mut self, slot_index: usize) -> Result<(), DecoderError> {
        if !self.held[slot_index] {
            return Err(DecoderError::Misuse("recycle called on a slot that was not held"));
        }
        self.queue_slot(slot_index)
    }

    pub fn slot_count(&self) -> usize {
        self.backing.slot_count()
    }
}
