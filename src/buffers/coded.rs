//! Memory-mapped coded-input pool: the OUTPUT_MPLANE queue a stateless
//! decoder reads Annex-B access units from.

use crate::error::DecoderError;
use crate::ioctl;
use std::collections::VecDeque;
use std::os::fd::RawFd;

struct MappedPlane {
    ptr: *mut u8,
    len: usize,
}

impl MappedPlane {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedPlane {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the mapping is only ever touched through `&mut self` call sites on
// `CodedPool`, which this type is private to.
unsafe impl Send for MappedPlane {}

/// One coded-input buffer: its mmap'd plane-0 region plus kernel bookkeeping.
struct CodedSlot {
    index: u32,
    plane: MappedPlane,
}

/// MMAP-backed pool of coded-input buffers on the OUTPUT_MPLANE queue.
pub struct CodedPool {
    fd: RawFd,
    slots: Vec<CodedSlot>,
    free_indices: VecDeque<usize>,
}

const BUF_TYPE: u32 = ioctl::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;

impl CodedPool {
    /// Requests `count` buffers from the kernel and memory-maps each one's
    /// plane 0.
    pub fn init(fd: RawFd, count: u32) -> Result<Self, DecoderError> {
        let allocated = ioctl::reqbufs(fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, count)
            .map_err(|e| DecoderError::DeviceNotFound(format!("VIDIOC_REQBUFS: {e}")))?;

        let mut slots = Vec::with_capacity(allocated as usize);
        for index in 0..allocated {
            let planes = ioctl::querybuf(fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, index, 1)
                .map_err(|e| DecoderError::DeviceNotFound(format!("VIDIOC_QUERYBUF: {e}")))?;
            let plane = &planes[0];
            let len = plane.length as usize;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    plane.mem_offset() as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(DecoderError::DeviceNotFound(format!(
                    "mmap of coded buffer {index} failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            slots.push(CodedSlot {
                index,
                plane: MappedPlane { ptr: ptr as *mut u8, len },
            });
        }

        let free_indices = (0..slots.len()).collect();
        ioctl::streamon(fd, BUF_TYPE).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;

        Ok(CodedPool { fd, slots, free_indices })
    }

    /// Blocks (with `EAGAIN` retry) until the kernel reclaims at least one
    /// buffer, pushing its slot back onto the free list.
    pub fn ensure_free(&mut self) -> Result<(), DecoderError> {
        if !self.free_indices.is_empty() {
            return Ok(());
        }
        loop {
            match ioctl::dqbuf(self.fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, 1) {
                Ok(index) => {
                    let slot_pos = self
                        .slots
                        .iter()
                        .position(|s| s.index == index)
                        .ok_or(DecoderError::Misuse("dequeued unknown coded buffer index"))?;
                    self.free_indices.push_back(slot_pos);
                    return Ok(());
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                Err(e) => return Err(DecoderError::DeviceNotFound(e.to_string())),
            }
        }
    }

    /// Copies `payload` into a free buffer's plane 0, optionally binding the
    /// enqueue to a media-controller request, and queues it.
    pub fn write_and_queue(&mut self, payload: &[u8], request_fd: Option<RawFd>) -> Result<(), DecoderError> {
        self.ensure_free()?;
        let slot_pos = self
            .free_indices
            .pop_front()
            .expect("ensure_free guarantees a free slot");
        let slot = &mut self.slots[slot_pos];
        let capacity = slot.plane.len;
        if payload.len() > capacity {
            return Err(DecoderError::OversizePayload {
                len: payload.len(),
                capacity,
            });
        }
        slot.plane.as_mut_slice()[..payload.len()].copy_from_slice(payload);

        let mut planes = vec![crate::ioctl::V4l2Plane::with_bytesused(payload.len() as u32)];
        ioctl::qbuf(self.fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, slot.index, &mut planes, request_fd)
            .map_err(|e| DecoderError::DeviceNotFound(e.to_string()))
    }

    /// Stops the queue and unmaps every plane. Kernel buffers are released by
    /// a zero-count `REQBUFS` call.
    pub fn teardown(mut self) -> Result<(), DecoderError> {
        ioctl::streamoff(self.fd, BUF_TYPE).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
        self.slots.clear();
        ioctl::reqbufs(self.fd, BUF_TYPE, ioctl::V4L2_MEMORY_MMAP, 0)
            .map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
        Ok(())
    }
}
