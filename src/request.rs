//! Media-controller request pool: a fixed set of kernel *request* handles
//! that bundle per-frame stateless-codec controls with a coded input buffer.

use crate::error::DecoderError;
use crate::ioctl::{self, ExtControl};
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Free,
    Reserved,
    Submitted,
}

struct RequestHandle {
    fd: RawFd,
    state: RequestState,
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Pool of `n` media-controller request handles.
pub struct RequestPool {
    handles: Vec<RequestHandle>,
}

impl RequestPool {
    /// Asks the kernel for `n` request handles.
    pub fn allocate(media_fd: RawFd, n: u32) -> Result<Self, DecoderError> {
        let mut handles = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let fd = ioctl::request_alloc(media_fd).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
            handles.push(RequestHandle { fd, state: RequestState::Free });
        }
        Ok(RequestPool { handles })
    }

    /// Draws a free request handle and marks it reserved so controls can be
    /// attached to it. Fails (rather than blocking) when the pool is
    /// exhausted; the caller is expected to drain completions first.
    pub fn acquire(&mut self) -> Result<usize, DecoderError> {
        let slot = self
            .handles
            .iter()
            .position(|h| h.state == RequestState::Free)
            .ok_or(DecoderError::Misuse("request pool exhausted"))?;
        self.handles[slot].state = RequestState::Reserved;
        Ok(slot)
    }

    pub fn fd(&self, slot: usize) -> RawFd {
        self.handles[slot].fd
    }

    /// Binds the four stateless-codec control payloads to a reserved
    /// request, via a single `VIDIOC_S_EXT_CTRLS` call.
    pub fn set_controls(&self, video_fd: RawFd, slot: usize, controls: &mut [ExtControl<'_>]) -> Result<(), DecoderError> {
        let handle = &self.handles[slot];
        if handle.state != RequestState::Reserved {
            return Err(DecoderError::Misuse("controls must be set before submission"));
        }
        ioctl::s_ext_ctrls(video_fd, handle.fd, controls).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))
    }

    /// Submits (queues) a reserved request. The associated coded-input
    /// buffer must already have been queued with this request's fd.
    pub fn submit(&mut self, slot: usize) -> Result<(), DecoderError> {
        let handle = &mut self.handles[slot];
        if handle.state != RequestState::Reserved {
            return Err(DecoderError::Misuse("cannot submit a request with no controls attached"));
        }
        ioctl::request_queue(handle.fd).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
        handle.state = RequestState::Submitted;
        Ok(())
    }

    /// Returns a completed request to the free state once the kernel has
    /// reported the associated decode finished.
    pub fn reinit(&mut self, slot: usize) -> Result<(), DecoderError> {
        let handle = &mut self.handles[slot];
        ioctl::request_reinit(handle.fd).map_err(|e| DecoderError::DeviceNotFound(e.to_string()))?;
        handle.state = RequestState::Free;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.handles.len()
    }

    pub fn free_count(&self) -> usize {
        self.handles.iter().filter(|h| h.state == RequestState::Free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_state_machine_tracks_free_count() {
        // Exercised against the in-process state machine only; real ioctls
        // need an actual media device and aren't reachable from unit tests.
        let handles = vec![
            RequestHandle { fd: -1, state: RequestState::Free },
            RequestHandle { fd: -1, state: RequestState::Reserved },
            RequestHandle { fd: -1, state: RequestState::Submitted },
        ];
        let pool = RequestPool { handles };
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn submit_on_a_free_slot_is_a_misuse_error_not_a_panic() {
        let handles = vec![RequestHandle { fd: -1, state: RequestState::Free }];
        let mut pool = RequestPool { handles };
        let err = pool.submit(0).expect_err("submitting an unreserved request must fail");
        assert!(matches!(err, DecoderError::Misuse(_)));
    }

    #[test]
    fn set_controls_on_a_submitted_slot_is_a_misuse_error_not_a_panic() {
        let handles = vec![RequestHandle { fd: -1, state: RequestState::Submitted }];
        let pool = RequestPool { handles };
        let err = pool
            .set_controls(-1, 0, &mut [])
            .expect_err("setting controls on an already-submitted request must fail");
        assert!(matches!(err, DecoderError::Misuse(_)));
    }
}
