//! Sharing layer: hands a ready decoded slot to a downstream consumer and
//! enforces the recycle contract (call exactly once, never mutate the
//! DMA-BUF, may hold across several frames).

use crate::buffers::DecodedPool;

/// Registered at pool-init time, notified once per decoded frame.
pub trait FrameConsumer: Send {
    /// Called on the reaper thread when `slot` becomes ready. Implementors
    /// must eventually call `pool.recycle(slot)` exactly once.
    fn on_ready(&mut self, slot: usize, pool: &mut DecodedPool);
}

/// "Local" mode: notifies the caller-supplied callback, then immediately
/// recycles the slot so the kernel can reuse it without waiting on display.
pub struct LocalConsumer<F: FnMut(usize) + Send> {
    callback: F,
}

impl<F: FnMut(usize) + Send> LocalConsumer<F> {
    pub fn new(callback: F) -> Self {
        LocalConsumer { callback }
    }
}

impl<F: FnMut(usize) + Send> FrameConsumer for LocalConsumer<F> {
    fn on_ready(&mut self, slot: usize, pool: &mut DecodedPool) {
        (self.callback)(slot);
        if let Err(e) = pool.recycle(slot) {
            tracing::warn!("failed to recycle decoded slot {slot}: {e}");
        }
    }
}

/// "Zero-copy" mode: hands the slot to the caller and does not recycle it —
/// the caller (e.g. a display pipeline) holds the DMA-BUF across vsyncs and
/// calls `pool.recycle` itself once done.
pub struct ZeroCopyConsumer<F: FnMut(usize) + Send> {
    callback: F,
}

impl<F: FnMut(usize) + Send> ZeroCopyConsumer<F> {
    pub fn new(callback: F) -> Self {
        ZeroCopyConsumer { callback }
    }
}

impl<F: FnMut(usize) + Send> FrameConsumer for ZeroCopyConsumer<F> {
    fn on_ready(&mut self, slot: usize, _pool: &mut DecodedPool) {
        (self.callback)(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn zero_copy_consumer_notifies_without_needing_a_pool() {
        // Zero-copy mode never touches the pool, so its callback contract is
        // testable without a live kernel queue (unlike LocalConsumer, whose
        // on_ready always recycles).
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let seen_clone = seen.clone();
        let callback = move |slot| seen_clone.store(slot, Ordering::SeqCst);
        let mut consumer = ZeroCopyConsumer::new(callback);
        consumer.callback_only_for_test(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    impl<F: FnMut(usize) + Send> ZeroCopyConsumer<F> {
        fn callback_only_for_test(&mut self, slot: usize) {
            (self.callback)(slot);
        }
    }
}
