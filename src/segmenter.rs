//! Incremental Annex-B NAL-unit segmenter, wired to a bounded
//! single-producer/single-consumer channel.
//!
//! [`channel`] returns an [`NalProducer`]/[`NalConsumer`] pair backed by
//! [`std::sync::mpsc::sync_channel`]: `NalProducer::append` scans incoming
//! bytes and blocks once the channel is full (the consumer hasn't kept up),
//! `NalConsumer::next_unit` blocks until a unit is ready or the producer has
//! finished. `complete` seals the stream, flushes the trailing unit, and
//! drops the sender so the consumer's next `recv` reports end-of-stream.

use std::sync::mpsc::{self, Receiver, SyncSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterMode {
    WithStartCode,
    WithoutStartCode,
}

#[derive(Debug, Clone, Copy)]
struct PendingNal {
    code_pos: usize,
    code_len: usize,
}

/// Creates a bounded SPSC NAL-unit channel holding at most `capacity` units
/// before `NalProducer::append` blocks.
pub fn channel(mode: SegmenterMode, capacity: usize) -> (NalProducer, NalConsumer) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        NalProducer {
            mode,
            buf: Vec::new(),
            scan_pos: 0,
            pending: None,
            saw_start_code: false,
            tx,
        },
        NalConsumer { rx },
    )
}

/// Scans appended bytes for start codes and sends each completed unit on the
/// bounded channel, blocking while the channel is full.
pub struct NalProducer {
    mode: SegmenterMode,
    buf: Vec<u8>,
    scan_pos: usize,
    pending: Option<PendingNal>,
    /// Set once a start code has ever been found; distinguishes "no start
    /// code in the whole stream" from "stream not yet sealed".
    saw_start_code: bool,
    tx: SyncSender<Vec<u8>>,
}

/// Consumer half of the channel: blocks on an empty queue, returns `None`
/// once the producer is done and every emitted unit has been drained.
pub struct NalConsumer {
    rx: Receiver<Vec<u8>>,
}

impl NalProducer {
    /// Feeds `chunk` in, scanning for and sending any now-complete units.
    /// Blocks if the channel is full until the consumer drains it.
    pub fn append(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.scan();
        self.trim_consumed();
    }

    /// Seals the stream: flushes the trailing unit (if any), then drops the
    /// sender so the consumer sees end-of-stream.
    pub fn complete(mut self) {
        self.scan();
        if let Some(pending) = self.pending.take() {
            let end = self.buf.len();
            self.push_unit(pending.code_pos, pending.code_len, end);
        } else if !self.saw_start_code && !self.buf.is_empty() {
            let whole = std::mem::take(&mut self.buf);
            let _ = self.tx.send(whole);
        }
    }

    fn scan(&mut self) {
        loop {
            match find_start_code(&self.buf, self.scan_pos) {
                Some((pos, len)) => {
                    self.saw_start_code = true;
                    if let Some(pending) = self.pending.take() {
                        self.push_unit(pending.code_pos, pending.code_len, pos);
                    }
                    self.pending = Some(PendingNal {
                        code_pos: pos,
                        code_len: len,
                    });
                    self.scan_pos = pos + len;
                }
                None => break,
            }
        }
    }

    fn push_unit(&mut self, code_pos: usize, code_len: usize, end: usize) {
        let payload_start = code_pos + code_len;
        if end <= payload_start {
            // Zero-length payload between two adjacent start codes: not a
            // valid NAL unit (length >= 1 invariant), so neither mode emits it.
            return;
        }
        let bytes = match self.mode {
            SegmenterMode::WithStartCode => self.buf[code_pos..end].to_vec(),
            SegmenterMode::WithoutStartCode => self.buf[payload_start..end].to_vec(),
        };
        // Blocks here once the bounded channel is full — this is the
        // producer-side suspension the channel contract requires.
        let _ = self.tx.send(bytes);
    }

    /// Drops bytes fully behind the earliest position still referenced (the
    /// start of `pending`, or `scan_pos` if nothing is pending yet), so `buf`
    /// doesn't grow without bound across a long, chunk-delivered stream.
    fn trim_consumed(&mut self) {
        let keep_from = self.pending.map(|p| p.code_pos).unwrap_or(self.scan_pos);
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.scan_pos -= keep_from;
        if let Some(pending) = &mut self.pending {
            pending.code_pos -= keep_from;
        }
    }
}

impl NalConsumer {
    /// Blocks until a unit is ready, or returns `None` once the producer has
    /// completed and every emitted unit has been drained.
    pub fn next_unit(&self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }
}

/// Find the next `00 00 01` pattern starting at or after `from`, extending to
/// a 4-byte start code if preceded by a zero byte. Returns
/// `(start_of_code, code_len)`.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    if buf.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            if i >= 1 && buf[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Capacity generous enough that none of the small fixed-size fixtures
    /// below could ever block on `append` while run single-threaded.
    const TEST_CAPACITY: usize = 64;

    fn drain_all(consumer: &NalConsumer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(u) = consumer.next_unit() {
            out.push(u);
        }
        out
    }

    #[test]
    fn empty_input_yields_no_units() {
        let (producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
        producer.complete();
        assert!(drain_all(&consumer).is_empty());
    }

    #[test]
    fn start_code_only_yields_no_units() {
        let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
        producer.append(&[0x00, 0x00, 0x01]);
        producer.complete();
        assert!(drain_all(&consumer).is_empty());
    }

    #[test]
    fn no_start_code_is_one_unit() {
        let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
        producer.append(&[0xAA, 0xBB, 0xCC]);
        producer.complete();
        let units = drain_all(&consumer);
        assert_eq!(units, vec![vec![0xAA, 0xBB, 0xCC]]);
    }

    #[test]
    fn scenario_1_single_sps_4_byte_start_code() {
        let input = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];

        let (mut with, with_consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
        with.append(&input);
        with.complete();
        assert_eq!(drain_all(&with_consumer), vec![input.to_vec()]);

        let (mut without, without_consumer) = channel(SegmenterMode::WithoutStartCode, TEST_CAPACITY);
        without.append(&input);
        without.complete();
        assert_eq!(drain_all(&without_consumer), vec![vec![0x67, 0x42, 0x00, 0x1E]]);
    }

    #[test]
    fn scenario_2_three_nals_mixed_widths() {
        let input = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // 4-byte start code
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, // 3-byte start code
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, // 4-byte start code
        ];
        let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
        producer.append(&input);
        producer.complete();
        let units = drain_all(&consumer);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0][..4], [0x00, 0x00, 0x00, 0x01]);
        assert_eq!(units[1][..3], [0x00, 0x00, 0x01]);
        assert_eq!(units[2][..4], [0x00, 0x00, 0x00, 0x01]);
        assert_eq!(units[0][4] & 0x1f, 7);
        assert_eq!(units[1][3] & 0x1f, 8);
        assert_eq!(units[2][4] & 0x1f, 5);
    }

    #[test]
    fn start_code_split_across_appends() {
        let (mut producer, consumer) = channel(SegmenterMode::WithoutStartCode, TEST_CAPACITY);
        producer.append(&[0x00, 0x00]);
        producer.append(&[0x01]);
        producer.append(&[0x67, 0x42]);
        producer.complete();
        assert_eq!(drain_all(&consumer), vec![vec![0x67, 0x42]]);
    }

    #[test]
    fn chunk_size_independence() {
        let input = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38,
            0x80,
        ];
        let reference = {
            let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
            producer.append(&input);
            producer.complete();
            drain_all(&consumer)
        };
        for chunk_size in [1usize, 2, 3, 4, 7, 16] {
            let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, TEST_CAPACITY);
            for chunk in input.chunks(chunk_size) {
                producer.append(chunk);
            }
            producer.complete();
            assert_eq!(drain_all(&consumer), reference, "chunk_size={chunk_size}");
        }
    }

    /// With a channel of capacity 1 and no consumer draining, a second unit's
    /// `append` call must block — proving backpressure is real, not just
    /// advisory. Spawns the producer on its own thread since a blocking
    /// `append` on the test thread would otherwise deadlock the test itself.
    #[test]
    fn producer_blocks_when_channel_is_full() {
        let (mut producer, consumer) = channel(SegmenterMode::WithStartCode, 1);
        let input = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // NAL 1
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, // NAL 2
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, // NAL 3
        ];
        let handle = std::thread::spawn(move || {
            producer.append(&input);
            producer.complete();
        });

        // The channel can hold one unit; the producer thread must be parked
        // trying to send a second one until we start draining.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished(), "producer should block on a full channel");

        let units = drain_all(&consumer);
        handle.join().unwrap();
        assert_eq!(units.len(), 3);
    }
}
