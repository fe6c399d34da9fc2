//! Decoded Picture Buffer bookkeeping: a bounded FIFO of reference-frame
//! summaries, snapshotted into the kernel's decode-params control.

use std::collections::VecDeque;

/// One reference-frame entry as the kernel expects it in a DPB snapshot.
/// `valid`/`active`/`long_term` are tri-state flags rather than an `Option`
/// because this struct is copied byte-for-byte into the decode-params
/// control payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DpbEntry {
    pub frame_num: u16,
    pub pic_order_cnt_lsb: u16,
    pub valid: bool,
    pub active: bool,
    pub long_term: bool,
    _reserved: [u8; 1],
}

#[derive(Debug, Clone, Copy)]
struct ReferenceFrame {
    frame_num: u32,
    pic_order_cnt_lsb: u32,
    reference: bool,
    long_term: bool,
}

/// Bounded FIFO of up to `max_num_ref_frames` reference frames.
pub struct Dpb {
    max_num_ref_frames: usize,
    entries: VecDeque<ReferenceFrame>,
    /// Last IDR's `no_output_of_prior_pics_flag`, recorded for a future
    /// output-reordering stage; reference-state clearing itself is
    /// unconditional regardless of this flag.
    last_no_output_of_prior_pics: bool,
}

impl Dpb {
    pub fn new(max_num_ref_frames: u32) -> Self {
        Dpb {
            max_num_ref_frames: max_num_ref_frames.max(1) as usize,
            entries: VecDeque::new(),
            last_no_output_of_prior_pics: false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Clears reference state for an IDR, recording the IDR's
    /// `no_output_of_prior_pics_flag` alongside it.
    pub fn clear_on_idr(&mut self, no_output_of_prior_pics_flag: bool) {
        self.last_no_output_of_prior_pics = no_output_of_prior_pics_flag;
        self.clear();
    }

    pub fn last_no_output_of_prior_pics(&self) -> bool {
        self.last_no_output_of_prior_pics
    }

    /// Called after submitting a frame with `nal_ref_idc > 0`.
    pub fn push_reference(&mut self, frame_num: u32, pic_order_cnt_lsb: u32) {
        self.entries.push_back(ReferenceFrame {
            frame_num,
            pic_order_cnt_lsb,
            reference: true,
            long_term: false,
        });
        while self.entries.len() > self.max_num_ref_frames {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy the current entries into a fixed-size 16-slot snapshot array for
    /// the decode-params control, in FIFO order, zero-padded past `len()`.
    pub fn snapshot(&self) -> [DpbEntry; crate::control::V4L2_H264_NUM_DPB_ENTRIES] {
        let mut out = [DpbEntry::default(); crate::control::V4L2_H264_NUM_DPB_ENTRIES];
        for (slot, frame) in out.iter_mut().zip(self.entries.iter()) {
            *slot = DpbEntry {
                frame_num: frame.frame_num.min(u16::MAX as u32) as u16,
                pic_order_cnt_lsb: frame.pic_order_cnt_lsb.min(u16::MAX as u32) as u16,
                valid: true,
                active: frame.reference,
                long_term: frame.long_term,
                _reserved: [0],
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 6 from the testable-properties section: max_num_ref_frames=3,
    /// frames 0..=5 submitted, all reference; after frame 5 the snapshot
    /// contains entries for 3, 4, 5 in order.
    #[test]
    fn scenario_6_dpb_evicts_oldest_past_capacity() {
        let mut dpb = Dpb::new(3);
        for frame_num in 0..=5u32 {
            dpb.push_reference(frame_num, frame_num * 2);
        }
        assert_eq!(dpb.len(), 3);

        let snapshot = dpb.snapshot();
        let valid: Vec<u16> = snapshot
            .iter()
            .filter(|e| e.valid)
            .map(|e| e.frame_num)
            .collect();
        assert_eq!(valid, vec![3, 4, 5]);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut dpb = Dpb::new(4);
        dpb.push_reference(0, 0);
        dpb.clear();
        assert!(dpb.is_empty());
    }

    #[test]
    fn snapshot_marks_unfilled_slots_invalid() {
        let dpb = Dpb::new(4);
        let snapshot = dpb.snapshot();
        assert!(snapshot.iter().all(|e| !e.valid));
    }
}
