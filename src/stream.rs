//! Active parameter-set state carried across NAL units in a stream.

use crate::params::{Pps, Sps};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamStateError {
    #[error("no SPS stored for seq_parameter_set_id {0}")]
    UnknownSps(u8),
    #[error("no PPS stored for pic_parameter_set_id {0}")]
    UnknownPps(u8),
}

/// Holds every SPS/PPS seen so far, keyed by their id, exactly as H.264
/// allows multiple active parameter sets to be referenced across a stream.
#[derive(Debug, Default)]
pub struct StreamState {
    sps_table: HashMap<u8, Arc<Sps>>,
    pps_table: HashMap<u8, Arc<Pps>>,
}

impl StreamState {
    pub fn new() -> Self {
        StreamState::default()
    }

    pub fn store_sps(&mut self, sps: Sps) {
        self.sps_table.insert(sps.seq_parameter_set_id, Arc::new(sps));
    }

    pub fn store_pps(&mut self, pps: Pps) {
        self.pps_table.insert(pps.pic_parameter_set_id, Arc::new(pps));
    }

    pub fn sps(&self, id: u8) -> Result<Arc<Sps>, StreamStateError> {
        self.sps_table
            .get(&id)
            .cloned()
            .ok_or(StreamStateError::UnknownSps(id))
    }

    pub fn pps(&self, id: u8) -> Result<Arc<Pps>, StreamStateError> {
        self.pps_table
            .get(&id)
            .cloned()
            .ok_or(StreamStateError::UnknownPps(id))
    }

    /// Looks up the PPS referenced by `pic_parameter_set_id`, then the SPS it
    /// in turn references, matching how the slice-header parser must resolve
    /// both before it can read `frame_num`.
    pub fn resolve_pps_chain(&self, pic_parameter_set_id: u8) -> Result<(Arc<Pps>, Arc<Sps>), StreamStateError> {
        let pps = self.pps(pic_parameter_set_id)?;
        let sps = self.sps(pps.seq_parameter_set_id)?;
        Ok((pps, sps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BitWriter {
        bytes: Vec<u8>,
        acc: u8,
        n: u32,
    }

    impl BitWriter {
        fn new() -> Self {
            BitWriter {
                bytes: Vec::new(),
                acc: 0,
                n: 0,
            }
        }

        fn push_bit(&mut self, bit: u32) {
            self.acc = (self.acc << 1) | (bit as u8 & 1);
            self.n += 1;
            if self.n == 8 {
                self.bytes.push(self.acc);
                self.acc = 0;
                self.n = 0;
            }
        }

        fn push_bits(&mut self, value: u32, width: u32) {
            for i in (0..width).rev() {
                self.push_bit((value >> i) & 1);
            }
        }

        fn push_ue(&mut self, value: u32) {
            let code_num = value + 1;
            let bits = 32 - code_num.leading_zeros();
            for _ in 0..bits - 1 {
                self.push_bit(0);
            }
            self.push_bits(code_num, bits);
        }

        fn finish(mut self) -> Vec<u8> {
            if self.n > 0 {
                self.acc <<= 8 - self.n;
                self.bytes.push(self.acc);
            }
            self.bytes
        }
    }

    fn minimal_sps() -> Sps {
        let mut w = BitWriter::new();
        w.push_bits(66, 8);
        w.push_bits(0, 8);
        w.push_bits(30, 8);
        w.push_ue(0); // seq_parameter_set_id
        w.push_ue(0); // log2_max_frame_num_minus4
        w.push_ue(2); // pic_order_cnt_type
        w.push_ue(1); // max_num_ref_frames
        w.push_bit(0);
        w.push_ue(9);
        w.push_ue(7);
        w.push_bit(1); // frame_mbs_only_flag
        w.push_bit(0);
        w.push_bit(0);
        w.push_bit(0);
        Sps::parse(&w.finish()).unwrap()
    }

    fn minimal_pps(sps_id: u8) -> Pps {
        let mut w = BitWriter::new();
        w.push_ue(0); // pic_parameter_set_id
        w.push_ue(sps_id as u32); // seq_parameter_set_id
        w.push_bit(0); // entropy_coding_mode_flag
        w.push_bit(0); // bottom_field_pic_order_in_frame_present_flag
        w.push_ue(0); // num_slice_groups_minus1
        w.push_ue(0); // num_ref_idx_l0_default_active_minus1
        w.push_ue(0); // num_ref_idx_l1_default_active_minus1
        w.push_bit(0); // weighted_pred_flag
        w.push_bits(0, 2); // weighted_bipred_idc
        w.push_ue(0); // pic_init_qp_minus26 (se: code_num 0 -> value 0)
        w.push_ue(0); // pic_init_qs_minus26
        w.push_ue(0); // chroma_qp_index_offset
        w.push_bit(0); // deblocking_filter_control_present_flag
        w.push_bit(0); // constrained_intra_pred_flag
        w.push_bit(0); // redundant_pic_cnt_present_flag
        let sps = minimal_sps();
        Pps::parse(&w.finish(), &sps).unwrap()
    }

    #[test]
    fn unknown_pps_id_is_an_error() {
        let state = StreamState::new();
        assert_eq!(state.pps(0), Err(StreamStateError::UnknownPps(0)));
    }

    #[test]
    fn stores_and_resolves_pps_chain() {
        let mut state = StreamState::new();
        let sps = minimal_sps();
        let sps_id = sps.seq_parameter_set_id;
        state.store_sps(sps);
        state.store_pps(minimal_pps(sps_id));

        let (pps, resolved_sps) = state.resolve_pps_chain(0).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(resolved_sps.seq_parameter_set_id, sps_id);
    }
}
