//! Picture Parameter Set record and parser.

use crate::bitreader::BitReader;
use crate::eg::{read_se, read_ue};
use crate::params::sps::Sps;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PpsError {
    #[error("bitstream underflow while parsing PPS")]
    Underflow,
    #[error("pic_parameter_set_id {0} out of range [0,255]")]
    InvalidId(u32),
}

impl From<crate::bitreader::BitReaderError> for PpsError {
    fn from(_: crate::bitreader::BitReaderError) -> Self {
        PpsError::Underflow
    }
}

#[derive(Debug, Clone)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub slice_group_map_type: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    /// Clamped to [-26, 25] per the spec's saturating-cast rule for the
    /// kernel control struct.
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    /// Clamped to [-12, 12].
    pub chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,
    pub pic_scaling_matrix_present_flag: bool,
    pub second_chroma_qp_index_offset: i8,
}

impl Pps {
    pub fn parse(rbsp: &[u8], sps: &Sps) -> Result<Self, PpsError> {
        let mut r = BitReader::new(rbsp);

        let pic_parameter_set_id = read_ue(&mut r)?;
        if pic_parameter_set_id > 255 {
            return Err(PpsError::InvalidId(pic_parameter_set_id));
        }
        let seq_parameter_set_id = read_ue(&mut r)?;

        let entropy_coding_mode_flag = r.read_flag()?;
        let bottom_field_pic_order_in_frame_present_flag = r.read_flag()?;

        let num_slice_groups_minus1 = read_ue(&mut r)?;
        let mut slice_group_map_type = 0u32;
        if num_slice_groups_minus1 > 0 {
            slice_group_map_type = read_ue(&mut r)?;
            match slice_group_map_type {
                0 => {
                    for _ in 0..=num_slice_groups_minus1 {
                        let _run_length_minus1 = read_ue(&mut r)?;
                    }
                }
                2 => {
                    for _ in 0..num_slice_groups_minus1 {
                        let _top_left = read_ue(&mut r)?;
                        let _bottom_right = read_ue(&mut r)?;
                    }
                }
                3 | 4 | 5 => {
                    let _slice_group_change_direction_flag = r.read_flag()?;
                    let _slice_group_change_rate_minus1 = read_ue(&mut r)?;
                }
                6 => {
                    let pic_size_in_map_units_minus1 = read_ue(&mut r)?;
                    let bits_per_entry = ceil_log2(num_slice_groups_minus1 + 1);
                    for _ in 0..=pic_size_in_map_units_minus1 {
                        let _slice_group_id = r.read_bits(bits_per_entry)?;
                    }
                }
                _ => {}
            }
        }

        let num_ref_idx_l0_default_active_minus1 = read_ue(&mut r)? as u8;
        let num_ref_idx_l1_default_active_minus1 = read_ue(&mut r)? as u8;
        let weighted_pred_flag = r.read_flag()?;
        let weighted_bipred_idc = r.read_bits(2)? as u8;
        let pic_init_qp_minus26 = clamp_i32(read_se(&mut r)?, -26, 25);
        let pic_init_qs_minus26 = clamp_i32(read_se(&mut r)?, -26, 25);
        let chroma_qp_index_offset = clamp_i32(read_se(&mut r)?, -12, 12);
        let deblocking_filter_control_present_flag = r.read_flag()?;
        let constrained_intra_pred_flag = r.read_flag()?;
        let redundant_pic_cnt_present_flag = r.read_flag()?;

        let mut transform_8x8_mode_flag = false;
        let mut pic_scaling_matrix_present_flag = false;
        let mut second_chroma_qp_index_offset = chroma_qp_index_offset;

        if r.more_rbsp_data() {
            transform_8x8_mode_flag = r.read_flag()?;
            pic_scaling_matrix_present_flag = r.read_flag()?;
            if pic_scaling_matrix_present_flag {
                let num_lists = 6
                    + if sps.chroma_format_idc != 3 { 2 } else { 6 }
                        * if transform_8x8_mode_flag { 1 } else { 0 };
                for i in 0..num_lists {
                    if r.read_flag()? {
                        let size = if i < 6 { 16 } else { 64 };
                        skip_scaling_list(&mut r, size)?;
                    }
                }
            }
            second_chroma_qp_index_offset = clamp_i32(read_se(&mut r)?, -12, 12);
        }

        Ok(Pps {
            pic_parameter_set_id: pic_parameter_set_id as u8,
            seq_parameter_set_id: seq_parameter_set_id as u8,
            entropy_coding_mode_flag,
            bottom_field_pic_order_in_frame_present_flag,
            num_slice_groups_minus1,
            slice_group_map_type,
            num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1,
            weighted_pred_flag,
            weighted_bipred_idc,
            pic_init_qp_minus26,
            pic_init_qs_minus26,
            chroma_qp_index_offset,
            deblocking_filter_control_present_flag,
            constrained_intra_pred_flag,
            redundant_pic_cnt_present_flag,
            transform_8x8_mode_flag,
            pic_scaling_matrix_present_flag,
            second_chroma_qp_index_offset,
        })
    }
}

/// Reads just `pic_parameter_set_id` and `seq_parameter_set_id` off a PPS
/// RBSP, for routing a newly-seen PPS to the SPS it references before
/// committing to a full parse.
pub fn peek_seq_parameter_set_id(rbsp: &[u8]) -> Option<u8> {
    let mut r = BitReader::new(rbsp);
    let _pic_parameter_set_id = read_ue(&mut r).ok()?;
    let seq_parameter_set_id = read_ue(&mut r).ok()?;
    u8::try_from(seq_parameter_set_id).ok()
}

fn clamp_i32(v: i32, min: i32, max: i32) -> i8 {
    v.clamp(min, max) as i8
}

fn ceil_log2(v: u32) -> u32 {
    32 - (v.saturating_sub(1)).leading_zeros().min(32)
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<(), PpsError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = read_se(r)?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        last_scale = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::sps::Sps;

    /// Minimal MSB-first bit writer, mirroring the one in `sps`'s test
    /// module so PPS fixtures are built field-by-field instead of guessed
    /// from a raw byte sequence.
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

        fn push_se(&mut self, value: i32) {
            let code_num = if value > 0 {
                (value as u32) * 2 - 1
            } else {
                (-value as u32) * 2
            };
            self.push_ue(code_num);
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
        w.push_bits(66, 8); // profile_idc
        w.push_bits(0, 8); // constraint flags + reserved
        w.push_bits(30, 8); // level_idc
        w.push_ue(0); // seq_parameter_set_id
        w.push_ue(0); // log2_max_frame_num_minus4
        w.push_ue(2); // pic_order_cnt_type
        w.push_ue(1); // max_num_ref_frames
        w.push_bit(0); // gaps_in_frame_num_value_allowed_flag
        w.push_ue(9); // pic_width_in_mbs_minus1
        w.push_ue(7); // pic_height_in_map_units_minus1
        w.push_bit(1); // frame_mbs_only_flag
        w.push_bit(0); // direct_8x8_inference_flag
        w.push_bit(0); // frame_cropping_flag
        w.push_bit(0); // vui_parameters_present_flag
        Sps::parse(&w.finish()).unwrap()
    }

    /// Scenario 4 from the testable-properties section: entropy_coding_mode,
    /// weighted prediction, and the transform_8x8 extension all set.
    #[test]
    fn scenario_4_pps_with_transform_8x8() {
        let sps = minimal_sps();
        let mut w = BitWriter::new();
        w.push_ue(0); // pic_parameter_set_id
        w.push_ue(0); // seq_parameter_set_id
        w.push_bit(1); // entropy_coding_mode_flag
        w.push_bit(0); // bottom_field_pic_order_in_frame_present_flag
        w.push_ue(0); // num_slice_groups_minus1
        w.push_ue(15); // num_ref_idx_l0_default_active_minus1
        w.push_ue(0); // num_ref_idx_l1_default_active_minus1
        w.push_bit(1); // weighted_pred_flag
        w.push_bits(2, 2); // weighted_bipred_idc
        w.push_se(10); // pic_init_qp_minus26
        w.push_se(0); // pic_init_qs_minus26
        w.push_se(-2); // chroma_qp_index_offset
        w.push_bit(1); // deblocking_filter_control_present_flag
        w.push_bit(0); // constrained_intra_pred_flag
        w.push_bit(0); // redundant_pic_cnt_present_flag
        w.push_bit(1); // transform_8x8_mode_flag
        w.push_bit(0); // pic_scaling_matrix_present_flag
        w.push_se(-2); // second_chroma_qp_index_offset
        let rbsp = w.finish();

        let pps = Pps::parse(&rbsp, &sps).unwrap();
        assert!(pps.entropy_coding_mode_flag);
        assert_eq!(pps.num_ref_idx_l0_default_active_minus1, 15);
        assert!(pps.weighted_pred_flag);
        assert_eq!(pps.weighted_bipred_idc, 2);
        assert_eq!(pps.pic_init_qp_minus26, 10);
        assert_eq!(pps.chroma_qp_index_offset, -2);
        assert!(pps.deblocking_filter_control_present_flag);
        assert!(pps.transform_8x8_mode_flag);
        assert_eq!(pps.second_chroma_qp_index_offset, -2);
    }

    #[test]
    fn rejects_invalid_pps_id() {
        let sps = minimal_sps();
        let mut w = BitWriter::new();
        w.push_ue(300); // pic_parameter_set_id, out of [0,255]
        let rbsp = w.finish();
        let err = Pps::parse(&rbsp, &sps).unwrap_err();
        assert_eq!(err, PpsError::InvalidId(300));
    }
}
