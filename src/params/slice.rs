//! Slice header parser.

use crate::bitreader::BitReader;
use crate::eg::{read_se, read_ue};
use crate::nal::NalUnitType;
use crate::params::pps::Pps;
use crate::params::sps::Sps;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceHeaderError {
    #[error("bitstream underflow while parsing slice header")]
    Underflow,
    #[error("invalid slice_type {0}")]
    InvalidSliceType(u32),
    #[error("pic_parameter_set_id {0} out of range [0,255]")]
    InvalidPpsId(u32),
}

impl From<crate::bitreader::BitReaderError> for SliceHeaderError {
    fn from(_: crate::bitreader::BitReaderError) -> Self {
        SliceHeaderError::Underflow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn from_value(value: u32) -> Self {
        match value % 5 {
            0 => SliceType::P,
            1 => SliceType::B,
            2 => SliceType::I,
            3 => SliceType::Sp,
            _ => SliceType::Si,
        }
    }

    pub fn is_p_like(self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }
}

/// One entry of a `ref_pic_list_modification` loop: `(modification_of_pic_nums_idc, value)`.
/// Terminated in the bitstream by idc == 3, which is not stored as an entry.
#[derive(Debug, Clone, Copy)]
pub struct RefPicListModOp {
    pub idc: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    pub chroma_log2_weight_denom: u32,
    pub luma_weights_l0: Vec<(i32, i32)>,
    pub chroma_weights_l0: Vec<[(i32, i32); 2]>,
    pub luma_weights_l1: Vec<(i32, i32)>,
    pub chroma_weights_l1: Vec<[(i32, i32); 2]>,
}

/// One `memory_management_control_operation` entry with whatever side data
/// that op carries (unused fields are left at 0 for ops that don't use them).
#[derive(Debug, Clone, Copy)]
pub struct MmcoOp {
    pub op: u32,
    pub difference_of_pic_nums_minus1: u32,
    pub long_term_pic_num: u32,
    pub long_term_frame_idx: u32,
    pub max_long_term_frame_idx_plus1: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DecRefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub mmco_ops: Vec<MmcoOp>,
}

#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub ref_pic_list_mod_l0: Vec<RefPicListModOp>,
    pub ref_pic_list_mod_l1: Vec<RefPicListModOp>,
    pub pred_weight_table: Option<PredWeightTable>,
    pub dec_ref_pic_marking: DecRefPicMarking,
    pub cabac_init_idc: u32,
    pub slice_qp_delta: i32,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i32,
    pub disable_deblocking_filter_idc: u32,
    pub slice_alpha_c0_offset_div2: i32,
    pub slice_beta_offset_div2: i32,
    pub slice_group_change_cycle: u32,
    /// Bit length of the header as parsed, i.e. `r.bit_position()` at the
    /// end of parsing. Forwarded verbatim into the kernel slice-params
    /// control's `header_bit_size` field.
    pub header_bit_size: u32,
}

impl SliceHeader {
    pub fn parse(
        rbsp: &[u8],
        nal_ref_idc: u8,
        nal_type: NalUnitType,
        sps: &Sps,
        pps: &Pps,
    ) -> Result<Self, SliceHeaderError> {
        let mut r = BitReader::new(rbsp);

        let first_mb_in_slice = read_ue(&mut r)?;
        let slice_type_value = read_ue(&mut r)?;
        let slice_type = SliceType::from_value(slice_type_value);

        let pic_parameter_set_id = read_ue(&mut r)?;
        if pic_parameter_set_id > 255 {
            return Err(SliceHeaderError::InvalidPpsId(pic_parameter_set_id));
        }

        let mut colour_plane_id = 0;
        if sps.separate_colour_plane_flag {
            colour_plane_id = r.read_bits(2)? as u8;
        }

        let frame_num_bits = sps.log2_max_frame_num_minus4 as u32 + 4;
        let frame_num = r.read_bits(frame_num_bits)?;

        let mut field_pic_flag = false;
        let mut bottom_field_flag = false;
        if !sps.frame_mbs_only_flag {
            field_pic_flag = r.read_flag()?;
            if field_pic_flag {
                bottom_field_flag = r.read_flag()?;
            }
        }

        let is_idr = nal_type == NalUnitType::IdrSlice;
        let mut idr_pic_id = 0;
        if is_idr {
            idr_pic_id = read_ue(&mut r)?;
        }

        let mut pic_order_cnt_lsb = 0;
        let mut delta_pic_order_cnt_bottom = 0;
        let mut delta_pic_order_cnt = [0i32, 0i32];

        if sps.pic_order_cnt_type == 0 {
            let bits = sps.log2_max_pic_order_cnt_lsb_minus4 as u32 + 4;
            pic_order_cnt_lsb = r.read_bits(bits)?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt_bottom = read_se(&mut r)?;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            delta_pic_order_cnt[0] = read_se(&mut r)?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !field_pic_flag {
                delta_pic_order_cnt[1] = read_se(&mut r)?;
            }
        }

        let mut redundant_pic_cnt = 0;
        if pps.redundant_pic_cnt_present_flag {
            redundant_pic_cnt = read_ue(&mut r)?;
        }

        let mut direct_spatial_mv_pred_flag = false;
        if matches!(slice_type, SliceType::B) {
            direct_spatial_mv_pred_flag = r.read_flag()?;
        }

        let mut num_ref_idx_active_override_flag = false;
        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1 as u32;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1 as u32;

        let is_p_sp_b = slice_type.is_p_like() || matches!(slice_type, SliceType::B);
        if is_p_sp_b {
            num_ref_idx_active_override_flag = r.read_flag()?;
            if num_ref_idx_active_override_flag {
                num_ref_idx_l0_active_minus1 = read_ue(&mut r)?;
                if matches!(slice_type, SliceType::B) {
                    num_ref_idx_l1_active_minus1 = read_ue(&mut r)?;
                }
            }
        }

        let ref_pic_list_mod_l0 = if is_p_sp_b {
            parse_ref_pic_list_mod(&mut r)?
        } else {
            Vec::new()
        };
        let ref_pic_list_mod_l1 = if matches!(slice_type, SliceType::B) {
            parse_ref_pic_list_mod(&mut r)?
        } else {
            Vec::new()
        };

        let pred_weight_table = if (pps.weighted_pred_flag && is_p_sp_b && !matches!(slice_type, SliceType::I | SliceType::Si))
            || (pps.weighted_bipred_idc == 1 && matches!(slice_type, SliceType::B))
        {
            Some(parse_pred_weight_table(
                &mut r,
                sps,
                num_ref_idx_l0_active_minus1,
                num_ref_idx_l1_active_minus1,
                matches!(slice_type, SliceType::B),
            )?)
        } else {
            None
        };

        let dec_ref_pic_marking = if nal_ref_idc != 0 {
            parse_dec_ref_pic_marking(&mut r, is_idr)?
        } else {
            DecRefPicMarking::default()
        };

        let mut cabac_init_idc = 0;
        if pps.entropy_coding_mode_flag && !matches!(slice_type, SliceType::I | SliceType::Si) {
            cabac_init_idc = read_ue(&mut r)?;
        }

        let slice_qp_delta = read_se(&mut r)?;

        let mut sp_for_switch_flag = false;
        let mut slice_qs_delta = 0;
        if matches!(slice_type, SliceType::Sp | SliceType::Si) {
            if matches!(slice_type, SliceType::Sp) {
                sp_for_switch_flag = r.read_flag()?;
            }
            slice_qs_delta = read_se(&mut r)?;
        }

        let mut disable_deblocking_filter_idc = 0;
        let mut slice_alpha_c0_offset_div2 = 0;
        let mut slice_beta_offset_div2 = 0;
        if pps.deblocking_filter_control_present_flag {
            disable_deblocking_filter_idc = read_ue(&mut r)?;
            if disable_deblocking_filter_idc != 1 {
                slice_alpha_c0_offset_div2 = read_se(&mut r)?;
                slice_beta_offset_div2 = read_se(&mut r)?;
            }
        }

        let mut slice_group_change_cycle = 0;
        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            slice_group_change_cycle = read_ue(&mut r)?;
        }

        let header_bit_size = r.bit_position() as u32;

        Ok(SliceHeader {
            first_mb_in_slice,
            slice_type,
            pic_parameter_set_id: pic_parameter_set_id as u8,
            colour_plane_id,
            frame_num,
            field_pic_flag,
            bottom_field_flag,
            idr_pic_id,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt,
            redundant_pic_cnt,
            direct_spatial_mv_pred_flag,
            num_ref_idx_active_override_flag,
            num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1,
            ref_pic_list_mod_l0,
            ref_pic_list_mod_l1,
            pred_weight_table,
            dec_ref_pic_marking,
            cabac_init_idc,
            slice_qp_delta,
            sp_for_switch_flag,
            slice_qs_delta,
            disable_deblocking_filter_idc,
            slice_alpha_c0_offset_div2,
            slice_beta_offset_div2,
            slice_group_change_cycle,
            header_bit_size,
        })
    }
}

/// Reads just `first_mb_in_slice`, `slice_type`, and `pic_parameter_set_id`
/// off a slice RBSP, so the caller can resolve the PPS/SPS chain before
/// committing to a full [`SliceHeader::parse`].
pub fn peek_pic_parameter_set_id(rbsp: &[u8]) -> Option<u8> {
    let mut r = BitReader::new(rbsp);
    let _first_mb_in_slice = read_ue(&mut r).ok()?;
    let _slice_type = read_ue(&mut r).ok()?;
    let pic_parameter_set_id = read_ue(&mut r).ok()?;
    u8::try_from(pic_parameter_set_id).ok()
}

fn parse_ref_pic_list_mod(r: &mut BitReader) -> Result<Vec<RefPicListModOp>, SliceHeaderError> {
    let mut ops = Vec::new();
    let flag = r.read_flag()?;
    if !flag {
        return Ok(ops);
    }
    loop {
        let idc = read_ue(r)?;
        if idc == 3 {
            break;
        }
        let value = read_ue(r)?;
        ops.push(RefPicListModOp { idc, value });
    }
    Ok(ops)
}

fn parse_pred_weight_table(
    r: &mut BitReader,
    sps: &Sps,
    num_ref_idx_l0_active_minus1: u32,
    num_ref_idx_l1_active_minus1: u32,
    is_b: bool,
) -> Result<PredWeightTable, SliceHeaderError> {
    let mut table = PredWeightTable::default();
    table.luma_log2_weight_denom = read_ue(r)?;
    if sps.chroma_format_idc != 0 {
        table.chroma_log2_weight_denom = read_ue(r)?;
    }

    for _ in 0..=num_ref_idx_l0_active_minus1 {
        let (luma, chroma) = parse_one_weight_entry(r, sps, table.luma_log2_weight_denom, table.chroma_log2_weight_denom)?;
        table.luma_weights_l0.push(luma);
        table.chroma_weights_l0.push(chroma);
    }
    if is_b {
        for _ in 0..=num_ref_idx_l1_active_minus1 {
            let (luma, chroma) = parse_one_weight_entry(r, sps, table.luma_log2_weight_denom, table.chroma_log2_weight_denom)?;
            table.luma_weights_l1.push(luma);
            table.chroma_weights_l1.push(chroma);
        }
    }
    Ok(table)
}

fn parse_one_weight_entry(
    r: &mut BitReader,
    sps: &Sps,
    luma_denom: u32,
    chroma_denom: u32,
) -> Result<((i32, i32), [(i32, i32); 2]), SliceHeaderError> {
    let default_luma_weight = 1 << luma_denom;
    let mut luma = (default_luma_weight, 0i32);
    let luma_weight_flag = r.read_flag()?;
    if luma_weight_flag {
        luma.0 = read_se(r)?;
        luma.1 = read_se(r)?;
    }
    let default_chroma_weight = 1 << chroma_denom;
    let mut chroma = [(default_chroma_weight, 0i32), (default_chroma_weight, 0i32)];
    if sps.chroma_format_idc != 0 {
        let chroma_weight_flag = r.read_flag()?;
        if chroma_weight_flag {
            for c in chroma.iter_mut() {
                c.0 = read_se(r)?;
                c.1 = read_se(r)?;
            }
        }
    }
    Ok((luma, chroma))
}

fn parse_dec_ref_pic_marking(
    r: &mut BitReader,
    is_idr: bool,
) -> Result<DecRefPicMarking, SliceHeaderError> {
    let mut marking = DecRefPicMarking::default();
    if is_idr {
        marking.no_output_of_prior_pics_flag = r.read_flag()?;
        marking.long_term_reference_flag = r.read_flag()?;
    } else {
        marking.adaptive_ref_pic_marking_mode_flag = r.read_flag()?;
        if marking.adaptive_ref_pic_marking_mode_flag {
            loop {
                let op = read_ue(r)?;
                if op == 0 {
                    break;
                }
                let mut entry = MmcoOp {
                    op,
                    difference_of_pic_nums_minus1: 0,
                    long_term_pic_num: 0,
                    long_term_frame_idx: 0,
                    max_long_term_frame_idx_plus1: 0,
                };
                match op {
                    1 => entry.difference_of_pic_nums_minus1 = read_ue(r)?,
                    2 => entry.long_term_pic_num = read_ue(r)?,
                    3 => {
                        entry.difference_of_pic_nums_minus1 = read_ue(r)?;
                        entry.long_term_frame_idx = read_ue(r)?;
                    }
                    4 => entry.max_long_term_frame_idx_plus1 = read_ue(r)?,
                    6 => entry.long_term_frame_idx = read_ue(r)?,
                    _ => {}
                }
                marking.mmco_ops.push(entry);
            }
        }
    }
    Ok(marking)
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

    fn minimal_pps() -> Pps {
        let mut w = BitWriter::new();
        w.push_ue(0); // pic_parameter_set_id
        w.push_ue(0); // seq_parameter_set_id
        w.push_bit(0); // entropy_coding_mode_flag
        w.push_bit(0); // bottom_field_pic_order_in_frame_present_flag
        w.push_ue(0); // num_slice_groups_minus1
        w.push_ue(0); // num_ref_idx_l0_default_active_minus1
        w.push_ue(0); // num_ref_idx_l1_default_active_minus1
        w.push_bit(0); // weighted_pred_flag
        w.push_bits(0, 2); // weighted_bipred_idc
        w.push_se(0); // pic_init_qp_minus26
        w.push_se(0); // pic_init_qs_minus26
        w.push_se(0); // chroma_qp_index_offset
        w.push_bit(0); // deblocking_filter_control_present_flag
        w.push_bit(0); // constrained_intra_pred_flag
        w.push_bit(0); // redundant_pic_cnt_present_flag
        let sps = minimal_sps();
        Pps::parse(&w.finish(), &sps).unwrap()
    }

    #[test]
    fn slice_type_classification_wraps_mod_5() {
        assert_eq!(SliceType::from_value(7) as u32, SliceType::I as u32);
        assert_eq!(SliceType::from_value(0) as u32, SliceType::P as u32);
        assert_eq!(SliceType::from_value(3) as u32, SliceType::Sp as u32);
    }

    /// Scenario 5 from the testable-properties section: an IDR slice with
    /// slice_type=7 (I), slice_qp_delta=-12, all ref-list-mod counts zero.
    #[test]
    fn scenario_5_idr_slice_header() {
        let sps = minimal_sps();
        let pps = minimal_pps();

        let mut w = BitWriter::new();
        w.push_ue(0); // first_mb_in_slice
        w.push_ue(7); // slice_type = 7 -> I
        w.push_ue(0); // pic_parameter_set_id
        w.push_bits(0, 4); // frame_num (log2_max_frame_num_minus4=0 -> 4 bits)
        w.push_ue(0); // idr_pic_id (IDR)
        // pic_order_cnt_type == 2: no POC fields
        // slice_type I: no ref-idx override, no ref-list-mod, no pred-weight
        w.push_bit(0); // no_output_of_prior_pics_flag
        w.push_bit(0); // long_term_reference_flag
        w.push_se(-12); // slice_qp_delta
        let rbsp = w.finish();

        let header = SliceHeader::parse(&rbsp, 1, NalUnitType::IdrSlice, &sps, &pps).unwrap();
        assert_eq!(header.first_mb_in_slice, 0);
        assert_eq!(header.slice_type as u32, SliceType::I as u32);
        assert_eq!(header.slice_qp_delta, -12);
        assert!(header.ref_pic_list_mod_l0.is_empty());
        assert!(header.ref_pic_list_mod_l1.is_empty());
        assert!(!header.dec_ref_pic_marking.no_output_of_prior_pics_flag);
    }

    #[test]
    fn p_slice_reads_ref_pic_list_modification() {
        let sps = minimal_sps();
        let pps = minimal_pps();

        let mut w = BitWriter::new();
        w.push_ue(0); // first_mb_in_slice
        w.push_ue(0); // slice_type = 0 -> P
        w.push_ue(0); // pic_parameter_set_id
        w.push_bits(0, 4); // frame_num
        // pic_order_cnt_type == 2
        w.push_bit(0); // num_ref_idx_active_override_flag
        w.push_bit(1); // ref_pic_list_modification_flag_l0
        w.push_ue(0); // idc 0
        w.push_ue(3); // abs_diff_pic_num_minus1
        w.push_ue(3); // sentinel idc terminates loop
        w.push_se(0); // slice_qp_delta
        let rbsp = w.finish();

        let header = SliceHeader::parse(&rbsp, 1, NalUnitType::NonIdrSlice, &sps, &pps).unwrap();
        assert_eq!(header.ref_pic_list_mod_l0.len(), 1);
        assert_eq!(header.ref_pic_list_mod_l0[0].idc, 0);
        assert_eq!(header.ref_pic_list_mod_l0[0].value, 3);
    }
}
