//! Kernel control payloads for the stateless H.264 V4L2 controls
//! (`V4L2_CID_STATELESS_H264_SPS`, `_PPS`, `_SLICE_PARAMS`, `_DECODE_PARAMS`).
//!
//! Layouts mirror `linux/v4l2-controls.h` closely enough to `memcpy` onto the
//! ioctl payload; fields the kernel doesn't use for frame-based decode are
//! left at their zero default.

use crate::dpb::DpbEntry;
use crate::params::slice::SliceType;
use crate::params::{Pps, Sps};

pub const V4L2_H264_SPS_CONSTRAINT_SET0_FLAG: u32 = 1 << 0;
pub const V4L2_H264_SPS_CONSTRAINT_SET1_FLAG: u32 = 1 << 1;
pub const V4L2_H264_SPS_CONSTRAINT_SET2_FLAG: u32 = 1 << 2;
pub const V4L2_H264_SPS_CONSTRAINT_SET3_FLAG: u32 = 1 << 3;
pub const V4L2_H264_SPS_CONSTRAINT_SET4_FLAG: u32 = 1 << 4;
pub const V4L2_H264_SPS_CONSTRAINT_SET5_FLAG: u32 = 1 << 5;

pub const V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE: u32 = 1 << 0;
pub const V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS: u32 = 1 << 1;
pub const V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO: u32 = 1 << 2;
pub const V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED: u32 = 1 << 3;
pub const V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY: u32 = 1 << 4;
pub const V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD: u32 = 1 << 5;
pub const V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE: u32 = 1 << 6;

pub const V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE: u32 = 1 << 0;
pub const V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT: u32 = 1 << 1;
pub const V4L2_H264_PPS_FLAG_WEIGHTED_PRED: u32 = 1 << 2;
pub const V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT: u32 = 1 << 3;
pub const V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED: u32 = 1 << 4;
pub const V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT: u32 = 1 << 5;
pub const V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE: u32 = 1 << 6;
pub const V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT: u32 = 1 << 7;

pub const V4L2_H264_SLICE_FLAG_IDR: u32 = 1 << 0;
pub const V4L2_H264_SLICE_FLAG_FIELD_PIC: u32 = 1 << 1;
pub const V4L2_H264_SLICE_FLAG_BOTTOM_FIELD: u32 = 1 << 2;

pub const V4L2_H264_NUM_DPB_ENTRIES: usize = 16;

const V4L2_CTRL_CLASS_CODEC_STATELESS: u32 = 0x00a2_0000;
const V4L2_CID_CODEC_STATELESS_BASE: u32 = V4L2_CTRL_CLASS_CODEC_STATELESS | 0x900;

/// Control ids for the four payloads a stateless H.264 decode submits per
/// frame/slice, bound to a media-controller request via `VIDIOC_S_EXT_CTRLS`.
pub const CID_STATELESS_H264_SPS: u32 = V4L2_CID_CODEC_STATELESS_BASE;
pub const CID_STATELESS_H264_PPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 1;
pub const CID_STATELESS_H264_SLICE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 4;
pub const CID_STATELESS_H264_DECODE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 5;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2CtrlH264Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u32,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u8,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub flags: u32,
}

impl From<&Sps> for V4l2CtrlH264Sps {
    fn from(sps: &Sps) -> Self {
        let mut constraint_set_flags = 0u32;
        if sps.constraint_set0_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET0_FLAG;
        }
        if sps.constraint_set1_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET1_FLAG;
        }
        if sps.constraint_set2_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET2_FLAG;
        }
        if sps.constraint_set3_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET3_FLAG;
        }
        if sps.constraint_set4_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET4_FLAG;
        }
        if sps.constraint_set5_flag {
            constraint_set_flags |= V4L2_H264_SPS_CONSTRAINT_SET5_FLAG;
        }

        let mut flags = 0u32;
        if sps.separate_colour_plane_flag {
            flags |= V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE;
        }
        if sps.qpprime_y_zero_transform_bypass_flag {
            flags |= V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS;
        }
        if sps.delta_pic_order_always_zero_flag {
            flags |= V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO;
        }
        if sps.gaps_in_frame_num_value_allowed_flag {
            flags |= V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED;
        }
        if sps.frame_mbs_only_flag {
            flags |= V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY;
        }
        if sps.mb_adaptive_frame_field_flag {
            flags |= V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD;
        }
        if sps.direct_8x8_inference_flag {
            flags |= V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE;
        }

        V4l2CtrlH264Sps {
            profile_idc: sps.profile_idc,
            constraint_set_flags,
            level_idc: sps.level_idc,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            chroma_format_idc: sps.chroma_format_idc,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: sps.log2_max_pic_order_cnt_lsb_minus4,
            max_num_ref_frames: sps.max_num_ref_frames.min(u8::MAX as u32) as u8,
            num_ref_frames_in_pic_order_cnt_cycle: sps.num_ref_frames_in_pic_order_cnt_cycle,
            offset_for_ref_frame: *sps.offset_for_ref_frame,
            offset_for_non_ref_pic: sps.offset_for_non_ref_pic,
            offset_for_top_to_bottom_field: sps.offset_for_top_to_bottom_field,
            pic_width_in_mbs_minus1: sps.pic_width_in_mbs_minus1.min(u16::MAX as u32) as u16,
            pic_height_in_map_units_minus1: sps
                .pic_height_in_map_units_minus1
                .min(u16::MAX as u32) as u16,
            flags,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2CtrlH264Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub num_slice_groups_minus1: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub flags: u32,
}

impl From<&Pps> for V4l2CtrlH264Pps {
    fn from(pps: &Pps) -> Self {
        let mut flags = 0u32;
        if pps.entropy_coding_mode_flag {
            flags |= V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE;
        }
        if pps.bottom_field_pic_order_in_frame_present_flag {
            flags |= V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT;
        }
        if pps.weighted_pred_flag {
            flags |= V4L2_H264_PPS_FLAG_WEIGHTED_PRED;
        }
        if pps.deblocking_filter_control_present_flag {
            flags |= V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT;
        }
        if pps.constrained_intra_pred_flag {
            flags |= V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED;
        }
        if pps.redundant_pic_cnt_present_flag {
            flags |= V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT;
        }
        if pps.transform_8x8_mode_flag {
            flags |= V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE;
        }
        if pps.pic_scaling_matrix_present_flag {
            flags |= V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT;
        }

        V4l2CtrlH264Pps {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            seq_parameter_set_id: pps.seq_parameter_set_id,
            num_slice_groups_minus1: pps.num_slice_groups_minus1.min(u8::MAX as u32) as u8,
            num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            weighted_bipred_idc: pps.weighted_bipred_idc,
            pic_init_qp_minus26: pps.pic_init_qp_minus26,
            pic_init_qs_minus26: pps.pic_init_qs_minus26,
            chroma_qp_index_offset: pps.chroma_qp_index_offset,
            second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
            flags,
        }
    }
}

/// All-zero reference-list placeholder: actual list management is driven via
/// the DPB snapshot in the decode-params control, not this control.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2CtrlH264SliceParams {
    pub header_bit_size: u32,
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub colour_plane_id: u8,
    pub redundant_pic_cnt: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list0: [u8; 32],
    pub ref_pic_list1: [u8; 32],
    pub flags: u32,
}

impl V4l2CtrlH264SliceParams {
    pub fn from_header(header: &crate::params::slice::SliceHeader, header_bit_size: u32) -> Self {
        let mut flags = 0u32;
        if header.field_pic_flag {
            flags |= V4L2_H264_SLICE_FLAG_FIELD_PIC;
        }
        if header.bottom_field_flag {
            flags |= V4L2_H264_SLICE_FLAG_BOTTOM_FIELD;
        }

        V4l2CtrlH264SliceParams {
            header_bit_size,
            first_mb_in_slice: header.first_mb_in_slice,
            slice_type: header.slice_type as u8,
            colour_plane_id: header.colour_plane_id,
            redundant_pic_cnt: header.redundant_pic_cnt.min(u8::MAX as u32) as u8,
            cabac_init_idc: header.cabac_init_idc.min(u8::MAX as u32) as u8,
            slice_qp_delta: header.slice_qp_delta.clamp(-128, 127) as i8,
            slice_qs_delta: header.slice_qs_delta.clamp(-128, 127) as i8,
            disable_deblocking_filter_idc: header.disable_deblocking_filter_idc.min(u8::MAX as u32)
                as u8,
            slice_alpha_c0_offset_div2: header.slice_alpha_c0_offset_div2.clamp(-128, 127) as i8,
            slice_beta_offset_div2: header.slice_beta_offset_div2.clamp(-128, 127) as i8,
            num_ref_idx_l0_active_minus1: header.num_ref_idx_l0_active_minus1.min(u8::MAX as u32)
                as u8,
            num_ref_idx_l1_active_minus1: header.num_ref_idx_l1_active_minus1.min(u8::MAX as u32)
                as u8,
            ref_pic_list0: [0u8; 32],
            ref_pic_list1: [0u8; 32],
            flags,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct V4l2CtrlH264DecodeParams {
    pub dpb: [DpbEntry; V4L2_H264_NUM_DPB_ENTRIES],
    pub num_slices: u16,
    pub nal_ref_idc: u16,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub flags: u32,
}

pub const V4L2_H264_DECODE_PARAM_FLAG_IDR: u32 = 1 << 0;
pub const V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC: u32 = 1 << 1;
pub const V4L2_H264_DECODE_PARAM_FLAG_BOTTOM_FIELD: u32 = 1 << 2;
pub const V4L2_H264_DECODE_PARAM_FLAG_PFRAME: u32 = 1 << 3;
pub const V4L2_H264_DECODE_PARAM_FLAG_BFRAME: u32 = 1 << 4;

impl V4l2CtrlH264DecodeParams {
    pub fn build(
        header: &crate::params::slice::SliceHeader,
        nal_ref_idc: u8,
        is_idr: bool,
        dpb: [DpbEntry; V4L2_H264_NUM_DPB_ENTRIES],
    ) -> Self {
        let mut flags = 0u32;
        if is_idr {
            flags |= V4L2_H264_DECODE_PARAM_FLAG_IDR;
        }
        if header.field_pic_flag {
            flags |= V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC;
        }
        if header.bottom_field_flag {
            flags |= V4L2_H264_DECODE_PARAM_FLAG_BOTTOM_FIELD;
        }
        match header.slice_type {
            SliceType::P | SliceType::Sp => flags |= V4L2_H264_DECODE_PARAM_FLAG_PFRAME,
            SliceType::B => flags |= V4L2_H264_DECODE_PARAM_FLAG_BFRAME,
            _ => {}
        }

        V4l2CtrlH264DecodeParams {
            dpb,
            num_slices: 1,
            nal_ref_idc: nal_ref_idc as u16,
            top_field_order_cnt: header.pic_order_cnt_lsb as i32,
            bottom_field_order_cnt: header.pic_order_cnt_lsb as i32,
            frame_num: header.frame_num.min(u16::MAX as u32) as u16,
            idr_pic_id: header.idr_pic_id.min(u16::MAX as u32) as u16,
            pic_order_cnt_lsb: header.pic_order_cnt_lsb.min(u16::MAX as u32) as u16,
            delta_pic_order_cnt_bottom: header.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: header.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: header.delta_pic_order_cnt[1],
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_param_flags_are_distinct_bits() {
        let flags = [
            V4L2_H264_DECODE_PARAM_FLAG_IDR,
            V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC,
            V4L2_H264_DECODE_PARAM_FLAG_BOTTOM_FIELD,
            V4L2_H264_DECODE_PARAM_FLAG_PFRAME,
            V4L2_H264_DECODE_PARAM_FLAG_BFRAME,
        ];
        let union = flags.iter().fold(0u32, |acc, f| acc | f);
        let popcount: u32 = flags.iter().map(|f| f.count_ones()).sum();
        assert_eq!(union.count_ones(), popcount);
    }

    #[test]
    fn dpb_snapshot_array_has_kernel_entry_count() {
        let dpb = [DpbEntry::default(); V4L2_H264_NUM_DPB_ENTRIES];
        assert_eq!(dpb.len(), 16);
    }
}
