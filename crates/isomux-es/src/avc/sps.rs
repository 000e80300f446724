//! AVC sequence and picture parameter set parsing.

use std::io::Cursor;

use isomux_common::{Error, Result};
use isomux_io::BitReader;

use crate::es_err;

pub const MAX_SPS: usize = 32;
pub const MAX_PPS: usize = 256;

/// Level ceiling for the default HRD tables.
const SUPPORTED_LEVEL: u8 = 53;

/// MaxBR per level_idc (ITU-T H.264 table A-1), kbits/s units before
/// the per-profile NAL factor is applied.
fn max_br(level_idc: u8) -> u32 {
    match level_idc {
        10 => 64,
        11 => 192,
        12 => 384,
        13 => 768,
        20 => 2_000,
        21 => 4_000,
        22 => 4_000,
        30 => 10_000,
        31 => 14_000,
        32 => 20_000,
        40 => 20_000,
        41 => 50_000,
        42 => 50_000,
        50 => 135_000,
        51 => 240_000,
        52 => 240_000,
        _ => 0,
    }
}

/// MaxCPB per level_idc.
fn max_cpb(level_idc: u8) -> u32 {
    match level_idc {
        10 => 175,
        11 => 500,
        12 => 1_000,
        13 => 2_000,
        20 => 2_000,
        21 => 4_000,
        22 => 4_000,
        30 => 10_000,
        31 => 14_000,
        32 => 20_000,
        40 => 25_000,
        41 => 62_500,
        42 => 62_500,
        50 => 135_000,
        51 => 240_000,
        52 => 240_000,
        _ => 0,
    }
}

/// cpbBrNalFactor per profile_idc; 0 means the profile is unknown.
pub(crate) fn cpb_br_nal_factor(profile_idc: u8) -> u32 {
    match profile_idc {
        66 | 77 | 88 => 1200,
        100 => 1500,
        110 => 3600,
        122 | 244 => 4800,
        44 => 4800,
        118 => 1500, // MVC
        128 => 1500, // stereo high
        134 => 1500, // Dolby 3D
        _ => 0,
    }
}

/// Table E-1 sample aspect ratios, indexed by aspect_ratio_idc 1..=16.
const ASPECT_RATIO_TBL: [(u16, u16); 17] = [
    (0, 0),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// Parsed sequence parameter set, including the VUI/HRD values the
/// muxer cares about. Absent HRD values are synthesized from the
/// profile/level tables so downstream code always sees a usable pair.
#[derive(Debug, Clone, Default)]
pub struct Sps {
    pub defined: bool,
    pub sps_id: u8,
    pub profile_idc: u8,
    pub compatibility: u8,
    pub level_idc: u8,

    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,

    pub log2_max_frame_num_minus4: u32,
    pub max_frame_num: u32,

    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub max_poc_lsb: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub expected_delta_per_poc_cycle: i32,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed: bool,
    pub frame_mbs_only_flag: bool,

    pub pic_width: u32,
    pub pic_height: u32,
    pub pic_width_out: u32,
    pub pic_height_out: u32,

    // VUI
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_signal_info_present: bool,
    pub video_full_range_flag: bool,
    pub colour_description_present: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate: bool,
    pub nal_hrd_present: bool,
    pub vcl_hrd_present: bool,
    pub low_delay_hrd: bool,
    pub pic_struct_present: bool,
    pub bitstream_restriction: bool,
    pub num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,

    pub cpb_dpb_delays_present: bool,
    pub bit_rate_first: u32,
    pub bit_rate_last: u32,
    pub cpb_size_first: u32,
    pub cpb_size_last: u32,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

impl Sps {
    pub fn num_ref_frames_in_pic_order_cnt_cycle(&self) -> usize {
        self.offset_for_ref_frame.len()
    }
}

/// Parsed picture parameter set (the fields the muxer needs).
#[derive(Debug, Clone, Copy, Default)]
pub struct Pps {
    pub defined: bool,
    pub pps_id: u8,
    pub sps_id: u8,
    pub bottom_field_pic_order_in_frame_present: bool,
    pub redundant_pic_cnt_present: bool,
}

type Rbsp<'a> = BitReader<Cursor<&'a [u8]>>;

fn skip_scaling_list(r: &mut Rbsp<'_>, idx: u32) -> Result<()> {
    let size = if idx < 6 { 16 } else { 64 };
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se().map_err(es_err("scaling list"))?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

fn parse_hrd_parameters(sps: &mut Sps, r: &mut Rbsp<'_>, save_cpb: bool) -> Result<()> {
    let e = es_err("hrd parameters");
    let cpb_cnt_minus1 = r.read_ue().map_err(es_err("hrd parameters"))?;
    let bit_rate_scale = r.read_bits(4).map_err(es_err("hrd parameters"))?;
    let cpb_size_scale = r.read_bits(4).map_err(es_err("hrd parameters"))?;

    for ix in 0..=cpb_cnt_minus1 {
        let v = r.read_ue().map_err(es_err("hrd parameters"))?;
        let bit_rate = (v + 1) << (6 + bit_rate_scale);
        if save_cpb {
            if ix == 0 {
                sps.bit_rate_first = bit_rate;
            }
            if ix == cpb_cnt_minus1 {
                sps.bit_rate_last = bit_rate;
            }
        }

        let v = r.read_ue().map_err(es_err("hrd parameters"))?;
        let cpb_size = (v + 1) << (4 + cpb_size_scale);
        if save_cpb {
            if ix == 0 {
                sps.cpb_size_first = cpb_size;
            }
            if ix == cpb_cnt_minus1 {
                sps.cpb_size_last = cpb_size;
            }
        }

        r.read_bit().map_err(es_err("hrd parameters"))?; // cbr_flag
    }

    let initial = r.read_bits(5).map_err(es_err("hrd parameters"))? as u8;
    let removal = r.read_bits(5).map_err(es_err("hrd parameters"))? as u8;
    let output = r.read_bits(5).map_err(es_err("hrd parameters"))? as u8;
    let time_offset = r.read_bits(5).map_err(e)? as u8;
    if save_cpb {
        sps.initial_cpb_removal_delay_length_minus1 = initial;
        sps.cpb_removal_delay_length_minus1 = removal;
        sps.dpb_output_delay_length_minus1 = output;
        sps.time_offset_length = time_offset;
    }
    Ok(())
}

fn parse_vui_parameters(sps: &mut Sps, r: &mut Rbsp<'_>) -> Result<()> {
    let e = es_err("vui parameters");
    if r.read_bool().map_err(es_err("vui parameters"))? {
        // aspect_ratio_info
        let idc = r.read_bits(8).map_err(es_err("vui parameters"))? as u8;
        if idc == 0xff {
            sps.sar_width = r.read_bits(16).map_err(es_err("vui parameters"))? as u16;
            sps.sar_height = r.read_bits(16).map_err(es_err("vui parameters"))? as u16;
        } else if (idc as usize) < ASPECT_RATIO_TBL.len() {
            let (w, h) = ASPECT_RATIO_TBL[idc as usize];
            sps.sar_width = w;
            sps.sar_height = h;
        }
    }

    if r.read_bool().map_err(es_err("vui parameters"))? {
        // overscan_info
        r.read_bit().map_err(es_err("vui parameters"))?;
    }

    sps.video_signal_info_present = r.read_bool().map_err(es_err("vui parameters"))?;
    if sps.video_signal_info_present {
        r.read_bits(3).map_err(es_err("vui parameters"))?; // video_format
        sps.video_full_range_flag = r.read_bool().map_err(es_err("vui parameters"))?;
        sps.colour_description_present = r.read_bool().map_err(es_err("vui parameters"))?;
        if sps.colour_description_present {
            sps.colour_primaries = r.read_bits(8).map_err(es_err("vui parameters"))? as u8;
            sps.transfer_characteristics = r.read_bits(8).map_err(es_err("vui parameters"))? as u8;
            sps.matrix_coefficients = r.read_bits(8).map_err(es_err("vui parameters"))? as u8;
        }
    }

    if r.read_bool().map_err(es_err("vui parameters"))? {
        // chroma_loc_info
        r.read_ue().map_err(es_err("vui parameters"))?;
        r.read_ue().map_err(es_err("vui parameters"))?;
    }

    sps.timing_info_present = r.read_bool().map_err(es_err("vui parameters"))?;
    if sps.timing_info_present {
        sps.num_units_in_tick = r.read_bits(32).map_err(es_err("vui parameters"))?;
        sps.time_scale = r.read_bits(32).map_err(es_err("vui parameters"))?;
        sps.fixed_frame_rate = r.read_bool().map_err(es_err("vui parameters"))?;
        // values that make no sense are dropped; we may have run off the SPS
        if sps.num_units_in_tick == 0 || sps.time_scale == 0 {
            sps.timing_info_present = false;
        }
    }

    sps.nal_hrd_present = r.read_bool().map_err(es_err("vui parameters"))?;
    if sps.nal_hrd_present {
        parse_hrd_parameters(sps, r, true)?;
    }
    sps.vcl_hrd_present = r.read_bool().map_err(es_err("vui parameters"))?;
    if sps.vcl_hrd_present {
        parse_hrd_parameters(sps, r, !sps.nal_hrd_present)?;
    }
    if sps.nal_hrd_present || sps.vcl_hrd_present {
        sps.low_delay_hrd = r.read_bool().map_err(es_err("vui parameters"))?;
    }

    sps.pic_struct_present = r.read_bool().map_err(es_err("vui parameters"))?;

    sps.bitstream_restriction = r.read_bool().map_err(e)?;
    if sps.bitstream_restriction {
        let e = es_err("vui bitstream restriction");
        r.read_bit().map_err(es_err("vui bitstream restriction"))?;
        r.read_ue().map_err(es_err("vui bitstream restriction"))?; // max_bytes_per_pic_denom
        r.read_ue().map_err(es_err("vui bitstream restriction"))?; // max_bits_per_mb_denom
        r.read_ue().map_err(es_err("vui bitstream restriction"))?; // log2_max_mv_length_horizontal
        r.read_ue().map_err(es_err("vui bitstream restriction"))?; // log2_max_mv_length_vertical
        sps.num_reorder_frames = r.read_ue().map_err(es_err("vui bitstream restriction"))?;
        sps.max_dec_frame_buffering = r.read_ue().map_err(e)?;
    }
    Ok(())
}

/// VUI with defaults: stores signaled values and synthesizes the
/// default bit-rate/CPB pair from the profile/level tables when the
/// stream carries no usable NAL HRD.
fn finish_vui(sps: &mut Sps, r: &mut Rbsp<'_>) -> Result<()> {
    sps.sar_width = 0;
    sps.sar_height = 0;
    sps.timing_info_present = false;
    sps.nal_hrd_present = false;
    sps.vcl_hrd_present = false;
    sps.low_delay_hrd = false;
    sps.pic_struct_present = false;
    sps.bitstream_restriction = false;
    sps.colour_primaries = 2;
    sps.transfer_characteristics = 2;
    sps.matrix_coefficients = 2;

    if r.read_bool().map_err(es_err("sps"))? {
        parse_vui_parameters(sps, r)?;
    }

    sps.cpb_dpb_delays_present = sps.nal_hrd_present || sps.vcl_hrd_present;

    if !sps.nal_hrd_present || sps.bit_rate_last < 100_000 || sps.cpb_size_last < 100_000 {
        let factor = cpb_br_nal_factor(sps.profile_idc);
        let level_1b = (sps.compatibility & 0x10 != 0 && sps.level_idc == 11) || sps.level_idc == 9;
        if level_1b {
            sps.bit_rate_first = factor * 128;
            sps.cpb_size_first = factor * 350;
        } else {
            sps.bit_rate_first = factor * max_br(sps.level_idc);
            sps.cpb_size_first = factor * max_cpb(sps.level_idc);
            if sps.profile_idc == 128 || sps.profile_idc == 134 {
                // 15 Mbps cases must come from VUI signaling
                match sps.level_idc {
                    40 => sps.bit_rate_first = 1200 * max_br(sps.level_idc),
                    41 => sps.bit_rate_first = 800 * max_br(sps.level_idc),
                    _ => {
                        return Err(Error::es(
                            "stereo/3D profile with a level that has no default HRD",
                        ))
                    }
                }
            }
        }
        sps.bit_rate_last = sps.bit_rate_first;
        sps.cpb_size_last = sps.cpb_size_first;
    }

    if !sps.cpb_dpb_delays_present {
        sps.initial_cpb_removal_delay_length_minus1 = 23;
        sps.cpb_removal_delay_length_minus1 = 23;
        sps.dpb_output_delay_length_minus1 = 23;
        sps.time_offset_length = 24;
    }

    if !sps.bitstream_restriction {
        sps.num_reorder_frames = 16;
        sps.max_dec_frame_buffering = 16;
    }
    Ok(())
}

/// Parse an SPS RBSP (after the NAL header byte).
pub fn parse_sps(rbsp: &[u8]) -> Result<Sps> {
    let mut r = BitReader::from_slice(rbsp);
    let e = es_err("sps");

    let profile_idc = r.read_u8().map_err(es_err("sps"))?;
    if profile_idc > 224 || cpb_br_nal_factor(profile_idc) == 0 {
        return Err(Error::es(format!("unknown profile_idc {profile_idc}")));
    }
    let compatibility = r.read_u8().map_err(es_err("sps"))?;
    let level_idc = r.read_u8().map_err(es_err("sps"))?;
    if level_idc > SUPPORTED_LEVEL || max_br(level_idc) == 0 {
        return Err(Error::es(format!("unknown level_idc {level_idc}")));
    }

    let sps_id = r.read_ue().map_err(es_err("sps"))?;
    if sps_id >= MAX_SPS as u32 {
        return Err(Error::es(format!("seq_parameter_set_id {sps_id} out of range")));
    }

    let mut sps = Sps {
        defined: true,
        sps_id: sps_id as u8,
        profile_idc,
        compatibility,
        level_idc,
        chroma_format_idc: 1,
        ..Sps::default()
    };

    // FRExt profiles carry the chroma/bit-depth block
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 134
    ) {
        sps.chroma_format_idc = r.read_ue().map_err(es_err("sps"))?;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bool().map_err(es_err("sps"))?;
        }
        sps.bit_depth_luma_minus8 = r.read_ue().map_err(es_err("sps"))?;
        sps.bit_depth_chroma_minus8 = r.read_ue().map_err(es_err("sps"))?;
        r.read_bit().map_err(es_err("sps"))?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bool().map_err(es_err("sps"))? {
            let count = if sps.chroma_format_idc != 3 { 8 } else { 12 };
            for ix in 0..count {
                if r.read_bool().map_err(es_err("sps"))? {
                    skip_scaling_list(&mut r, ix)?;
                }
            }
        }
    }

    sps.log2_max_frame_num_minus4 = r.read_ue().map_err(es_err("sps"))?;
    sps.max_frame_num = 1 << (sps.log2_max_frame_num_minus4 + 4);

    sps.pic_order_cnt_type = r.read_ue().map_err(es_err("sps"))?;
    if sps.pic_order_cnt_type == 0 {
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue().map_err(es_err("sps"))?;
        sps.max_poc_lsb = 1 << (sps.log2_max_pic_order_cnt_lsb_minus4 + 4);
    } else if sps.pic_order_cnt_type == 1 {
        sps.delta_pic_order_always_zero_flag = r.read_bool().map_err(es_err("sps"))?;
        sps.offset_for_non_ref_pic = r.read_se().map_err(es_err("sps"))?;
        sps.offset_for_top_to_bottom_field = r.read_se().map_err(es_err("sps"))?;
        let count = r.read_ue().map_err(es_err("sps"))?.min(255);
        sps.expected_delta_per_poc_cycle = 0;
        for _ in 0..count {
            let off = r.read_se().map_err(es_err("sps"))?;
            sps.offset_for_ref_frame.push(off);
            sps.expected_delta_per_poc_cycle += off;
        }
    }

    sps.max_num_ref_frames = r.read_ue().map_err(es_err("sps"))?;
    sps.gaps_in_frame_num_value_allowed = r.read_bool().map_err(es_err("sps"))?;

    let pic_width_in_mbs = r.read_ue().map_err(es_err("sps"))? + 1;
    sps.pic_width = pic_width_in_mbs * 16;
    let pic_height_in_map_units = r.read_ue().map_err(es_err("sps"))? + 1;
    sps.frame_mbs_only_flag = r.read_bool().map_err(es_err("sps"))?;
    sps.pic_height = (2 - sps.frame_mbs_only_flag as u32) * pic_height_in_map_units * 16;

    if !sps.frame_mbs_only_flag {
        r.read_bit().map_err(es_err("sps"))?; // mb_adaptive_frame_field_flag
    }
    r.read_bit().map_err(es_err("sps"))?; // direct_8x8_inference_flag

    sps.pic_width_out = sps.pic_width;
    sps.pic_height_out = sps.pic_height;
    if r.read_bool().map_err(e)? {
        // frame cropping, chroma-format-aware units
        let e = es_err("sps cropping");
        let left = r.read_ue().map_err(es_err("sps cropping"))?;
        let right = r.read_ue().map_err(es_err("sps cropping"))?;
        let top = r.read_ue().map_err(es_err("sps cropping"))?;
        let bottom = r.read_ue().map_err(e)?;
        let crop_unit_x = if sps.chroma_format_idc == 1 || sps.chroma_format_idc == 2 {
            2
        } else {
            1
        };
        let crop_unit_y = (if sps.chroma_format_idc == 1 { 2 } else { 1 })
            * (2 - sps.frame_mbs_only_flag as u32);
        sps.pic_width_out = sps
            .pic_width_out
            .saturating_sub(crop_unit_x * (left + right));
        sps.pic_height_out = sps
            .pic_height_out
            .saturating_sub(crop_unit_y * (top + bottom));
    }

    finish_vui(&mut sps, &mut r)?;
    Ok(sps)
}

/// Trailing-bit pattern for `n` remaining bits: a stop bit followed by
/// zeros.
fn trailing_bits(n: u32) -> u32 {
    1 << (n - 1)
}

/// Parse a PPS RBSP (after the NAL header byte).
pub fn parse_pps(rbsp: &[u8]) -> Result<Pps> {
    let mut r = BitReader::from_slice(rbsp);
    let e = es_err("pps");

    let pps_id = r.read_ue().map_err(es_err("pps"))?;
    if pps_id >= MAX_PPS as u32 {
        return Err(Error::es(format!("pic_parameter_set_id {pps_id} out of range")));
    }
    let sps_id = r.read_ue().map_err(es_err("pps"))?;
    if sps_id >= MAX_SPS as u32 {
        return Err(Error::es(format!("seq_parameter_set_id {sps_id} in pps out of range")));
    }

    let mut pps = Pps {
        defined: true,
        pps_id: pps_id as u8,
        sps_id: sps_id as u8,
        ..Pps::default()
    };

    r.read_bit().map_err(es_err("pps"))?; // entropy_coding_mode_flag
    pps.bottom_field_pic_order_in_frame_present = r.read_bool().map_err(es_err("pps"))?;

    let num_slice_groups = r.read_ue().map_err(es_err("pps"))?;
    if num_slice_groups > 0 {
        let map_type = r.read_ue().map_err(es_err("pps"))?;
        match map_type {
            0 => {
                for _ in 0..=num_slice_groups {
                    r.read_ue().map_err(es_err("pps"))?;
                }
            }
            2 => {
                for _ in 0..num_slice_groups {
                    r.read_ue().map_err(es_err("pps"))?;
                    r.read_ue().map_err(es_err("pps"))?;
                }
            }
            3 | 4 | 5 => {
                r.read_bit().map_err(es_err("pps"))?;
                r.read_ue().map_err(es_err("pps"))?;
            }
            6 => {
                let pic_size = r.read_ue().map_err(es_err("pps"))?;
                let bits = 32 - (num_slice_groups as u32).leading_zeros();
                for _ in 0..=pic_size {
                    r.read_bits(bits).map_err(es_err("pps"))?;
                }
            }
            _ => {}
        }
    }

    r.read_ue().map_err(es_err("pps"))?; // num_ref_idx_l0_active_minus1
    r.read_ue().map_err(es_err("pps"))?; // num_ref_idx_l1_active_minus1
    r.read_bit().map_err(es_err("pps"))?; // weighted_pred_flag
    r.read_bits(2).map_err(es_err("pps"))?; // weighted_bipred_idc
    r.read_se().map_err(es_err("pps"))?; // pic_init_qp_minus26
    r.read_se().map_err(es_err("pps"))?; // pic_init_qs_minus26
    r.read_se().map_err(es_err("pps"))?; // chroma_qp_index_offset
    r.read_bit().map_err(es_err("pps"))?; // deblocking_filter_control_present_flag
    r.read_bit().map_err(es_err("pps"))?; // constrained_intra_pred_flag
    pps.redundant_pic_cnt_present = r.read_bool().map_err(e)?;

    // FRExt extension only when more than trailing bits remain
    let remaining = r.remaining_bits().map_err(Error::from)? as u32;
    if remaining == 0 {
        return Ok(pps);
    }
    if remaining <= 8 {
        let check = r.peek_bits(remaining, 0).map_err(Error::from)?;
        if check == trailing_bits(remaining) {
            return Ok(pps);
        }
    }

    let e = es_err("pps extension");
    let transform_8x8 = r.read_bool().map_err(es_err("pps extension"))?;
    if r.read_bool().map_err(e)? {
        let count = 6 + 2 * transform_8x8 as u32;
        for ix in 0..count {
            if r.read_bool().map_err(es_err("pps extension"))? {
                skip_scaling_list(&mut r, ix)?;
            }
        }
    }

    Ok(pps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isomux_io::BitWriter;

    fn write_ue(w: &mut BitWriter, v: u32) {
        let code = v + 1;
        let bits = 32 - code.leading_zeros();
        w.write_bits(bits - 1, 0);
        w.write_bits(bits, code);
    }

    /// Minimal baseline SPS: 64x64, poc type 0, no VUI.
    fn minimal_sps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_u8(66); // profile_idc baseline
        w.write_u8(0); // constraint flags
        w.write_u8(30); // level_idc 3.0
        write_ue(&mut w, 0); // sps_id
        write_ue(&mut w, 0); // log2_max_frame_num_minus4
        write_ue(&mut w, 0); // pic_order_cnt_type
        write_ue(&mut w, 0); // log2_max_pic_order_cnt_lsb_minus4
        write_ue(&mut w, 1); // max_num_ref_frames
        w.write_bit(0); // gaps_in_frame_num_value_allowed_flag
        write_ue(&mut w, 3); // pic_width_in_mbs_minus1 -> 64
        write_ue(&mut w, 3); // pic_height_in_map_units_minus1 -> 64
        w.write_bit(1); // frame_mbs_only_flag
        w.write_bit(0); // direct_8x8_inference_flag
        w.write_bit(0); // frame_cropping_flag
        w.write_bit(0); // vui_parameters_present_flag
        w.write_bit(1); // rbsp stop bit
        w.into_vec()
    }

    #[test]
    fn parse_minimal_sps() {
        let sps = parse_sps(&minimal_sps_rbsp()).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, 30);
        assert_eq!(sps.pic_width, 64);
        assert_eq!(sps.pic_height, 64);
        assert_eq!(sps.pic_width_out, 64);
        assert_eq!(sps.max_frame_num, 16);
        assert_eq!(sps.max_poc_lsb, 16);
        // default HRD synthesized from profile/level tables
        assert_eq!(sps.bit_rate_first, 1200 * 10_000);
        assert_eq!(sps.cpb_size_first, 1200 * 10_000);
        // no bitstream restriction -> conservative reorder depth
        assert_eq!(sps.num_reorder_frames, 16);
    }

    #[test]
    fn unknown_profile_rejected() {
        let mut rbsp = minimal_sps_rbsp();
        rbsp[0] = 7; // no such profile
        assert!(matches!(parse_sps(&rbsp), Err(Error::Es(_))));
    }

    #[test]
    fn unknown_level_rejected() {
        let mut rbsp = minimal_sps_rbsp();
        rbsp[2] = 14; // no such level
        assert!(matches!(parse_sps(&rbsp), Err(Error::Es(_))));
    }

    fn minimal_pps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        write_ue(&mut w, 0); // pps_id
        write_ue(&mut w, 0); // sps_id
        w.write_bit(0); // entropy_coding_mode_flag
        w.write_bit(0); // bottom_field_pic_order_in_frame_present
        write_ue(&mut w, 0); // num_slice_groups_minus1
        write_ue(&mut w, 0); // num_ref_idx_l0
        write_ue(&mut w, 0); // num_ref_idx_l1
        w.write_bit(0); // weighted_pred_flag
        w.write_bits(2, 0); // weighted_bipred_idc
        w.write_bits(1, 1); // pic_init_qp_minus26 = se(0)
        w.write_bits(1, 1); // pic_init_qs_minus26 = se(0)
        w.write_bits(1, 1); // chroma_qp_index_offset = se(0)
        w.write_bit(0); // deblocking_filter_control_present
        w.write_bit(0); // constrained_intra_pred
        w.write_bit(0); // redundant_pic_cnt_present
        w.write_bit(1); // rbsp stop bit
        w.into_vec()
    }

    #[test]
    fn parse_minimal_pps() {
        let pps = parse_pps(&minimal_pps_rbsp()).unwrap();
        assert!(pps.defined);
        assert_eq!(pps.pps_id, 0);
        assert_eq!(pps.sps_id, 0);
        assert!(!pps.redundant_pic_cnt_present);
    }
}
