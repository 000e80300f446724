//! AVC slice-header prefix parsing and access-unit boundary detection.

use isomux_common::{Error, Result};
use isomux_io::BitReader;

use super::sps::{Pps, Sps};
use crate::es_err;

pub const NAL_TYPE_NON_IDR_SLICE: u8 = 1;
pub const NAL_TYPE_PARTITION_A: u8 = 2;
pub const NAL_TYPE_IDR_SLICE: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SEQ_PARAM: u8 = 7;
pub const NAL_TYPE_PIC_PARAM: u8 = 8;
pub const NAL_TYPE_ACCESS_UNIT: u8 = 9;
pub const NAL_TYPE_END_OF_SEQ: u8 = 10;
pub const NAL_TYPE_END_OF_STREAM: u8 = 11;
pub const NAL_TYPE_FILLER_DATA: u8 = 12;
pub const NAL_TYPE_SEQ_PARAM_EXT: u8 = 13;
pub const NAL_TYPE_PREFIX_NAL: u8 = 14;
pub const NAL_TYPE_SUBSET_SEQ_PARAM: u8 = 15;
pub const NAL_TYPE_SLICE_EXT: u8 = 20;
pub const NAL_TYPE_VDRD: u8 = 24;
pub const NAL_TYPE_DOLBY_3D: u8 = 25;

/// Slice types after modulo 5.
pub const SLICE_TYPE_P: u32 = 0;
pub const SLICE_TYPE_B: u32 = 1;
pub const SLICE_TYPE_I: u32 = 2;

/// The slice-header prefix fields needed for AU delimiting and POC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceHeader {
    pub nal_unit_type: u8,
    pub nal_ref_idc: u8,
    pub first_slice: bool,

    pub slice_type: u32,
    pub pps_id: u8,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
}

/// Parse the slice-header prefix from a VCL RBSP into `slice`.
///
/// References to an undefined PPS fall back to id 0 with a diagnostic;
/// when id 0 is undefined too this is a `NoConfig` error.
pub fn parse_slice(
    rbsp: &[u8],
    nal_unit_type: u8,
    nal_ref_idc: u8,
    sps_tbl: &[Option<Sps>],
    pps_tbl: &[Option<Pps>],
    slice: &mut SliceHeader,
) -> Result<()> {
    let mut r = BitReader::from_slice(rbsp);
    let e = es_err("slice header");

    slice.nal_unit_type = nal_unit_type;
    slice.nal_ref_idc = nal_ref_idc;

    r.read_ue().map_err(es_err("slice header"))?; // first_mb_in_slice
    slice.slice_type = r.read_ue().map_err(es_err("slice header"))?;
    let mut pps_id = r.read_ue().map_err(es_err("slice header"))? as usize;

    let pps = match pps_tbl.get(pps_id).and_then(|p| p.as_ref()) {
        Some(p) => p,
        None => {
            tracing::warn!(pps_id, "slice references undefined pps, assuming id 0");
            pps_id = 0;
            pps_tbl[0]
                .as_ref()
                .ok_or_else(|| Error::NoConfig("pps 0 undefined".into()))?
        }
    };
    slice.pps_id = pps_id as u8;

    let sps = sps_tbl[pps.sps_id as usize]
        .as_ref()
        .ok_or_else(|| Error::NoConfig(format!("sps {} undefined", pps.sps_id)))?;

    slice.frame_num = r
        .read_bits(sps.log2_max_frame_num_minus4 + 4)
        .map_err(es_err("slice header"))?;

    slice.field_pic_flag = false;
    slice.bottom_field_flag = false;
    if !sps.frame_mbs_only_flag {
        slice.field_pic_flag = r.read_bool().map_err(es_err("slice header"))?;
        if slice.field_pic_flag {
            slice.bottom_field_flag = r.read_bool().map_err(es_err("slice header"))?;
        }
    }

    if nal_unit_type == NAL_TYPE_IDR_SLICE {
        slice.idr_pic_id = r.read_ue().map_err(es_err("slice header"))?;
    }

    match sps.pic_order_cnt_type {
        0 => {
            slice.delta_pic_order_cnt_bottom = 0;
            slice.pic_order_cnt_lsb = r
                .read_bits(sps.log2_max_pic_order_cnt_lsb_minus4 + 4)
                .map_err(es_err("slice header"))?;
            if pps.bottom_field_pic_order_in_frame_present && !slice.field_pic_flag {
                slice.delta_pic_order_cnt_bottom = r.read_se().map_err(es_err("slice header"))?;
            }
        }
        1 => {
            slice.delta_pic_order_cnt = [0, 0];
            if !sps.delta_pic_order_always_zero_flag {
                slice.delta_pic_order_cnt[0] = r.read_se().map_err(es_err("slice header"))?;
            }
            if pps.bottom_field_pic_order_in_frame_present && !slice.field_pic_flag {
                slice.delta_pic_order_cnt[1] = r.read_se().map_err(es_err("slice header"))?;
            }
        }
        _ => {}
    }

    slice.redundant_pic_cnt = 0;
    if pps.redundant_pic_cnt_present {
        slice.redundant_pic_cnt = r.read_ue().map_err(e)?;
    }

    Ok(())
}

/// Does `next` begin a new coded picture relative to `prev`?
/// ITU-T H.264 section 7.4.1.2.4, assuming no auxiliary pictures.
pub fn is_first_slice(prev: &SliceHeader, next: &SliceHeader, sps: &Sps) -> bool {
    if next.redundant_pic_cnt != 0 {
        return false; // redundant slices never open a picture
    }

    if next.frame_num != prev.frame_num {
        return true;
    }
    if next.pps_id != prev.pps_id {
        return true;
    }
    if next.field_pic_flag != prev.field_pic_flag {
        return true;
    }
    if next.field_pic_flag && next.bottom_field_flag != prev.bottom_field_flag {
        return true;
    }
    if next.nal_ref_idc != prev.nal_ref_idc && (next.nal_ref_idc == 0 || prev.nal_ref_idc == 0) {
        return true;
    }

    match sps.pic_order_cnt_type {
        0 => {
            if next.pic_order_cnt_lsb != prev.pic_order_cnt_lsb
                || next.delta_pic_order_cnt_bottom != prev.delta_pic_order_cnt_bottom
            {
                return true;
            }
        }
        1 => {
            if next.delta_pic_order_cnt != prev.delta_pic_order_cnt {
                return true;
            }
        }
        _ => {}
    }

    if next.nal_unit_type != prev.nal_unit_type {
        if next.nal_unit_type == NAL_TYPE_IDR_SLICE || prev.nal_unit_type == NAL_TYPE_IDR_SLICE {
            return true;
        }
    } else if next.nal_unit_type == NAL_TYPE_IDR_SLICE && next.idr_pic_id != prev.idr_pic_id {
        return true;
    }

    false
}
