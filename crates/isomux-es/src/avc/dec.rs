//! AVC decoder state: parameter-set slots, slice ping-pong, access-unit
//! delimiting, and picture-order-count derivation.

use isomux_common::{Error, Result};

use super::slice::{self, parse_slice, SliceHeader};
use super::sps::{parse_pps, parse_sps, Pps, Sps, MAX_PPS, MAX_SPS};

/// NAL classes for access-unit delimiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    /// Cannot influence AU boundaries.
    No,
    Vcl,
    NotVcl,
    /// MVC slice extension (type 20).
    SliceExt,
    /// MVC side data: VDRD, subset SPS, Dolby 3D.
    NotSliceExt,
}

fn nal_class(unit_type: u8) -> NalClass {
    match unit_type {
        1 | 2 | 5 => NalClass::Vcl,
        6 | 7 | 8 | 9 | 16..=18 => NalClass::NotVcl,
        15 | 24 | 25 => NalClass::NotSliceExt,
        20 => NalClass::SliceExt,
        _ => NalClass::No,
    }
}

/// Picture type of the current access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PicType {
    #[default]
    Frame,
    FieldTop,
    FieldBottom,
}

/// Remove emulation-prevention bytes: `00 00 03` becomes `00 00`.
/// At most `max_out` output bytes are produced.
pub fn unescape_rbsp(nal_body: &[u8], max_out: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal_body.len().min(max_out));
    let mut zeros = 0u32;
    for &b in nal_body {
        if out.len() >= max_out {
            break;
        }
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// Enough RBSP for every header of interest: worst-case SPS is 13 bytes
/// plus 496 exp-Golomb codes in FRExt.
const RBSP_BYTE_NUM_MAX: usize = 512;

/// Decoder-side state of the AVC elementary-stream parser.
///
/// NAL units are handled in two passes: [`parse_nal_first`] answers
/// "does this NAL start a new access unit?" without advancing AU
/// assembly, and [`parse_nal_commit`] applies the side effects
/// (parameter-set activation, slice ping-pong swap, POC).
pub struct AvcDecoder {
    pub sps: Vec<Option<Sps>>,
    pub pps: Vec<Option<Pps>>,

    slices: [SliceHeader; 2],
    /// Index of the committed slice; `1 - current` is the candidate.
    current: usize,

    pub nal_unit_type: u8,
    pub nal_ref_idc: u8,

    active_sps_id: usize,
    active_pps_id: usize,

    pd_nal_type: NalClass,
    md_nal_type: NalClass,
    layer_idx: u8,
    first_vcl_cnt: u32,

    // POC state
    pic_order_cnt_lsb_prev: u32,
    pic_order_cnt_msb_prev: i32,
    pic_order_cnt_msb: i32,
    frame_num_prev: u32,
    frame_num_offset: u32,
    frame_num_offset_prev: u32,

    pub pic_order_cnt: i32,
    pub pic_type: PicType,
    pub idr_pic: bool,
    pub sample_has_redundancy: bool,
}

impl Default for AvcDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AvcDecoder {
    pub fn new() -> Self {
        Self {
            sps: vec![None; MAX_SPS],
            pps: vec![None; MAX_PPS],
            slices: [SliceHeader::default(); 2],
            current: 0,
            nal_unit_type: 0,
            nal_ref_idc: 0,
            active_sps_id: 0,
            active_pps_id: 0,
            pd_nal_type: NalClass::No,
            md_nal_type: NalClass::No,
            layer_idx: 0,
            first_vcl_cnt: 0,
            pic_order_cnt_lsb_prev: 0,
            pic_order_cnt_msb_prev: 0,
            pic_order_cnt_msb: 0,
            frame_num_prev: 0,
            frame_num_offset: 0,
            frame_num_offset_prev: 0,
            pic_order_cnt: 0,
            pic_type: PicType::Frame,
            idr_pic: false,
            sample_has_redundancy: false,
        }
    }

    pub fn slice(&self) -> &SliceHeader {
        &self.slices[self.current]
    }

    fn slice_next(&self) -> &SliceHeader {
        &self.slices[1 - self.current]
    }

    pub fn active_sps(&self) -> Option<&Sps> {
        self.sps[self.active_sps_id].as_ref()
    }

    pub fn active_sps_id(&self) -> usize {
        self.active_sps_id
    }

    pub fn active_pps_id(&self) -> usize {
        self.active_pps_id
    }

    /// Header size of a NAL with start code: 3- or 4-byte start code.
    fn start_code_len(nal: &[u8]) -> usize {
        if nal.len() > 2 && nal[2] == 1 {
            3
        } else {
            4
        }
    }

    /// Pass 1: inspect `nal` (including its start code) and answer
    /// whether it begins a new access unit. For VCL NALs the slice
    /// header is parsed into the candidate slot; nothing else changes.
    pub fn parse_nal_first(&mut self, nal: &[u8]) -> Result<bool> {
        let hdr = Self::start_code_len(nal);
        if nal.len() <= hdr {
            return Err(Error::es("empty nal unit"));
        }
        self.nal_unit_type = nal[hdr] & 0x1f;
        self.nal_ref_idc = (nal[hdr] >> 5) & 0x3;

        // end of sequence closes the current sample's NAL set
        if self.nal_unit_type == slice::NAL_TYPE_END_OF_SEQ {
            return Ok(true);
        }

        // AUD must start an AU, unless something non-VCL already did
        if self.nal_unit_type == slice::NAL_TYPE_ACCESS_UNIT {
            if self.pd_nal_type != NalClass::NotVcl {
                return Ok(true);
            }
            tracing::warn!("access unit delimiter is not the first NAL in the AU");
            return Ok(false);
        }

        // inside an MVC dependency: PPS and SEI do not split
        if self.md_nal_type == NalClass::NotSliceExt
            && (self.nal_unit_type == slice::NAL_TYPE_PIC_PARAM
                || self.nal_unit_type == slice::NAL_TYPE_SEI)
        {
            return Ok(false);
        }

        if self.nal_unit_type == slice::NAL_TYPE_PREFIX_NAL {
            return Ok(false); // fine as long as the suffix NAL does not start an AU
        }

        match nal_class(self.nal_unit_type) {
            NalClass::Vcl => {
                let rbsp = unescape_rbsp(&nal[hdr + 1..], RBSP_BYTE_NUM_MAX);
                let candidate = 1 - self.current;
                let (unit_type, ref_idc) = (self.nal_unit_type, self.nal_ref_idc);
                parse_slice(
                    &rbsp,
                    unit_type,
                    ref_idc,
                    &self.sps,
                    &self.pps,
                    &mut self.slices[candidate],
                )?;

                // first VCL of an AU that non-VCL NALs already opened
                if self.pd_nal_type == NalClass::NotVcl {
                    self.slices[candidate].first_slice = true;
                    self.first_vcl_cnt += 1;
                    return Ok(false);
                }

                let first = {
                    let pps_id = self.slices[candidate].pps_id as usize;
                    let sps_id = self.pps[pps_id]
                        .as_ref()
                        .map(|p| p.sps_id as usize)
                        .unwrap_or(0);
                    let sps = self.sps[sps_id]
                        .as_ref()
                        .ok_or_else(|| Error::NoConfig(format!("sps {sps_id} undefined")))?;
                    slice::is_first_slice(&self.slices[self.current], &self.slices[candidate], sps)
                };
                self.slices[candidate].first_slice = first;
                if first {
                    self.first_vcl_cnt += 1;
                }
                Ok(first)
            }
            NalClass::NotVcl => Ok(self.pd_nal_type == NalClass::Vcl),
            // MVC side NALs never split an AU on their own
            NalClass::SliceExt | NalClass::NotSliceExt | NalClass::No => Ok(false),
        }
    }

    /// Pass 2: commit the NAL's side effects.
    pub fn parse_nal_commit(&mut self, nal: &[u8]) -> Result<()> {
        let hdr = Self::start_code_len(nal) + 1;

        match nal_class(self.nal_unit_type) {
            NalClass::Vcl => {
                if self.slice_next().first_slice {
                    self.current = 1 - self.current;
                    self.idr_pic = self.nal_unit_type == slice::NAL_TYPE_IDR_SLICE;

                    self.active_pps_id = self.slice().pps_id as usize;
                    self.active_sps_id = self.pps[self.active_pps_id]
                        .as_ref()
                        .map(|p| p.sps_id as usize)
                        .unwrap_or(0);
                    let sps = self.sps[self.active_sps_id]
                        .as_ref()
                        .ok_or_else(|| Error::NoConfig("active sps undefined".into()))?;
                    if !sps.cpb_dpb_delays_present
                        && self.first_vcl_cnt > 1
                        && self.slice().field_pic_flag != self.slice_next().field_pic_flag
                    {
                        tracing::warn!("timing info for PAFF is not fully supported");
                    }
                    self.compute_poc();
                } else {
                    self.slices[self.current].first_slice = false;
                }
                if self.slice_next().redundant_pic_cnt > 0 || self.slice().redundant_pic_cnt > 0 {
                    self.sample_has_redundancy = true;
                }
            }
            _ => {
                let is_pps = self.nal_unit_type == slice::NAL_TYPE_PIC_PARAM
                    && self.md_nal_type != NalClass::NotSliceExt;
                if is_pps
                    || self.nal_unit_type == slice::NAL_TYPE_SEQ_PARAM
                    || self.nal_unit_type == slice::NAL_TYPE_SUBSET_SEQ_PARAM
                {
                    let rbsp = unescape_rbsp(&nal[hdr..], RBSP_BYTE_NUM_MAX);
                    if is_pps {
                        let pps = parse_pps(&rbsp)?;
                        self.active_pps_id = pps.pps_id as usize;
                        self.pps[pps.pps_id as usize] = Some(pps);
                    } else {
                        let sps = parse_sps(&rbsp)?;
                        let sps_id = sps.sps_id as usize;
                        self.active_sps_id = sps_id;
                        self.sps[sps_id] = Some(sps);
                    }
                }
            }
        }

        self.update_mvc_state()
    }

    /// Secondary state machine keeping MVC dependency representations
    /// from splitting the base-view AU.
    fn update_mvc_state(&mut self) -> Result<()> {
        match self.md_nal_type {
            NalClass::NotSliceExt => {
                if self.layer_idx != 1 {
                    return Err(Error::es("mvc state without dependency layer"));
                }
                if self.nal_unit_type == slice::NAL_TYPE_SLICE_EXT {
                    self.md_nal_type = NalClass::SliceExt;
                } else if !(self.nal_unit_type == slice::NAL_TYPE_PIC_PARAM
                    || self.nal_unit_type == slice::NAL_TYPE_SEI
                    || self.nal_unit_type == slice::NAL_TYPE_SUBSET_SEQ_PARAM
                    || self.nal_unit_type == slice::NAL_TYPE_DOLBY_3D)
                {
                    return Err(Error::es("unexpected nal inside mvc dependency"));
                }
            }
            NalClass::SliceExt => {
                if self.layer_idx != 1 {
                    return Err(Error::es("mvc state without dependency layer"));
                }
                match self.nal_unit_type {
                    slice::NAL_TYPE_SLICE_EXT
                    | slice::NAL_TYPE_FILLER_DATA
                    | slice::NAL_TYPE_END_OF_SEQ
                    | slice::NAL_TYPE_END_OF_STREAM => {
                        // still in the dependency representation
                    }
                    _ => {
                        self.md_nal_type = nal_class(self.nal_unit_type);
                        if matches!(
                            self.md_nal_type,
                            NalClass::NotSliceExt | NalClass::SliceExt
                        ) {
                            return Err(Error::es("mvc dependency not closed"));
                        }
                        self.pd_nal_type = self.md_nal_type;
                        self.layer_idx = 0;
                    }
                }
            }
            _ => {
                self.md_nal_type = nal_class(self.nal_unit_type);
                if !matches!(self.md_nal_type, NalClass::NotSliceExt | NalClass::SliceExt) {
                    if self.layer_idx != 0 {
                        return Err(Error::es("mvc dependency layer leaked"));
                    }
                    self.pd_nal_type = self.md_nal_type;
                } else {
                    // only a VDRD opens an MVC dependency
                    if self.nal_unit_type != slice::NAL_TYPE_VDRD || self.layer_idx != 0 {
                        return Err(Error::es("unexpected mvc nal"));
                    }
                    self.pd_nal_type = NalClass::No;
                    self.layer_idx = 1;
                }
            }
        }
        Ok(())
    }

    /// Reset per-sample accumulation state at an AU boundary.
    pub fn start_new_sample(&mut self) {
        self.sample_has_redundancy = false;
    }

    /// Picture order count per ITU-T H.264 section 8.2.1, all three modes.
    /// Called right after the first VCL slice of an AU is committed.
    fn compute_poc(&mut self) {
        let sps = match self.sps[self.active_sps_id].as_ref() {
            Some(s) => s,
            None => return,
        };
        let s = self.slices[self.current];

        let pic_type = if sps.frame_mbs_only_flag || !s.field_pic_flag {
            PicType::Frame
        } else if s.bottom_field_flag {
            PicType::FieldBottom
        } else {
            PicType::FieldTop
        };
        self.pic_type = pic_type;

        let idr = self.nal_unit_type == slice::NAL_TYPE_IDR_SLICE;
        let mut field_poc = [0i32; 2];

        if sps.pic_order_cnt_type == 0 {
            if idr {
                self.pic_order_cnt_lsb_prev = 0;
                self.pic_order_cnt_msb_prev = 0;
            }

            let max_poc_lsb = sps.max_poc_lsb as i32;
            let lsb = s.pic_order_cnt_lsb as i32;
            let lsb_prev = self.pic_order_cnt_lsb_prev as i32;
            if lsb < lsb_prev && lsb_prev - lsb >= max_poc_lsb / 2 {
                self.pic_order_cnt_msb = self.pic_order_cnt_msb_prev + max_poc_lsb;
            } else if lsb > lsb_prev && lsb - lsb_prev > max_poc_lsb / 2 {
                self.pic_order_cnt_msb = self.pic_order_cnt_msb_prev - max_poc_lsb;
            } else {
                self.pic_order_cnt_msb = self.pic_order_cnt_msb_prev;
            }

            field_poc[0] = self.pic_order_cnt_msb + lsb;
            field_poc[1] = field_poc[0];
            if pic_type == PicType::Frame {
                field_poc[1] += s.delta_pic_order_cnt_bottom;
            }

            if self.nal_ref_idc != 0 {
                self.pic_order_cnt_lsb_prev = s.pic_order_cnt_lsb;
                self.pic_order_cnt_msb_prev = self.pic_order_cnt_msb;
            }
        } else {
            if idr {
                self.frame_num_offset = 0;
            } else if s.frame_num < self.frame_num_prev {
                self.frame_num_offset = self.frame_num_offset_prev + sps.max_frame_num;
            } else {
                self.frame_num_offset = self.frame_num_offset_prev;
            }

            if sps.pic_order_cnt_type == 1 {
                let cycle_len = sps.num_ref_frames_in_pic_order_cnt_cycle() as i32;
                let mut abs_frame_num = if cycle_len != 0 {
                    (self.frame_num_offset + s.frame_num) as i32
                } else {
                    0
                };
                if self.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected_poc = 0i32;
                if abs_frame_num > 0 {
                    let poc_cycle_cnt = (abs_frame_num - 1) / cycle_len;
                    let frame_num_in_cycle = (abs_frame_num - 1) % cycle_len;
                    expected_poc = poc_cycle_cnt * sps.expected_delta_per_poc_cycle;
                    for i in 0..=frame_num_in_cycle {
                        expected_poc += sps.offset_for_ref_frame[i as usize];
                    }
                }
                if self.nal_ref_idc == 0 {
                    expected_poc += sps.offset_for_non_ref_pic;
                }

                field_poc[0] = expected_poc + s.delta_pic_order_cnt[0];
                field_poc[1] = field_poc[0] + sps.offset_for_top_to_bottom_field;
                if pic_type == PicType::Frame {
                    field_poc[1] += s.delta_pic_order_cnt[1];
                }
            } else {
                // pic_order_cnt_type == 2
                let tmp_poc = if idr {
                    0
                } else {
                    let mut v = ((self.frame_num_offset + s.frame_num) << 1) as i32;
                    if self.nal_ref_idc == 0 {
                        v -= 1;
                    }
                    v
                };
                field_poc[0] = tmp_poc;
                field_poc[1] = tmp_poc;
            }

            self.frame_num_prev = s.frame_num;
            self.frame_num_offset_prev = self.frame_num_offset;
        }

        self.pic_order_cnt = match pic_type {
            PicType::Frame => field_poc[0].min(field_poc[1]),
            PicType::FieldTop => field_poc[0],
            PicType::FieldBottom => field_poc[1],
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder_with_poc0(max_poc_lsb: u32) -> AvcDecoder {
        let mut dec = AvcDecoder::new();
        dec.sps[0] = Some(Sps {
            defined: true,
            pic_order_cnt_type: 0,
            max_poc_lsb,
            max_frame_num: 16,
            frame_mbs_only_flag: true,
            ..Sps::default()
        });
        dec.pps[0] = Some(Pps {
            defined: true,
            ..Pps::default()
        });
        dec
    }

    fn commit_vcl(dec: &mut AvcDecoder, unit_type: u8, ref_idc: u8, frame_num: u32, lsb: u32) {
        let candidate = 1 - dec.current;
        dec.slices[candidate] = SliceHeader {
            nal_unit_type: unit_type,
            nal_ref_idc: ref_idc,
            first_slice: true,
            frame_num,
            pic_order_cnt_lsb: lsb,
            ..SliceHeader::default()
        };
        dec.nal_unit_type = unit_type;
        dec.nal_ref_idc = ref_idc;
        dec.current = candidate;
        dec.compute_poc();
    }

    #[test]
    fn poc_mode0_idr_reset_and_order() {
        let mut dec = decoder_with_poc0(16);
        commit_vcl(&mut dec, 5, 3, 0, 0); // IDR
        assert_eq!(dec.pic_order_cnt, 0);
        commit_vcl(&mut dec, 1, 2, 1, 6); // P, display later
        assert_eq!(dec.pic_order_cnt, 6);
        commit_vcl(&mut dec, 1, 0, 2, 2); // B
        assert_eq!(dec.pic_order_cnt, 2);
        commit_vcl(&mut dec, 1, 0, 2, 4); // B
        assert_eq!(dec.pic_order_cnt, 4);
        // next IDR resets
        commit_vcl(&mut dec, 5, 3, 0, 0);
        assert_eq!(dec.pic_order_cnt, 0);
    }

    #[test]
    fn poc_mode0_lsb_wraparound() {
        let mut dec = decoder_with_poc0(16);
        commit_vcl(&mut dec, 5, 3, 0, 0);
        commit_vcl(&mut dec, 1, 2, 1, 6);
        commit_vcl(&mut dec, 1, 2, 2, 12);
        assert_eq!(dec.pic_order_cnt, 12);
        // lsb wraps from 12 to 2: msb advances by max_poc_lsb
        commit_vcl(&mut dec, 1, 2, 3, 2);
        assert_eq!(dec.pic_order_cnt, 18);
    }

    #[test]
    fn poc_mode2_decode_order() {
        let mut dec = AvcDecoder::new();
        dec.sps[0] = Some(Sps {
            defined: true,
            pic_order_cnt_type: 2,
            max_frame_num: 16,
            frame_mbs_only_flag: true,
            ..Sps::default()
        });
        dec.pps[0] = Some(Pps {
            defined: true,
            ..Pps::default()
        });
        commit_vcl(&mut dec, 5, 3, 0, 0);
        assert_eq!(dec.pic_order_cnt, 0);
        commit_vcl(&mut dec, 1, 2, 1, 0);
        assert_eq!(dec.pic_order_cnt, 2);
        commit_vcl(&mut dec, 1, 2, 2, 0);
        assert_eq!(dec.pic_order_cnt, 4);
        // non-reference picture sits one below
        commit_vcl(&mut dec, 1, 0, 3, 0);
        assert_eq!(dec.pic_order_cnt, 5);
    }

    #[test]
    fn rbsp_unescape() {
        let data = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0xab];
        assert_eq!(
            unescape_rbsp(&data, 512),
            vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xab]
        );
    }
}
