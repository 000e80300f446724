//! Shared helpers for the scenario tests: a small box walker to
//! re-parse produced files, and synthetic elementary-stream builders.

#![allow(dead_code)]

/// A parsed box: type plus the byte range of its body.
#[derive(Debug, Clone)]
pub struct BoxRef {
    pub fourcc: [u8; 4],
    pub body: std::ops::Range<usize>,
}

/// Iterate the boxes directly contained in `data[range]`.
pub fn children(data: &[u8], range: std::ops::Range<usize>) -> Vec<BoxRef> {
    let mut out = Vec::new();
    let mut pos = range.start;
    while pos + 8 <= range.end {
        let size32 = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let fourcc = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (size, header) = if size32 == 1 {
            let large = u64::from_be_bytes([
                data[pos + 8],
                data[pos + 9],
                data[pos + 10],
                data[pos + 11],
                data[pos + 12],
                data[pos + 13],
                data[pos + 14],
                data[pos + 15],
            ]);
            (large as usize, 16)
        } else {
            (size32 as usize, 8)
        };
        if size < header || pos + size > range.end {
            break;
        }
        out.push(BoxRef {
            fourcc,
            body: pos + header..pos + size,
        });
        pos += size;
    }
    out
}

/// Top-level boxes of a file.
pub fn top_level(data: &[u8]) -> Vec<BoxRef> {
    children(data, 0..data.len())
}

/// Walk a container path and return the body range of the final box.
/// Only plain containers (no version/flags prefix) appear on paths.
pub fn find_path(data: &[u8], path: &[&[u8; 4]]) -> Option<std::ops::Range<usize>> {
    let mut range = 0..data.len();
    for fourcc in path {
        let next = children(data, range.clone())
            .into_iter()
            .find(|b| &&b.fourcc == fourcc)?;
        range = next.body;
    }
    Some(range)
}

/// All boxes with the given type along a container path prefix.
pub fn find_all(data: &[u8], path: &[&[u8; 4]], fourcc: &[u8; 4]) -> Vec<std::ops::Range<usize>> {
    let range = if path.is_empty() {
        0..data.len()
    } else {
        match find_path(data, path) {
            Some(r) => r,
            None => return Vec::new(),
        }
    };
    children(data, range)
        .into_iter()
        .filter(|b| &b.fourcc == fourcc)
        .map(|b| b.body)
        .collect()
}

pub fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

pub fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub fn be_u64(data: &[u8], at: usize) -> u64 {
    u64::from_be_bytes([
        data[at],
        data[at + 1],
        data[at + 2],
        data[at + 3],
        data[at + 4],
        data[at + 5],
        data[at + 6],
        data[at + 7],
    ])
}

// ---------------------------------------------------------------------------
// Bit-packing helper for the synthetic streams
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Bits {
    buf: Vec<u8>,
    cache: u32,
    n: u32,
}

impl Bits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bits: u32, value: u32) {
        for i in (0..bits).rev() {
            self.cache = (self.cache << 1) | ((value >> i) & 1);
            self.n += 1;
            if self.n == 8 {
                self.buf.push(self.cache as u8);
                self.cache = 0;
                self.n = 0;
            }
        }
    }

    pub fn ue(&mut self, v: u32) {
        let code = v + 1;
        let bits = 32 - code.leading_zeros();
        self.push(bits - 1, 0);
        self.push(bits, code);
    }

    pub fn byte(&mut self, b: u8) {
        assert_eq!(self.n, 0);
        self.buf.push(b);
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.n > 0 {
            self.push(8 - self.n, 0);
        }
        self.buf
    }
}

// ---------------------------------------------------------------------------
// AAC ADTS
// ---------------------------------------------------------------------------

/// One ADTS frame (protection absent, AOT 2) around `payload`.
pub fn adts_frame(sfi: u32, channels: u32, payload: &[u8]) -> Vec<u8> {
    let frame_len = 7 + payload.len() as u32;
    let mut out = Vec::new();
    out.push(0xff);
    out.push(0xf1);
    out.push(((1 << 6) | (sfi << 2) | (channels >> 2)) as u8);
    out.push((((channels & 0x3) << 6) | (frame_len >> 11)) as u8);
    out.push(((frame_len >> 3) & 0xff) as u8);
    out.push((((frame_len & 0x7) << 5) | 0x1f) as u8);
    out.push(0xfc);
    out.extend_from_slice(payload);
    out
}

// ---------------------------------------------------------------------------
// H.264 Annex-B
// ---------------------------------------------------------------------------

/// Baseline SPS, 64x64, poc type 0 (6-bit lsb), VUI timing 25 fps.
pub fn avc_sps_nal() -> Vec<u8> {
    let mut b = Bits::new();
    b.byte(66);
    b.byte(0);
    b.byte(30);
    b.ue(0); // sps_id
    b.ue(0); // log2_max_frame_num_minus4
    b.ue(0); // pic_order_cnt_type
    b.ue(2); // log2_max_pic_order_cnt_lsb_minus4
    b.ue(1); // max_num_ref_frames
    b.push(1, 0); // gaps allowed
    b.ue(3); // width 64
    b.ue(3); // height 64
    b.push(1, 1); // frame_mbs_only
    b.push(1, 0); // direct_8x8
    b.push(1, 0); // cropping
    b.push(1, 1); // vui present
    b.push(1, 0); // aspect ratio
    b.push(1, 0); // overscan
    b.push(1, 0); // video signal
    b.push(1, 0); // chroma loc
    b.push(1, 1); // timing info
    b.push(32, 1); // num_units_in_tick
    b.push(32, 50); // time_scale
    b.push(1, 1); // fixed frame rate
    b.push(1, 0); // nal hrd
    b.push(1, 0); // vcl hrd
    b.push(1, 0); // pic struct
    b.push(1, 0); // bitstream restriction
    b.push(1, 1); // stop
    let mut nal = vec![0, 0, 0, 1, 0x67];
    nal.extend_from_slice(&b.finish());
    nal
}

pub fn avc_pps_nal() -> Vec<u8> {
    let mut b = Bits::new();
    b.ue(0); // pps_id
    b.ue(0); // sps_id
    b.push(1, 0); // entropy mode
    b.push(1, 0); // bottom field poc present
    b.ue(0); // slice groups
    b.ue(0); // ref idx l0
    b.ue(0); // ref idx l1
    b.push(1, 0); // weighted pred
    b.push(2, 0); // weighted bipred
    b.push(1, 1); // pic_init_qp se(0)
    b.push(1, 1); // pic_init_qs se(0)
    b.push(1, 1); // chroma_qp_offset se(0)
    b.push(1, 0); // deblocking control
    b.push(1, 0); // constrained intra
    b.push(1, 0); // redundant pic cnt
    b.push(1, 1); // stop
    let mut nal = vec![0, 0, 0, 1, 0x68];
    nal.extend_from_slice(&b.finish());
    nal
}

/// A VCL slice carrying the header-prefix fields the parser reads.
pub fn avc_slice_nal(
    idr: bool,
    ref_idc: u8,
    slice_type: u32,
    frame_num: u32,
    poc_lsb: u32,
) -> Vec<u8> {
    let mut b = Bits::new();
    b.ue(0); // first_mb_in_slice
    b.ue(slice_type);
    b.ue(0); // pps_id
    b.push(4, frame_num);
    if idr {
        b.ue(0); // idr_pic_id
    }
    b.push(6, poc_lsb);
    b.push(1, 1); // stop
    let mut body = b.finish();
    body.push(0xaa); // payload filler
    let header = if idr { 0x65 } else { ((ref_idc & 3) << 5) | 1 };
    let mut nal = vec![0, 0, 1, header];
    nal.extend_from_slice(&body);
    nal
}

/// Three IPBB GOPs: decode order I P B B, display order I B B P.
pub fn avc_three_gops() -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend_from_slice(&avc_sps_nal());
    stream.extend_from_slice(&avc_pps_nal());
    for _ in 0..3 {
        stream.extend_from_slice(&avc_slice_nal(true, 3, 7, 0, 0));
        stream.extend_from_slice(&avc_slice_nal(false, 2, 0, 1, 6));
        stream.extend_from_slice(&avc_slice_nal(false, 0, 1, 2, 2));
        stream.extend_from_slice(&avc_slice_nal(false, 0, 1, 2, 4));
    }
    stream
}

// ---------------------------------------------------------------------------
// AC-3 / E-AC-3
// ---------------------------------------------------------------------------

/// An E-AC-3 syncframe header; `size` bytes total, 48 kHz, 3/2+LFE,
/// bsid 16, 6 blocks.
pub fn ec3_frame(strmtyp: u8, substreamid: u8, size: usize, chanmap_lrs: bool) -> Vec<u8> {
    let mut b = Bits::new();
    b.byte(0x0b);
    b.byte(0x77);
    b.push(2, strmtyp as u32);
    b.push(3, substreamid as u32);
    b.push(11, (size as u32 / 2) - 1);
    b.push(2, 0); // fscod
    b.push(2, 3); // numblkscod -> 6 blocks
    b.push(3, 7); // acmod
    b.push(1, 1); // lfeon
    b.push(5, 16); // bsid
    b.push(5, 0); // dialnorm
    b.push(1, 0); // compre
    if strmtyp == 1 {
        b.push(1, 1); // chanmape
        for i in 0..16 {
            b.push(1, if chanmap_lrs && i == 6 { 1 } else { 0 });
        }
    }
    b.push(1, 0); // mixmdate
    b.push(1, 0); // infomdate
    b.push(1, 0); // addbsie
    let mut v = b.finish();
    v.resize(size, 0);
    v
}
