//! H.264/AVC Annex-B elementary-stream parser.
//!
//! NAL units are delimited by start-code scanning, inspected in two
//! passes ([`dec::AvcDecoder`]) to find access-unit boundaries, and
//! assembled into length-prefixed samples. Composition times derive
//! from picture order counts: access units buffer per POC-reset period
//! and CTS is assigned by POC rank when the period flushes.

pub mod dec;
pub mod slice;
pub mod sps;

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Seek};

use isomux_common::{
    Dependency, DsiEntry, Error, FourCc, Result, Sample, SampleFlags, StreamInfo,
};

use dec::{AvcDecoder, PicType};
use slice::{
    NAL_TYPE_ACCESS_UNIT, NAL_TYPE_PIC_PARAM, NAL_TYPE_SEQ_PARAM, NAL_TYPE_SUBSET_SEQ_PARAM,
    SLICE_TYPE_B, SLICE_TYPE_I,
};

/// Default timing for streams without VUI timing info: 25 fps.
const DEFAULT_TIMESCALE: u32 = 90_000;
const DEFAULT_FRAME_DUR: u32 = 3_600;

const REFILL_CHUNK: usize = 64 * 1024;

/// One NAL unit, including its 3- or 4-byte start code.
struct Nal {
    data: Vec<u8>,
    pos: u64,
}

impl Nal {
    fn header_offset(&self) -> usize {
        if self.data[2] == 1 {
            3
        } else {
            4
        }
    }

    fn unit_type(&self) -> u8 {
        self.data[self.header_offset()] & 0x1f
    }

    fn body(&self) -> &[u8] {
        &self.data[self.header_offset()..]
    }
}

/// Start-code scanner over a byte source, yielding whole NAL units.
struct NalScanner<R> {
    src: R,
    buf: Vec<u8>,
    base: u64,
    eof: bool,
    synced: bool,
}

impl<R: Read + Seek> NalScanner<R> {
    fn new(src: R) -> Self {
        Self {
            src,
            buf: Vec::new(),
            base: 0,
            eof: false,
            synced: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + REFILL_CHUNK, 0);
        let n = self.src.read(&mut self.buf[old_len..])?;
        self.buf.truncate(old_len + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }

    /// Index of the next `00 00 01` at or after `from`, or None.
    fn find_start_code(&self, from: usize) -> Option<usize> {
        let buf = &self.buf;
        if buf.len() < 3 {
            return None;
        }
        let mut i = from;
        while i + 2 < buf.len() {
            if buf[i] == 0 && buf[i + 1] == 0 {
                if buf[i + 2] == 1 {
                    return Some(i);
                }
                if buf[i + 2] == 0 {
                    i += 1;
                    continue;
                }
                i += 3;
            } else if buf[i + 2] != 0 {
                i += 3;
            } else {
                i += 1;
            }
        }
        None
    }

    /// Next NAL unit, or None at end of stream.
    fn next_nal(&mut self) -> Result<Option<Nal>> {
        // align the buffer on the first start code once
        if !self.synced {
            loop {
                if let Some(s) = self.find_start_code(0) {
                    // honor a 4-byte start code
                    let s = if s > 0 && self.buf[s - 1] == 0 { s - 1 } else { s };
                    self.base += s as u64;
                    self.buf.drain(..s);
                    self.synced = true;
                    break;
                }
                if self.eof {
                    return Ok(None);
                }
                // keep a potential partial start code across refills
                let keep = self.buf.len().min(3);
                let drop = self.buf.len() - keep;
                self.base += drop as u64;
                self.buf.drain(..drop);
                self.refill()?;
            }
        }

        if self.buf.len() < 4 {
            self.refill()?;
            if self.buf.len() < 4 {
                return Ok(None);
            }
        }

        // find the start of the following NAL
        let mut from = 3;
        loop {
            if let Some(next) = self.find_start_code(from) {
                let mut end = next;
                if end > 0 && self.buf[end - 1] == 0 {
                    end -= 1; // 4-byte start code of the next NAL
                }
                if end < 4 {
                    // degenerate: empty NAL between start codes, skip it
                    self.base += next as u64;
                    self.buf.drain(..next);
                    from = 3;
                    continue;
                }
                let data: Vec<u8> = self.buf[..end].to_vec();
                let pos = self.base;
                self.base += end as u64;
                self.buf.drain(..end);
                return Ok(Some(Nal { data, pos }));
            }
            if self.eof {
                // final NAL runs to end of stream
                if self.buf.len() <= 4 {
                    return Ok(None);
                }
                let data = std::mem::take(&mut self.buf);
                let pos = self.base;
                self.base += data.len() as u64;
                return Ok(Some(Nal { data, pos }));
            }
            from = self.buf.len().saturating_sub(3).max(3);
            self.refill()?;
        }
    }
}

/// An assembled access unit waiting for its POC-reset period to flush.
struct PendingAu {
    payload: Vec<u8>,
    subsamples: Vec<u32>,
    pos: u64,
    dts: u64,
    duration: u32,
    poc: i32,
    idr: bool,
    ref_idc: u8,
    slice_type: u32,
    redundancy: bool,
    new_sd: bool,
}

/// H.264/AVC elementary-stream parser.
pub struct AvcParser<R> {
    scanner: NalScanner<R>,
    dec: AvcDecoder,
    pending_nal: Option<Nal>,
    done: bool,

    sps_nals: BTreeMap<u8, Vec<u8>>,
    pps_nals: BTreeMap<u8, Vec<u8>>,
    config_changed: bool,
    dsi_entries: Vec<DsiEntry>,

    gop: Vec<PendingAu>,
    out: VecDeque<Sample>,

    time_scale: u32,
    frame_dur: u32,
    timing_from_vui: bool,
    next_dts: u64,
    sample_count: u64,

    info: StreamInfo,
    info_set: bool,
}

impl<R: Read + Seek> AvcParser<R> {
    pub fn new(src: R) -> Self {
        Self {
            scanner: NalScanner::new(src),
            dec: AvcDecoder::new(),
            pending_nal: None,
            done: false,
            sps_nals: BTreeMap::new(),
            pps_nals: BTreeMap::new(),
            config_changed: false,
            dsi_entries: Vec::new(),
            gop: Vec::new(),
            out: VecDeque::new(),
            time_scale: DEFAULT_TIMESCALE,
            frame_dur: DEFAULT_FRAME_DUR,
            timing_from_vui: false,
            next_dts: 0,
            sample_count: 0,
            info: StreamInfo::video(FourCc::new(b"avc1")),
            info_set: false,
        }
    }

    /// Override the frame timing used when the stream carries no VUI
    /// timing info: `time_scale` units per second, `frame_dur` units
    /// per frame.
    pub fn with_frame_timing(mut self, time_scale: u32, frame_dur: u32) -> Self {
        self.time_scale = time_scale;
        self.frame_dur = frame_dur;
        self
    }

    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        loop {
            if let Some(s) = self.out.pop_front() {
                return Ok(Some(s));
            }
            if self.done {
                return Ok(None);
            }
            self.assemble_au()?;
        }
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.info.clone()
    }

    pub fn dsi_entries(&self) -> Vec<DsiEntry> {
        self.dsi_entries.clone()
    }

    /// Pull NALs until one access unit is complete, then queue it.
    fn assemble_au(&mut self) -> Result<()> {
        let mut au: Vec<Nal> = Vec::new();

        loop {
            let nal = match self.pending_nal.take() {
                Some(n) => n,
                None => match self.scanner.next_nal()? {
                    Some(n) => {
                        let starts = self.dec.parse_nal_first(&n.data)?;
                        if starts && !au.is_empty() {
                            self.pending_nal = Some(n);
                            break;
                        }
                        n
                    }
                    None => {
                        if au.is_empty() {
                            self.flush_gop();
                            self.done = true;
                            return Ok(());
                        }
                        break;
                    }
                },
            };

            let unit_type = nal.unit_type();
            self.dec.parse_nal_commit(&nal.data)?;

            match unit_type {
                NAL_TYPE_SEQ_PARAM | NAL_TYPE_SUBSET_SEQ_PARAM => {
                    self.record_parameter_set(true, &nal);
                }
                NAL_TYPE_PIC_PARAM => {
                    self.record_parameter_set(false, &nal);
                }
                _ => {}
            }
            au.push(nal);
        }

        self.finalize_au(au)
    }

    fn record_parameter_set(&mut self, is_sps: bool, nal: &Nal) {
        let body = nal.body().to_vec();
        // the decoder just activated the parsed set, so its id is current
        let id = if is_sps {
            self.dec.active_sps_id() as u8
        } else {
            self.dec.active_pps_id() as u8
        };
        let map = if is_sps {
            &mut self.sps_nals
        } else {
            &mut self.pps_nals
        };
        match map.get(&id) {
            Some(existing) if *existing == body => {}
            Some(_) => {
                self.config_changed = true;
                map.insert(id, body);
            }
            None => {
                if !map.is_empty() {
                    self.config_changed = true;
                }
                map.insert(id, body);
            }
        }
    }

    /// Convert one finished AU into a pending sample; flush the POC
    /// period first when the AU resets POC.
    fn finalize_au(&mut self, au: Vec<Nal>) -> Result<()> {
        let has_vcl = au.iter().any(|n| matches!(n.unit_type(), 1 | 2 | 5));
        if !has_vcl {
            // parameter sets or SEI with no picture: nothing to emit yet
            return Ok(());
        }

        self.refresh_timing();
        self.refresh_info();

        let idr = self.dec.idr_pic;
        if idr && !self.gop.is_empty() {
            self.flush_gop();
        }

        let new_sd = if self.sample_count == 0 || self.config_changed {
            self.push_dsi()?;
            self.config_changed = false;
            true
        } else {
            false
        };

        // length-prefixed payload; parameter sets and AUD stay out of
        // the sample, they live in the sample entry
        let mut payload = Vec::new();
        let mut subsamples = Vec::new();
        let mut pos = u64::MAX;
        for nal in &au {
            match nal.unit_type() {
                NAL_TYPE_ACCESS_UNIT
                | NAL_TYPE_SEQ_PARAM
                | NAL_TYPE_PIC_PARAM
                | NAL_TYPE_SUBSET_SEQ_PARAM => continue,
                _ => {}
            }
            let body = nal.body();
            payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
            payload.extend_from_slice(body);
            subsamples.push(4 + body.len() as u32);
            pos = pos.min(nal.pos);
        }
        if payload.is_empty() {
            return Ok(());
        }

        let duration = if self.dec.pic_type == PicType::Frame {
            self.frame_dur
        } else {
            (self.frame_dur / 2).max(1)
        };

        let dts = self.next_dts;
        self.next_dts += duration as u64;
        self.sample_count += 1;

        self.gop.push(PendingAu {
            payload,
            subsamples,
            pos,
            dts,
            duration,
            poc: self.dec.pic_order_cnt,
            idr,
            ref_idc: self.dec.slice().nal_ref_idc,
            slice_type: self.dec.slice().slice_type,
            redundancy: self.dec.sample_has_redundancy,
            new_sd,
        });
        self.dec.start_new_sample();
        Ok(())
    }

    fn refresh_timing(&mut self) {
        if self.timing_from_vui {
            return;
        }
        if let Some(sps) = self.dec.active_sps() {
            if sps.timing_info_present {
                self.time_scale = sps.time_scale;
                self.frame_dur = sps.num_units_in_tick.saturating_mul(2).max(1);
                self.timing_from_vui = true;
            }
        }
    }

    fn refresh_info(&mut self) {
        if self.info_set {
            return;
        }
        if let Some(sps) = self.dec.active_sps() {
            self.info.time_scale = self.time_scale;
            self.info.width = sps.pic_width_out;
            self.info.height = sps.pic_height_out;
            if sps.sar_width != 0 && sps.sar_height != 0 {
                self.info.par = (sps.sar_width as u32, sps.sar_height as u32);
            }
            if sps.colour_description_present {
                self.info.colour = Some((
                    sps.colour_primaries as u16,
                    sps.transfer_characteristics as u16,
                    sps.matrix_coefficients as u16,
                ));
            }
            self.info.bit_rate = sps.bit_rate_last;
            self.info.max_bit_rate = sps.bit_rate_last;
            self.info.buffer_size_db = sps.cpb_size_last;
            self.info_set = true;
        }
    }

    /// Assemble an AVCDecoderConfigurationRecord from the collected
    /// parameter sets (ISO/IEC 14496-15 section 5.2.4.1).
    fn push_dsi(&mut self) -> Result<()> {
        let first_sps = self
            .dec
            .active_sps()
            .ok_or_else(|| Error::NoConfig("no sps before first picture".into()))?;

        let mut cfg = Vec::with_capacity(64);
        cfg.push(1); // configurationVersion
        cfg.push(first_sps.profile_idc);
        cfg.push(first_sps.compatibility);
        cfg.push(first_sps.level_idc);
        cfg.push(0xff); // lengthSizeMinusOne = 3
        cfg.push(0xe0 | (self.sps_nals.len() as u8 & 0x1f));
        for nal in self.sps_nals.values() {
            cfg.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            cfg.extend_from_slice(nal);
        }
        cfg.push(self.pps_nals.len() as u8);
        for nal in self.pps_nals.values() {
            cfg.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            cfg.extend_from_slice(nal);
        }
        self.dsi_entries.push(DsiEntry::new(FourCc::new(b"avcC"), cfg));
        Ok(())
    }

    /// Assign CTS by POC rank within the flushed period and emit the
    /// samples in decode order.
    fn flush_gop(&mut self) {
        if self.gop.is_empty() {
            return;
        }
        let n = self.gop.len();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (self.gop[i].poc, i));
        let mut rank = vec![0usize; n];
        for (r, &i) in order.iter().enumerate() {
            rank[i] = r;
        }

        let delay = (0..n).map(|i| i.saturating_sub(rank[i])).max().unwrap_or(0);

        let dts: Vec<u64> = self.gop.iter().map(|a| a.dts).collect();
        let last_dts = dts[n - 1];
        let last_dur = self.gop[n - 1].duration as u64;

        for (i, au) in self.gop.drain(..).enumerate() {
            let j = rank[i] + delay;
            let cts = if j < n {
                dts[j]
            } else {
                last_dts + (j - n + 1) as u64 * last_dur
            };

            let is_i = au.slice_type % 5 == SLICE_TYPE_I || au.slice_type % 5 == 4;
            let is_b = au.slice_type % 5 == SLICE_TYPE_B;
            let frame_type = if is_i {
                1
            } else if is_b {
                3
            } else {
                2
            };

            let mut flags = SampleFlags::empty();
            if au.idr {
                flags.insert(SampleFlags::SYNC);
            }
            if au.new_sd {
                flags.insert(SampleFlags::NEW_SD);
            }

            let size = au.payload.len() as u32;
            self.out.push_back(Sample {
                dts: au.dts,
                cts,
                duration: au.duration,
                size,
                pos: au.pos as i64,
                flags,
                dependency: Dependency {
                    is_leading: 0,
                    depends_on: if is_i { 2 } else { 1 },
                    is_depended_on: if au.ref_idc != 0 { 1 } else { 2 },
                    has_redundancy: if au.redundancy { 1 } else { 2 },
                },
                pic_type: frame_type,
                dependency_level: frame_type,
                frame_type,
                subsample_sizes: au.subsamples,
                data: au.payload,
                aux: None,
            });
        }
    }
}
