//! AC-3 / E-AC-3 elementary-stream parser.
//!
//! Syncframes are located by their `0B 77` (or byte-swapped `77 0B`)
//! syncword; an 8x8 matrix of independent and dependent substreams is
//! tracked, and substream frames accumulate until 1536 PCM samples make
//! one mp4 sample. Little-endian input is byte-swapped to big-endian
//! unless LE preservation is requested.

pub mod tables;

use std::io::{Read, Seek, SeekFrom};

use isomux_common::{DsiEntry, Error, FourCc, Result, Sample, SampleFlags, StreamInfo};
use isomux_io::{BitReader, BitWriter};

use tables::*;

pub const MAX_STREAMS: usize = 8;
pub const MAX_SUBSTREAMS: usize = 8;

/// Bytes read past the syncword before the frame size is known.
const HDR_PRE_READ: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdType {
    #[default]
    None,
    Ac3,
    Ec3,
}

/// Per-substream header fields, enough to build `dac3`/`dec3`.
#[derive(Debug, Clone, Default)]
pub struct Substream {
    pub ddt: DdType,
    /// kbps.
    pub data_rate: u32,
    pub strmtyp: u8,
    pub fscod: u8,
    pub bsid: u8,
    pub bsmod: u8,
    pub acmod: u8,
    pub lfeon: u8,
    /// AC-3 only.
    pub bit_rate_code: u8,
    /// E-AC-3 dependent substreams only.
    pub chan_loc: u16,
    pub channel_flags: u16,
    pub dsurmod: u8,
    pub addbsi: Vec<u8>,
}

enum Scan {
    /// A substream frame was consumed and its state recorded.
    Substream,
    /// The next frame opens a new dd frame; stream rolled back to it.
    FrameBoundary,
    EndOfData,
}

/// AC-3 / E-AC-3 elementary-stream parser.
pub struct DdParser<R> {
    r: BitReader<R>,

    pub ddt: DdType,
    is_le: bool,
    preserve_le: bool,

    subs_ind: Vec<Substream>,
    subs: Vec<Vec<Substream>>,
    pub num_ind_sub: u32,

    mp4_sample_num: u32,
    dd_frame_num: u32,
    aud_sample_num: u32,
    numblks: u8,
    dts: u64,
    sample_rate: u32,
    frame_size: u32,
    bit_rate: u32,

    last_indep: i32,
    last_dep: i32,

    sample_buf: Vec<u8>,
    channel_flags_prg: [u16; MAX_STREAMS],
    nfchans_prg: [u32; MAX_STREAMS],

    time_scale: u32,
    finished: bool,
    conformance: Option<FourCc>,
}

impl<R: Read + Seek> DdParser<R> {
    pub fn new(src: R) -> Self {
        Self {
            r: BitReader::new(src),
            ddt: DdType::None,
            is_le: false,
            preserve_le: false,
            subs_ind: vec![Substream::default(); MAX_STREAMS],
            subs: vec![vec![Substream::default(); MAX_SUBSTREAMS]; MAX_STREAMS],
            num_ind_sub: 0,
            mp4_sample_num: 0,
            dd_frame_num: 0,
            aud_sample_num: 0,
            numblks: 6,
            dts: 0,
            sample_rate: 0,
            frame_size: 0,
            bit_rate: 0,
            last_indep: -1,
            last_dep: -1,
            sample_buf: Vec::new(),
            channel_flags_prg: [0; MAX_STREAMS],
            nfchans_prg: [0; MAX_STREAMS],
            time_scale: 0,
            finished: false,
            conformance: None,
        }
    }

    /// Keep little-endian frames little-endian in the output sample
    /// data instead of byte-swapping them to big-endian.
    pub fn preserve_little_endian(mut self, keep: bool) -> Self {
        self.preserve_le = keep;
        self
    }

    /// Enable CFF conformance checking for the given brand
    /// (`cffs`/`cffh`); findings are warnings, never errors.
    pub fn set_conformance(&mut self, brand: FourCc) {
        self.conformance = Some(brand);
    }

    pub fn stream_info(&self) -> StreamInfo {
        let coding = match self.ddt {
            DdType::Ec3 => FourCc::new(b"ec-3"),
            _ => FourCc::new(b"ac-3"),
        };
        let mut info = StreamInfo::audio(coding);
        info.time_scale = self.time_scale;
        info.sample_rate = self.sample_rate;
        info.channel_count = self.nfchans_prg[0] as u16;
        info.bit_rate = self.bit_rate;
        info.max_bit_rate = self.bit_rate;
        info
    }

    pub fn dsi_entries(&self) -> Vec<DsiEntry> {
        match self.ddt {
            DdType::Ac3 => vec![DsiEntry::new(FourCc::new(b"dac3"), self.build_dac3())],
            DdType::Ec3 => vec![DsiEntry::new(FourCc::new(b"dec3"), self.build_dec3(true))],
            DdType::None => Vec::new(),
        }
    }

    /// Scan to the next `0B 77` / `77 0B` syncword. On return the
    /// stream sits just past the two sync bytes.
    fn goto_next_syncword(&mut self) -> Result<bool> {
        let mut b = [0u8; 1];
        if self.r.read_some(&mut b)? == 0 {
            return Ok(false);
        }
        let mut last = b[0];

        // the almost-certain case first
        if last == 0x0b || last == 0x77 {
            if self.r.read_some(&mut b)? == 0 {
                return Ok(false);
            }
            if last == 0x0b && b[0] == 0x77 {
                if self.is_le {
                    tracing::info!("dd endianness flip LE=>BE");
                }
                self.is_le = false;
                return Ok(true);
            }
            if last == 0x77 && b[0] == 0x0b {
                if !self.is_le {
                    tracing::info!("dd endianness flip BE=>LE");
                }
                self.is_le = true;
                return Ok(true);
            }
            last = b[0];
        }

        tracing::warn!("lost dd sync, rescanning");
        let mut skipped = 1u64;
        loop {
            if self.r.read_some(&mut b)? == 0 {
                return Ok(false);
            }
            let cur = b[0];
            if (last == 0x0b && cur == 0x77) || (last == 0x77 && cur == 0x0b) {
                tracing::info!(skipped, "dd resynced");
                let le = last == 0x77;
                if le != self.is_le {
                    tracing::info!("dd endianness flip");
                    self.is_le = le;
                }
                return Ok(true);
            }
            last = cur;
            skipped += 1;
        }
    }

    fn swap_pairs(buf: &mut [u8]) {
        for pair in buf.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
    }

    /// Read and classify one substream frame.
    fn scan_frame(&mut self) -> Result<Scan> {
        loop {
            if !self.goto_next_syncword()? {
                return Ok(Scan::EndOfData);
            }
            let sync_start = self.r.position()? - 2;

            let mut hdr = [0u8; HDR_PRE_READ];
            let mut got = 0usize;
            while got < HDR_PRE_READ {
                let n = self.r.read_some(&mut hdr[got..])?;
                if n == 0 {
                    return Ok(Scan::EndOfData);
                }
                got += n;
            }
            if self.is_le {
                Self::swap_pairs(&mut hdr);
            }

            // bsid sits at bits 5..10 of byte 3 past the syncword
            let bsid = hdr[3] >> 3;

            if bsid <= 0x08 {
                // AC-3 path
                if self.last_indep >= 0 {
                    // a new AC-3 frame closes the previous dd frame
                    self.r.seek(SeekFrom::Start(sync_start))?;
                    self.dd_frame_num += 1;
                    self.last_indep = -1;
                    return Ok(Scan::FrameBoundary);
                }
                let fscod = hdr[2] >> 6;
                let frmsizecod = hdr[2] & 0x3f;
                if fscod >= 3 || frmsizecod as usize >= AC3_BITRATE_TBL.len() {
                    tracing::warn!("bad fscod or frmsizecod, resyncing");
                    self.r.seek(SeekFrom::Start(sync_start + 2))?;
                    continue;
                }
                self.frame_size = AC3_FRAME_SIZE_TBL[frmsizecod as usize][fscod as usize] * 2;
                match self.consume_frame(sync_start)? {
                    Some(frame) => {
                        self.parse_ac3_frame(&frame, fscod, frmsizecod)?;
                        return Ok(Scan::Substream);
                    }
                    None => return Ok(Scan::EndOfData),
                }
            } else if (0x0b..=0x10).contains(&bsid) {
                // E-AC-3 path
                let strmtyp = hdr[0] >> 6;
                let substreamid = (hdr[0] >> 3) & 0x7;
                if strmtyp == 3 {
                    tracing::warn!("strmtyp 3, resyncing");
                    self.r.seek(SeekFrom::Start(sync_start + 2))?;
                    continue;
                }
                if (strmtyp == 0 || strmtyp == 2) && (substreamid as i32) <= self.last_indep {
                    if substreamid != 0 {
                        return Err(Error::es("independent substream id went backwards"));
                    }
                    self.r.seek(SeekFrom::Start(sync_start))?;
                    self.dd_frame_num += 1;
                    self.last_indep = -1;
                    return Ok(Scan::FrameBoundary);
                }
                let frmsiz = (((hdr[0] & 0x7) as u32) << 8) | hdr[1] as u32;
                self.frame_size = (frmsiz + 1) * 2;
                if self.frame_size < HDR_PRE_READ as u32 + 2 {
                    tracing::warn!("impossible ec3 frame size, resyncing");
                    self.r.seek(SeekFrom::Start(sync_start + 2))?;
                    continue;
                }
                match self.consume_frame(sync_start)? {
                    Some(frame) => {
                        match self.parse_ec3_frame(&frame, strmtyp, substreamid) {
                            Ok(()) => return Ok(Scan::Substream),
                            Err(Error::Sync(msg)) => {
                                tracing::warn!(%msg, "ec3 frame sync problem, resyncing");
                                self.r.seek(SeekFrom::Start(sync_start + 2))?;
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    None => return Ok(Scan::EndOfData),
                }
            } else {
                tracing::warn!(bsid, "unknown bsid, resyncing");
                self.r.seek(SeekFrom::Start(sync_start + 2))?;
            }
        }
    }

    /// Read the whole frame (syncword already consumed plus the
    /// pre-read) and append it to the sample buffer. Returns the frame
    /// in big-endian byte order for header parsing, or `None` when the
    /// stream ends mid-frame.
    fn consume_frame(&mut self, sync_start: u64) -> Result<Option<Vec<u8>>> {
        self.r.seek(SeekFrom::Start(sync_start))?;
        let mut frame = vec![0u8; self.frame_size as usize];
        let mut got = 0usize;
        while got < frame.len() {
            let n = self.r.read_some(&mut frame[got..])?;
            if n == 0 {
                tracing::warn!("stream ended inside a dd frame, discarding it");
                return Ok(None);
            }
            got += n;
        }

        // keep the stored bytes in their source endianness unless the
        // caller asked for BE normalization
        if self.is_le && !self.preserve_le {
            let mut be = frame.clone();
            Self::swap_pairs(&mut be);
            self.sample_buf.extend_from_slice(&be);
            frame = be;
        } else {
            self.sample_buf.extend_from_slice(&frame);
            if self.is_le {
                Self::swap_pairs(&mut frame);
            }
        }
        Ok(Some(frame))
    }

    /// Parse an AC-3 syncframe header (frame is big-endian).
    fn parse_ac3_frame(&mut self, frame: &[u8], fscod: u8, frmsizecod: u8) -> Result<()> {
        // one sample per AC-3 frame: this frame opens the dd frame
        self.last_indep = 0;
        self.last_dep = -1;

        self.ddt = DdType::Ac3;
        self.numblks = 6;
        self.sample_rate = FSCOD_TO_FREQ[fscod as usize];

        let mut r = BitReader::from_slice(&frame[2..]);
        r.skip_bytes(2)?; // crc1
        r.skip_bits(8)?; // fscod + frmsizecod, already decoded

        let data_rate = AC3_BITRATE_TBL[frmsizecod as usize];
        let sub = &mut self.subs_ind[0];
        sub.ddt = DdType::Ac3;
        if sub.data_rate != 0 && sub.data_rate != data_rate {
            tracing::warn!(old = sub.data_rate, new = data_rate, "ac3 data rate change");
        }
        sub.data_rate = data_rate;
        sub.fscod = fscod;
        sub.bit_rate_code = frmsizecod >> 1;

        let e = crate::es_err("ac3 header");
        sub.bsid = r.read_bits(5).map_err(crate::es_err("ac3 header"))? as u8;
        sub.bsmod = r.read_bits(3).map_err(crate::es_err("ac3 header"))? as u8;
        sub.acmod = r.read_bits(3).map_err(crate::es_err("ac3 header"))? as u8;
        sub.channel_flags = ACMOD_CHANNEL_FLAGS[sub.acmod as usize];

        if (sub.acmod & 0x01) != 0 && sub.acmod != 0x01 {
            r.skip_bits(2)?; // cmixlev
        }
        if sub.acmod & 0x04 != 0 {
            r.skip_bits(2)?; // surmixlev
        }
        sub.dsurmod = if sub.acmod == 0x02 {
            r.read_bits(2).map_err(crate::es_err("ac3 header"))? as u8
        } else {
            0
        };

        sub.lfeon = r.read_bits(1).map_err(e)? as u8;
        if sub.lfeon != 0 {
            sub.channel_flags |= CHANMAP_LFE;
        }
        self.channel_flags_prg[0] = sub.channel_flags;
        self.nfchans_prg[0] = channel_num(sub.channel_flags);

        if self.mp4_sample_num == 0 {
            self.bit_rate = sub.data_rate * 1000;
        }
        Ok(())
    }

    /// Parse an E-AC-3 syncframe header (frame is big-endian).
    fn parse_ec3_frame(&mut self, frame: &[u8], strmtyp: u8, substreamid: u8) -> Result<()> {
        self.ddt = DdType::Ec3;

        let first_look;
        let prg;
        if strmtyp == 0 || strmtyp == 2 {
            if substreamid as i32 != self.last_indep + 1 {
                return Err(Error::es("independent substream id not contiguous"));
            }
            self.last_indep = substreamid as i32;
            self.last_dep = -1;
            prg = substreamid as usize;
            first_look = self.subs_ind[prg].ddt == DdType::None;
        } else {
            if self.last_indep < 0 {
                return Err(Error::sync(
                    "dependent substream without independent substream",
                ));
            }
            if substreamid as i32 != self.last_dep + 1 {
                return Err(Error::es("dependent substream id not contiguous"));
            }
            self.last_dep = substreamid as i32;
            prg = self.last_indep as usize;
            first_look =
                self.subs[prg][substreamid as usize].ddt == DdType::None;
        }

        let mut r = BitReader::from_slice(&frame[2..]);
        r.skip_bits(2 + 3 + 11)?; // strmtyp, substreamid, frmsiz

        let mut fscod = r.read_bits(2).map_err(sync_err)? as u8;
        if fscod == 0x3 {
            fscod = r.read_bits(2).map_err(sync_err)? as u8;
            if fscod >= 3 {
                return Err(Error::sync("bad fscod2"));
            }
            self.sample_rate = FSCOD2_TO_FREQ[fscod as usize];
            self.numblks = 6;
        } else {
            self.sample_rate = FSCOD_TO_FREQ[fscod as usize];
            self.numblks = NUMBLKS_TBL[r.read_bits(2).map_err(sync_err)? as usize] as u8;
        }

        let acmod = r.read_bits(3).map_err(sync_err)? as u8;
        let lfeon = r.read_bits(1).map_err(sync_err)? as u8;
        let bsid = r.read_bits(5).map_err(sync_err)? as u8;

        let data_rate = (self.frame_size as u64 * self.sample_rate as u64
            / (self.numblks as u64 * 32000)) as u32;

        let check = self.mp4_sample_num > 0 && self.cff_conformance();
        {
            let sub: &mut Substream = if strmtyp == 1 {
                &mut self.subs[prg][substreamid as usize]
            } else {
                &mut self.subs_ind[prg]
            };

            if check && sub.ddt != DdType::Ec3 {
                tracing::warn!("cff: illegal change of substream inventory");
            }
            sub.ddt = DdType::Ec3;
            if check && strmtyp != sub.strmtyp {
                tracing::warn!("cff: illegal change of strmtyp");
            }
            sub.strmtyp = strmtyp;
            if check && fscod != sub.fscod {
                tracing::warn!("cff: illegal change of fscod");
            }
            sub.fscod = fscod;
            if check && acmod != sub.acmod {
                tracing::warn!("cff: illegal change of acmod");
            }
            sub.acmod = acmod;
            if check && lfeon != sub.lfeon {
                tracing::warn!("cff: illegal change of lfeon");
            }
            sub.lfeon = lfeon;
            if check && bsid != sub.bsid {
                tracing::warn!("cff: illegal change of bsid");
            }
            sub.bsid = bsid;

            if sub.data_rate != 0 && sub.data_rate != data_rate {
                tracing::warn!(old = sub.data_rate, new = data_rate, "ec3 data rate change");
            }
            sub.data_rate = data_rate;

            r.skip_bits(5)?; // dialnorm
            if r.read_bool().map_err(sync_err)? {
                r.skip_bits(8)?; // compr
            }
            if acmod == 0 {
                r.skip_bits(5)?; // dialnorm2
                if r.read_bool().map_err(sync_err)? {
                    r.skip_bits(8)?; // compr2
                }
            }

            sub.chan_loc = 0;
            if strmtyp == 1 && r.read_bool().map_err(sync_err)? {
                // custom channel map
                let mut chanmap = 0u16;
                for b in 0..16 {
                    chanmap |= (r.read_bits(1).map_err(sync_err)? as u16) << b;
                }
                let last = sub.channel_flags;
                sub.channel_flags = chanmap & !CHANMAP_RESERVED;
                // L, C, R, Ls, Rs, LFE and the reserved bit are not in chan_loc
                sub.chan_loc = ((chanmap >> 5) & 0xff) | ((chanmap >> 6) & 0x100);
                if check && last != sub.channel_flags {
                    tracing::warn!("cff: illegal change of channel flags");
                }
            } else {
                sub.channel_flags = ACMOD_CHANNEL_FLAGS[acmod as usize];
                if lfeon != 0 {
                    sub.channel_flags |= CHANMAP_LFE;
                }
            }
            self.channel_flags_prg[prg] |= sub.channel_flags;

            let numblks = self.numblks;
            Self::skip_mixing_metadata(&mut r, sub, strmtyp, numblks)?;

            // informational metadata
            if r.read_bool().map_err(sync_err)? {
                let bsmod = r.read_bits(3).map_err(sync_err)? as u8;
                if check && bsmod != sub.bsmod && strmtyp == 0 {
                    tracing::warn!("cff: illegal change of bsmod");
                }
                sub.bsmod = bsmod;

                r.skip_bits(2)?; // copyrightb, origbs
                if acmod == 0x2 {
                    r.skip_bits(4)?; // dsurmod, dheadphonmod
                } else if acmod >= 0x6 {
                    r.skip_bits(2)?; // dsurexmod
                }
                if r.read_bool().map_err(sync_err)? {
                    r.skip_bits(8)?; // mixlevel, roomtyp, adconvtyp
                }
                if acmod == 0 {
                    if r.read_bool().map_err(sync_err)? {
                        r.skip_bits(8)?;
                    }
                }
                if fscod < 0x3 {
                    r.skip_bits(1)?; // sourcefscod
                }
            }

            if strmtyp == 0 && self.numblks != 6 {
                r.skip_bits(1)?; // convsync
            }
            if strmtyp == 2 {
                let blkid = if self.numblks == 6 {
                    1
                } else {
                    r.read_bits(1).map_err(sync_err)?
                };
                if blkid != 0 {
                    r.skip_bits(6)?; // frmsizecod
                }
            }

            sub.addbsi.clear();
            if r.read_bool().map_err(sync_err)? {
                let addbsil = r.read_bits(6).map_err(sync_err)? as usize + 1;
                for _ in 0..addbsil {
                    sub.addbsi.push(r.read_bits(8).map_err(sync_err)? as u8);
                }
            }
        }

        self.nfchans_prg[prg] = channel_num(self.channel_flags_prg[prg]);
        if self.mp4_sample_num == 0 && first_look {
            let rate = if strmtyp == 1 {
                self.subs[prg][substreamid as usize].data_rate
            } else {
                self.subs_ind[prg].data_rate
            };
            self.bit_rate += rate * 1000;
        }
        Ok(())
    }

    /// Skip mixing metadata per ATSC A/52 Annex E ordering.
    fn skip_mixing_metadata(
        r: &mut BitReader<std::io::Cursor<&[u8]>>,
        sub: &Substream,
        strmtyp: u8,
        numblks: u8,
    ) -> Result<()> {
        if !r.read_bool().map_err(sync_err)? {
            return Ok(());
        }
        if sub.acmod > 0x02 {
            r.skip_bits(2)?; // dmixmod
        }
        if (sub.acmod & 0x01) != 0 && sub.acmod > 0x2 {
            r.skip_bits(6)?; // ltrtcmixlev, lorocmixlev
        }
        if sub.acmod & 0x04 != 0 {
            r.skip_bits(6)?; // ltrtsurmixlev, lorosurmixlev
        }
        if sub.lfeon != 0 && r.read_bool().map_err(sync_err)? {
            r.skip_bits(5)?; // lfemixlevcod
        }
        if strmtyp == 0 {
            if r.read_bool().map_err(sync_err)? {
                r.skip_bits(6)?; // pgmscl
            }
            if sub.acmod == 0 && r.read_bool().map_err(sync_err)? {
                r.skip_bits(6)?; // pgmscl2
            }
            if r.read_bool().map_err(sync_err)? {
                r.skip_bits(6)?; // extpgmscl
            }
            match r.read_bits(2).map_err(sync_err)? {
                0x1 => r.skip_bits(5)?,
                0x2 => r.skip_bits(12)?,
                0x3 => {
                    let mixdeflen = r.read_bits(5).map_err(sync_err)?;
                    r.skip_bits(8 * (mixdeflen as u64 + 2))?;
                }
                _ => {}
            }
            if sub.acmod < 0x2 {
                if r.read_bool().map_err(sync_err)? {
                    r.skip_bits(14)?; // panmean, paninfo
                }
                if sub.acmod == 0 && r.read_bool().map_err(sync_err)? {
                    r.skip_bits(14)?; // panmean2, paninfo2
                }
            }
            if r.read_bool().map_err(sync_err)? {
                if numblks == 1 {
                    r.skip_bits(5)?;
                } else {
                    for _ in 0..numblks {
                        if r.read_bool().map_err(sync_err)? {
                            r.skip_bits(5)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn cff_conformance(&self) -> bool {
        matches!(self.conformance, Some(b) if b == FourCc::new(b"cffs") || b == FourCc::new(b"cffh"))
    }

    fn check_cff_conformance(&self) {
        let Some(brand) = self.conformance else {
            return;
        };
        let is_cffs = brand == FourCc::new(b"cffs");
        let is_cffh = brand == FourCc::new(b"cffh");
        if !is_cffs && !is_cffh {
            return;
        }

        if self.num_ind_sub == 1 && self.subs_ind[0].ddt == DdType::Ec3 {
            let mut datarate = self.subs_ind[0].data_rate;
            if self.subs_ind[0].fscod != 0 {
                tracing::warn!("cff ec3: wrong sample rate, expecting 48000");
            }
            if self.subs_ind[0].acmod == 0 {
                tracing::warn!("cff ec3: dual-mono not supported");
            }
            if self.subs_ind[0].bsid != 16 {
                tracing::warn!("cff ec3: wrong bsid, expecting 16");
            }
            if self.subs_ind[0].strmtyp != 0 {
                tracing::warn!("cff ec3: wrong strmtyp, expecting 0");
            }

            let dep_count = self.dep_subs_num(0);
            if dep_count == 1 {
                datarate += self.subs[0][0].data_rate;
                if self.subs[0][0].fscod != 0 {
                    tracing::warn!("cff ec3 dep: wrong sample rate, expecting 48000");
                }
                if self.subs[0][0].acmod == 0 {
                    tracing::warn!("cff ec3 dep: dual-mono not supported");
                }
                if self.subs[0][0].bsid != 16 {
                    tracing::warn!("cff ec3 dep: wrong bsid, expecting 16");
                }
                if self.subs[0][0].strmtyp != 1 {
                    tracing::warn!("cff ec3 dep: wrong strmtyp, expecting 1");
                }
                if is_cffs && self.nfchans_prg[0] > 6 {
                    tracing::warn!("cff ec3: channel mode above 5.1");
                }
                if is_cffh && self.nfchans_prg[0] > 8 {
                    tracing::warn!("cff ec3: channel mode above 7.1");
                }
            } else if dep_count > 1 {
                tracing::warn!("cff ec3: too many dependent substreams");
            }

            if datarate < 32 {
                tracing::warn!("cff ec3: data rate below 32 kbps");
            } else if datarate > 3024 {
                tracing::warn!("cff ec3: data rate above 3024 kbps");
            }
        } else if self.num_ind_sub > 1 {
            tracing::warn!("cff ec3: too many independent substreams");
        } else if self.subs_ind[0].ddt == DdType::Ac3 {
            if self.subs_ind[0].fscod != 0 {
                tracing::warn!("cff ac3: wrong sample rate, expecting 48000");
            }
            if self.subs_ind[0].acmod == 0 {
                tracing::warn!("cff ac3: dual-mono not supported");
            }
            if self.subs_ind[0].bsid != 8 && self.subs_ind[0].bsid != 6 {
                tracing::warn!("cff ac3: wrong bsid, expecting 8 or 6");
            }
            let rate = self.subs_ind[0].data_rate;
            if !(64..=640).contains(&rate) {
                tracing::warn!("cff ac3: data rate outside 64..640 kbps");
            }
        }
    }

    fn ind_subs_num(&self) -> u32 {
        self.subs_ind
            .iter()
            .take_while(|s| s.ddt != DdType::None)
            .count() as u32
    }

    fn dep_subs_num(&self, ind: usize) -> u32 {
        self.subs[ind]
            .iter()
            .take_while(|s| s.ddt != DdType::None)
            .count() as u32
    }

    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        if self.finished {
            return Ok(None);
        }

        self.last_indep = -1;
        self.sample_buf.clear();
        self.aud_sample_num = 0;
        let mut eos = false;

        loop {
            match self.scan_frame()? {
                Scan::Substream => {}
                Scan::FrameBoundary => {
                    self.aud_sample_num += self.numblks as u32 * SAMPLES_PER_BLOCK;
                    if self.aud_sample_num >= SAMPLES_PER_MP4_SAMPLE {
                        break;
                    }
                }
                Scan::EndOfData => {
                    if self.last_indep >= 0 {
                        // mid-frame EOS: count the frame when every
                        // expected substream arrived
                        let ind = self.last_indep as usize;
                        let ind_done = ind == MAX_STREAMS - 1
                            || self.subs_ind[ind + 1].ddt == DdType::None;
                        let dep_next = (self.last_dep + 1) as usize;
                        let dep_done = dep_next >= MAX_SUBSTREAMS
                            || self.subs[ind][dep_next].ddt == DdType::None;
                        if ind_done && dep_done {
                            self.dd_frame_num += 1;
                            self.aud_sample_num += self.numblks as u32 * SAMPLES_PER_BLOCK;
                            self.last_indep = -1;
                        }
                    }
                    eos = true;
                    break;
                }
            }
        }

        if eos {
            self.finished = true;
            if self.aud_sample_num != SAMPLES_PER_MP4_SAMPLE {
                if self.aud_sample_num > 0 {
                    tracing::warn!(
                        frames = self.aud_sample_num / (self.numblks as u32 * SAMPLES_PER_BLOCK),
                        "discarding incomplete final mp4 sample"
                    );
                }
                return Ok(None);
            }
        }

        if self.mp4_sample_num == 0 {
            self.time_scale = self.sample_rate;
            self.num_ind_sub = self.ind_subs_num();
            self.check_cff_conformance();
        } else {
            self.dts += self.aud_sample_num as u64;
        }

        let mut flags = SampleFlags::SYNC;
        if self.mp4_sample_num == 0 {
            flags.insert(SampleFlags::NEW_SD);
        }
        self.mp4_sample_num += 1;

        Ok(Some(Sample {
            dts: self.dts,
            cts: self.dts,
            duration: self.aud_sample_num,
            size: self.sample_buf.len() as u32,
            pos: 0,
            flags,
            data: std::mem::take(&mut self.sample_buf),
            ..Sample::default()
        }))
    }

    /// `dac3` payload: 3 packed bytes.
    fn build_dac3(&self) -> Vec<u8> {
        let sub = &self.subs_ind[0];
        let mut w = BitWriter::with_capacity(3);
        w.write_bits(2, sub.fscod as u32);
        w.write_bits(5, sub.bsid as u32);
        w.write_bits(3, sub.bsmod as u32);
        w.write_bits(3, sub.acmod as u32);
        w.write_bits(1, sub.lfeon as u32);
        w.write_bits(5, sub.bit_rate_code as u32);
        w.write_bits(5, 0);
        w.into_vec()
    }

    /// `dec3` payload: data rate, substream inventory, and (optionally)
    /// the first `addbsi` bytes for JOC signaling.
    fn build_dec3(&self, dump_joc: bool) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(8);
        let kbps = self.bit_rate / 1000;
        w.write_bits(5, kbps >> 8);
        w.write_bits(8, kbps & 0xff);

        let num_ind = self.num_ind_sub.max(1);
        w.write_bits(3, num_ind - 1);

        for i in 0..num_ind as usize {
            let ss = &self.subs_ind[i];
            w.write_bits(2, ss.fscod as u32);
            w.write_bits(5, ss.bsid as u32);
            w.write_bits(2, 0); // reserved
            w.write_bits(3, ss.bsmod as u32);
            w.write_bits(3, ss.acmod as u32);
            w.write_bits(1, ss.lfeon as u32);
            w.write_bits(3, 0); // reserved

            let num_dep = self.dep_subs_num(i);
            w.write_bits(4, num_dep);
            if num_dep > 0 {
                let mut chan_loc = 0u16;
                for d in &self.subs[i] {
                    if d.ddt == DdType::None {
                        break;
                    }
                    chan_loc |= d.chan_loc;
                }
                w.write_bits(1, (chan_loc >> 8) as u32);
                w.write_bits(8, (chan_loc & 0xff) as u32);
            } else {
                w.write_bits(1, 0); // reserved
            }
        }

        if dump_joc && num_ind > 0 {
            let active = if self.dep_subs_num(0) > 0 {
                &self.subs[0][0]
            } else {
                &self.subs_ind[0]
            };
            if !active.addbsi.is_empty() {
                w.flush_bits();
                w.write_u8(active.addbsi[0]);
                if active.addbsi[0] != 0 && active.addbsi.len() >= 2 {
                    w.write_u8(active.addbsi[1]);
                }
            }
        }

        w.into_vec()
    }
}

fn sync_err(_: std::io::Error) -> Error {
    Error::sync("truncated dd frame header")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build an AC-3 syncframe: 48 kHz, 3/2 + LFE, bsid 8.
    fn ac3_frame(frmsizecod: u8) -> Vec<u8> {
        let size = AC3_FRAME_SIZE_TBL[frmsizecod as usize][0] as usize * 2;
        let mut w = BitWriter::with_capacity(size);
        w.write_u16(0x0b77);
        w.write_u16(0); // crc1
        w.write_bits(2, 0); // fscod 48 kHz
        w.write_bits(6, frmsizecod as u32);
        w.write_bits(5, 8); // bsid
        w.write_bits(3, 0); // bsmod
        w.write_bits(3, 7); // acmod 3/2
        w.write_bits(2, 0); // cmixlev (acmod & 1)
        w.write_bits(2, 0); // surmixlev (acmod & 4)
        w.write_bits(1, 1); // lfeon
        w.flush_bits();
        let mut v = w.into_vec();
        v.resize(size, 0);
        v
    }

    /// Build an E-AC-3 syncframe header; `size` bytes total.
    fn ec3_frame(strmtyp: u8, substreamid: u8, size: usize, chanmap_lrs: bool) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(size);
        w.write_u16(0x0b77);
        w.write_bits(2, strmtyp as u32);
        w.write_bits(3, substreamid as u32);
        w.write_bits(11, (size as u32 / 2) - 1); // frmsiz
        w.write_bits(2, 0); // fscod 48 kHz
        w.write_bits(2, 3); // numblkscod -> 6 blocks
        w.write_bits(3, 7); // acmod 3/2
        w.write_bits(1, 1); // lfeon
        w.write_bits(5, 16); // bsid
        w.write_bits(5, 0); // dialnorm
        w.write_bits(1, 0); // compre
        if strmtyp == 1 {
            w.write_bits(1, 1); // chanmape
            for b in 0..16 {
                let bit = if chanmap_lrs && b == 6 { 1 } else { 0 };
                w.write_bits(1, bit); // Lrs/Rrs is transmitted bit 6
            }
        }
        w.write_bits(1, 0); // mixmdate
        w.write_bits(1, 0); // infomdate
        if strmtyp == 2 {
            w.write_bits(1, 0); // blkid (numblks == 6 forces 1, unused here)
        }
        w.write_bits(1, 0); // addbsie
        w.flush_bits();
        let mut v = w.into_vec();
        v.resize(size, 0);
        v
    }

    #[test]
    fn ac3_one_sample_per_frame() {
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend_from_slice(&ac3_frame(14)); // 224 kbps
        }
        let mut p = DdParser::new(Cursor::new(stream));
        let mut samples = Vec::new();
        while let Some(s) = p.next_sample().unwrap() {
            samples.push(s);
        }
        assert_eq!(samples.len(), 3);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.duration, 1536);
            assert_eq!(s.dts, i as u64 * 1536);
            assert!(s.is_sync());
            assert_eq!(s.size as usize, 224 * 2);
        }
        assert_eq!(p.ddt, DdType::Ac3);
        let info = p.stream_info();
        assert_eq!(info.sample_rate, 48000);
        assert_eq!(info.channel_count, 6); // 3/2 + LFE
        assert_eq!(info.bit_rate, 224_000);
        assert_eq!(info.coding_name, FourCc::new(b"ac-3"));
    }

    #[test]
    fn dac3_payload() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&ac3_frame(14));
        stream.extend_from_slice(&ac3_frame(14));
        let mut p = DdParser::new(Cursor::new(stream));
        while p.next_sample().unwrap().is_some() {}
        let dsi = p.dsi_entries();
        assert_eq!(dsi.len(), 1);
        assert_eq!(dsi[0].tag, FourCc::new(b"dac3"));
        assert_eq!(dsi[0].data.len(), 3);
        // fscod 0, bsid 8, bsmod 0, acmod 7, lfeon 1, brcode 7
        let mut w = BitWriter::new();
        w.write_bits(2, 0);
        w.write_bits(5, 8);
        w.write_bits(3, 0);
        w.write_bits(3, 7);
        w.write_bits(1, 1);
        w.write_bits(5, 7);
        w.write_bits(5, 0);
        assert_eq!(dsi[0].data, w.into_vec());
    }

    #[test]
    fn ec3_independent_plus_dependent() {
        let mut stream = Vec::new();
        for _ in 0..2 {
            stream.extend_from_slice(&ec3_frame(0, 0, 256, false));
            stream.extend_from_slice(&ec3_frame(1, 0, 128, true));
        }
        let mut p = DdParser::new(Cursor::new(stream));
        let mut samples = Vec::new();
        while let Some(s) = p.next_sample().unwrap() {
            samples.push(s);
        }
        assert_eq!(samples.len(), 2);
        // both substream frames belong to one mp4 sample
        assert_eq!(samples[0].size as usize, 256 + 128);
        assert_eq!(samples[0].duration, 1536);
        assert_eq!(p.num_ind_sub, 1);

        let dsi = p.dsi_entries();
        assert_eq!(dsi[0].tag, FourCc::new(b"dec3"));
        // data rates: 256B and 128B at 48 kHz over 6 blocks = 64+32 kbps
        let data = &dsi[0].data;
        let kbps = ((data[0] as u32) << 8 | data[1] as u32) >> 3;
        assert_eq!(kbps, 96);
        // num_ind_sub - 1 == 0
        assert_eq!(data[1] & 0x7, 0);
        // substream row: fscod 0, bsid 16, acmod 7, lfeon 1, 1 dep sub,
        // chan_loc bit 1 (Lrs/Rrs)
        let row = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        assert_eq!(row >> 30, 0); // fscod
        assert_eq!((row >> 25) & 0x1f, 16); // bsid
        assert_eq!((row >> 17) & 0x7, 7); // acmod
        assert_eq!((row >> 16) & 0x1, 1); // lfeon
        assert_eq!((row >> 9) & 0xf, 1); // num_dep_sub
        assert_eq!(row & 0x1ff, 0x02); // chan_loc: Lrs/Rrs
    }

    #[test]
    fn little_endian_input_is_swapped() {
        let frame = ac3_frame(14);
        let mut le = frame.clone();
        for pair in le.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        let mut stream = Vec::new();
        stream.extend_from_slice(&le);
        stream.extend_from_slice(&le);
        let mut p = DdParser::new(Cursor::new(stream));
        let s = p.next_sample().unwrap().unwrap();
        // stored bytes are normalized to big-endian
        assert_eq!(&s.data[..2], &[0x0b, 0x77]);
        assert_eq!(s.data, frame);
    }

    #[test]
    fn resync_over_garbage() {
        let mut stream = vec![0x12, 0x34, 0x0b, 0x12];
        stream.extend_from_slice(&ac3_frame(14));
        stream.extend_from_slice(&ac3_frame(14));
        let mut p = DdParser::new(Cursor::new(stream));
        let s = p.next_sample().unwrap().unwrap();
        assert_eq!(s.duration, 1536);
    }

    #[test]
    fn truncated_final_frame_is_discarded() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&ac3_frame(14));
        let tail = ac3_frame(14);
        stream.extend_from_slice(&tail[..100]); // cut mid-frame
        let mut p = DdParser::new(Cursor::new(stream));
        assert!(p.next_sample().unwrap().is_some());
        assert!(p.next_sample().unwrap().is_none());
    }
}
