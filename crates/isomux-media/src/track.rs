//! Per-track state: sample tables, chunk building, edit list, payload
//! spill, and fragment bookkeeping.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use isomux_common::{
    CountValueList, Cursor, Dependency, DsiEntry, Error, IndexDtsList, Result, Sample,
    StreamInfo,
};

use crate::boxes::enc::{BlockEncryptor, EncInfo};
use crate::config::{rescale_u64, EncOptions, MuxOptions, TrackConfig};

/// A contiguous run of samples stored together in `mdat`.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub first_sample: u32,
    pub sample_count: u32,
    pub size: u64,
    pub dts: u64,
    /// 0-based sample description index; 1 is added at emission only.
    pub stsd_idx: u32,
    /// Absolute file offset, filled while `mdat` is written.
    pub offset: u64,
}

/// One sample description, opened at the sample that introduces it.
#[derive(Debug, Clone)]
pub struct StsdEntry {
    /// 0-based index of the first sample this description governs.
    pub first_sample: u32,
    pub info: StreamInfo,
    pub dsi: Vec<DsiEntry>,
}

/// One `sdtp` row.
#[derive(Debug, Clone, Copy)]
pub struct SdtpEntry {
    pub dep: Dependency,
    pub non_sync: bool,
}

impl SdtpEntry {
    /// The packed `sdtp` table byte.
    pub fn byte(&self) -> u8 {
        ((self.dep.is_leading & 0x3) << 6)
            | ((self.dep.depends_on & 0x3) << 4)
            | ((self.dep.is_depended_on & 0x3) << 2)
            | (self.dep.has_redundancy & 0x3)
    }

    /// The 32-bit sample-flags form used by `trex`/`tfhd`/`trun`.
    pub fn sample_flags(&self) -> u32 {
        self.dep.sample_flags(self.non_sync)
    }
}

/// One `trik` row.
#[derive(Debug, Clone, Copy)]
pub struct TrikEntry {
    pub pic_type: u8,
    pub dependency_level: u8,
}

/// One `elst` entry, duration already in movie timescale.
#[derive(Debug, Clone, Copy)]
pub struct EditEntry {
    pub segment_duration: u64,
    pub media_time: i64,
    pub media_rate: i16,
}

/// Movie-level fragment defaults (`trex`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TrexDefaults {
    pub sample_description_index: u32,
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
}

/// One `tfra` random-access entry.
#[derive(Debug, Clone, Copy)]
pub struct TfraEntry {
    pub time: u64,
    pub moof_offset: u64,
    pub traf_number: u32,
    pub trun_number: u32,
    pub sample_number: u32,
}

/// Sample-flag constants per ISO/IEC 14496-12 section 8.8.3.
pub const SAMPLE_FLAGS_RAP: u32 = 0x0200_0000;
pub const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// A mutable track being muxed.
pub struct Track {
    pub id: u32,
    pub info: StreamInfo,
    pub config: TrackConfig,
    pub language: [u8; 3],
    pub media_timescale: u32,
    pub movie_timescale: u32,
    /// Timescale of incoming samples (differs from `media_timescale`
    /// when warping is configured).
    parser_timescale: u32,

    // sample tables
    pub dts_lst: IndexDtsList,
    pub sync_lst: IndexDtsList,
    pub size_lst: CountValueList<u32>,
    pub cts_offset_lst: CountValueList<i64>,
    pub chunk_lst: Vec<Chunk>,
    pub stsd_lst: Vec<StsdEntry>,
    pub sdtp_lst: Vec<SdtpEntry>,
    pub trik_lst: Vec<TrikEntry>,
    pub frame_type_lst: Vec<u8>,
    pub subs_lst: Vec<Vec<u32>>,
    pub edit_lst: Vec<EditEntry>,
    /// Fragment `[start_idx, end_idx)` pairs.
    pub segment_lst: Vec<(u32, u32)>,
    /// Per-sample payload offset in the spill file.
    pub pos_lst: Vec<u64>,
    pub enc_info_lst: Vec<EncInfo>,

    // scalars
    pub sample_num: u32,
    pub media_duration: u64,
    pub sum_track_edits: u64,
    pub mdat_size: u64,
    pub sample_max_size: u32,
    pub total_bitrate: f64,
    pub first_dts: u64,
    pub last_dts: u64,
    pub last_duration: u32,
    cts_offset_base: Option<i64>,
    ctts_v1: bool,

    // derived at setup time
    pub all_rap_samples: bool,
    pub all_same_size_samples: bool,
    pub no_cts_offset: bool,

    // chunk building
    cur_chunk: Option<Chunk>,
    chunk_dts_top: u64,
    chunk_span: u64,
    max_chunk_size: u32,

    // fragment state
    pub trex: TrexDefaults,
    pub frag_dts: u64,
    pub sidx_reference_count: u16,
    pub frag_no_sync: bool,
    pub tfra_entries: Vec<TfraEntry>,
    pub dts_cursor: Cursor,
    pub sync_cursor: Cursor,

    // payload spill
    spill: Option<File>,
    spill_len: u64,

    // encryption
    pub encryptor: Option<Box<dyn BlockEncryptor>>,
    pub enc_opts: Option<EncOptions>,
}

impl Track {
    pub fn new(id: u32, info: StreamInfo, config: TrackConfig, opts: &MuxOptions) -> Self {
        let language = {
            let b = config.language.as_bytes();
            if b.len() == 3 {
                [b[0], b[1], b[2]]
            } else {
                *b"und"
            }
        };
        let parser_timescale = info.time_scale;
        let media_timescale = config.warp_media_timescale.unwrap_or(parser_timescale);
        let chunk_span_ms = config.chunk_span_ms.unwrap_or(opts.chunk_span_ms);
        let max_chunk_size = config.max_chunk_size.unwrap_or(opts.max_chunk_size);
        let enc_opts = config.enc.clone();
        Self {
            id,
            info,
            config,
            language,
            media_timescale,
            movie_timescale: 0,
            parser_timescale,
            dts_lst: IndexDtsList::new(),
            sync_lst: IndexDtsList::new(),
            size_lst: CountValueList::new(),
            cts_offset_lst: CountValueList::new(),
            chunk_lst: Vec::new(),
            stsd_lst: Vec::new(),
            sdtp_lst: Vec::new(),
            trik_lst: Vec::new(),
            frame_type_lst: Vec::new(),
            subs_lst: Vec::new(),
            edit_lst: Vec::new(),
            segment_lst: Vec::new(),
            pos_lst: Vec::new(),
            enc_info_lst: Vec::new(),
            sample_num: 0,
            media_duration: 0,
            sum_track_edits: 0,
            mdat_size: 0,
            sample_max_size: 0,
            total_bitrate: 0.0,
            first_dts: 0,
            last_dts: 0,
            last_duration: 0,
            cts_offset_base: None,
            ctts_v1: opts.ctts_v1,
            all_rap_samples: false,
            all_same_size_samples: false,
            no_cts_offset: false,
            cur_chunk: None,
            chunk_dts_top: 0,
            chunk_span: rescale_u64(chunk_span_ms as u64, media_timescale, 1000),
            max_chunk_size,
            trex: TrexDefaults::default(),
            frag_dts: 0,
            sidx_reference_count: 0,
            frag_no_sync: false,
            tfra_entries: Vec::new(),
            dts_cursor: Cursor::new(),
            sync_cursor: Cursor::new(),
            spill: None,
            spill_len: 0,
            encryptor: None,
            enc_opts,
        }
    }

    /// Warp an incoming timestamp into the media timescale.
    fn warp(&self, v: u64) -> u64 {
        if self.media_timescale == self.parser_timescale {
            v
        } else {
            rescale_u64(v, self.media_timescale, self.parser_timescale)
        }
    }

    /// Accept one sample in DTS order. This is the per-sample update
    /// that maintains every derived list and scalar.
    pub fn add_sample(&mut self, sample: &Sample) -> Result<()> {
        let dts = self.warp(sample.dts);
        let cts = self.warp(sample.cts);
        let duration = self.warp(sample.duration as u64) as u32;

        if self.sample_num > 0 && dts <= self.last_dts {
            return Err(Error::es(format!(
                "track {}: dts not strictly increasing ({} after {})",
                self.id, dts, self.last_dts
            )));
        }
        if self.sample_num == 0 {
            self.first_dts = dts;
            self.chunk_dts_top = dts;
        }

        // payload
        let pos = self.spill_len;
        if !sample.data.is_empty() {
            if self.spill.is_none() {
                self.spill = Some(tempfile::tempfile()?);
            }
            let spill = self.spill.as_mut().unwrap();
            spill.write_all(&sample.data)?;
            self.spill_len += sample.data.len() as u64;
        }
        self.pos_lst.push(pos);

        // size
        self.size_lst.update(sample.size);
        self.mdat_size += sample.size as u64;
        self.sample_max_size = self.sample_max_size.max(sample.size);

        // dependency tables: video always; audio only once the table
        // exists, keeping its length in step with dts_lst
        let is_sync = sample.is_sync();
        if self.info.kind.is_video() || !self.sdtp_lst.is_empty() {
            self.sdtp_lst.push(SdtpEntry {
                dep: sample.dependency,
                non_sync: !is_sync,
            });
        }
        self.trik_lst.push(TrikEntry {
            pic_type: sample.pic_type,
            dependency_level: sample.dependency_level,
        });
        self.frame_type_lst.push(sample.frame_type);

        // subsamples: a single-piece sample is a marker row
        if sample.subsample_sizes.len() > 1 {
            self.subs_lst.push(sample.subsample_sizes.clone());
        } else {
            self.subs_lst.push(Vec::new());
        }

        if is_sync {
            self.sync_lst.push(self.sample_num, dts);
        }
        self.dts_lst.push(self.sample_num, dts);

        // composition offset, with the version-1 base subtraction
        let offset = cts as i64 - dts as i64;
        if self.cts_offset_base.is_none() {
            self.cts_offset_base = Some(if self.ctts_v1 { offset } else { 0 });
        }
        self.cts_offset_lst
            .update(offset - self.cts_offset_base.unwrap());

        self.media_duration = (dts + duration as u64) - self.first_dts;
        self.last_dts = dts;
        self.last_duration = duration;

        // chunk builder
        let open_new = match &self.cur_chunk {
            None => true,
            Some(c) => {
                c.size + sample.size as u64 > self.max_chunk_size as u64
                    || dts >= self.chunk_dts_top
                    || sample.is_new_sd()
            }
        };
        if open_new {
            if let Some(c) = self.cur_chunk.take() {
                self.chunk_lst.push(c);
            }
            if sample.is_new_sd() || self.stsd_lst.is_empty() {
                if !sample.is_new_sd() {
                    return Err(Error::es(format!(
                        "track {}: first sample does not open a sample description",
                        self.id
                    )));
                }
                self.stsd_lst.push(StsdEntry {
                    first_sample: self.sample_num,
                    info: self.info.clone(),
                    dsi: Vec::new(),
                });
            }
            self.chunk_dts_top = dts + self.chunk_span;
            self.cur_chunk = Some(Chunk {
                first_sample: self.sample_num,
                sample_count: 1,
                size: sample.size as u64,
                dts,
                stsd_idx: (self.stsd_lst.len() - 1) as u32,
                offset: 0,
            });
        } else {
            let c = self.cur_chunk.as_mut().unwrap();
            c.sample_count += 1;
            c.size += sample.size as u64;
        }

        // running bitrate estimate
        if duration > 0 {
            let inst =
                sample.size as f64 * 8.0 * self.media_timescale as f64 / duration as f64;
            self.total_bitrate += inst;
        }

        self.sample_num += 1;
        Ok(())
    }

    /// Push an edit-list entry; `duration` is in media timescale and is
    /// converted to movie timescale here.
    pub fn add_edit(&mut self, duration: u64, media_time: i64) {
        let movie_dur = rescale_u64(duration, self.movie_timescale, self.media_timescale);
        self.sum_track_edits += movie_dur;
        self.edit_lst.push(EditEntry {
            segment_duration: movie_dur,
            media_time,
            media_rate: 1,
        });
    }

    /// Attach the parser's DSI entries, one per sample description.
    pub fn attach_dsi(&mut self, dsi: Vec<DsiEntry>) -> Result<()> {
        if self.stsd_lst.is_empty() {
            return Err(Error::EmptyStream);
        }
        if dsi.len() < self.stsd_lst.len() {
            return Err(Error::internal(format!(
                "track {}: {} dsi entries for {} sample descriptions",
                self.id,
                dsi.len(),
                self.stsd_lst.len()
            )));
        }
        // extra entries (enhancement-layer configs) ride on the last
        // description
        let n = self.stsd_lst.len();
        let mut it = dsi.into_iter();
        for (i, entry) in self.stsd_lst.iter_mut().enumerate() {
            entry.dsi.push(it.next().unwrap());
            if i == n - 1 {
                entry.dsi.extend(it.by_ref());
            }
        }
        Ok(())
    }

    /// Pre-write finalization: verify the track is non-empty, derive
    /// the boolean summaries, synthesize the default edit list, set up
    /// fragment defaults, and rewind the spill file.
    pub fn setup(&mut self, movie_timescale: u32) -> Result<()> {
        if self.sample_num == 0 {
            return Err(Error::EmptyStream);
        }
        self.movie_timescale = movie_timescale;

        if let Some(c) = self.cur_chunk.take() {
            self.chunk_lst.push(c);
        }

        self.all_rap_samples = self.sync_lst.len() == self.sample_num as usize;
        self.all_same_size_samples = self.size_lst.run_count() <= 1;
        self.no_cts_offset = self
            .cts_offset_lst
            .runs()
            .iter()
            .all(|r| r.value == 0)
            && self.cts_offset_base.unwrap_or(0) == 0;

        // default edit list: skip the initial reorder delay
        let first_offset = self
            .cts_offset_lst
            .value_at(0)
            .map(|v| v + self.cts_offset_base.unwrap_or(0))
            .unwrap_or(0);
        if first_offset > 0 && self.edit_lst.is_empty() {
            self.add_edit(self.media_duration, first_offset);
        }

        // fragment defaults
        let default_duration = if self.dts_lst.len() > 1 {
            (self.dts_lst.get(1).unwrap().dts - self.dts_lst.get(0).unwrap().dts) as u32
        } else {
            self.media_duration as u32
        };
        self.trex = TrexDefaults {
            sample_description_index: 1,
            duration: default_duration,
            size: self.size_lst.value_at(0).unwrap_or(0),
            flags: if self.all_rap_samples {
                SAMPLE_FLAGS_RAP
            } else {
                SAMPLE_FLAGS_NON_SYNC
            },
        };

        self.dts_cursor.rewind();
        self.sync_cursor.rewind();

        if let Some(f) = &mut self.spill {
            f.seek(SeekFrom::Start(0))?;
        }
        Ok(())
    }

    /// Track duration in movie timescale for `tkhd`/`mvhd`: the edit
    /// list total when present, else the rescaled media duration.
    pub fn presentation_duration(&self) -> u64 {
        if self.sum_track_edits > 0 {
            self.sum_track_edits
        } else {
            rescale_u64(self.media_duration, self.movie_timescale, self.media_timescale)
        }
    }

    /// Whether the sample at `idx` is a sync sample.
    pub fn is_sync_sample(&self, idx: u32) -> bool {
        self.all_rap_samples || self.sync_lst.dts_of(idx).is_some()
    }

    /// Total payload size of samples `[first, first + count)`.
    pub fn sample_range_size(&self, first: u32, count: u32) -> Result<u64> {
        let mut total = 0u64;
        for i in first..first + count {
            total += self
                .size_lst
                .value_at(i as u64)
                .ok_or_else(|| Error::internal("sample size out of range"))?
                as u64;
        }
        Ok(total)
    }

    /// Read the payload bytes of samples `[first, first + count)` from
    /// the spill file into `buf`, which must be exactly sized.
    pub fn read_samples_into(&mut self, first: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        let start = *self
            .pos_lst
            .get(first as usize)
            .ok_or_else(|| Error::internal("sample index out of range"))?;
        let total = self.sample_range_size(first, count)?;
        if buf.len() as u64 != total {
            return Err(Error::internal("sample range buffer size mismatch"));
        }
        let spill = self
            .spill
            .as_mut()
            .ok_or_else(|| Error::internal("track has no spilled payload"))?;
        spill.seek(SeekFrom::Start(start))?;
        spill.read_exact(buf)?;
        Ok(())
    }

    /// Read the payload bytes of samples `[first, first + count)` from
    /// the spill file.
    pub fn read_samples(&mut self, first: u32, count: u32) -> Result<Vec<u8>> {
        let total = self.sample_range_size(first, count)?;
        let mut buf = vec![0u8; total as usize];
        self.read_samples_into(first, count, &mut buf)?;
        Ok(buf)
    }

    /// The dts at which the next sample description after the one
    /// governing `idx` opens; `u64::MAX` when none does.
    pub fn next_sd_change_dts(&self, idx: u32) -> u64 {
        for entry in &self.stsd_lst {
            if entry.first_sample > idx {
                return self
                    .dts_lst
                    .dts_of(entry.first_sample)
                    .unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }

    /// Signed base used for `ctts` version 1.
    pub fn cts_offset_base(&self) -> i64 {
        self.cts_offset_base.unwrap_or(0)
    }

    pub fn uses_ctts_v1(&self) -> bool {
        self.ctts_v1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isomux_common::FourCc;

    fn audio_track(opts: &MuxOptions) -> Track {
        let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
        info.time_scale = 48000;
        info.sample_rate = 48000;
        Track::new(1, info, TrackConfig::default(), opts)
    }

    fn audio_sample(i: u64, size: u32, new_sd: bool) -> Sample {
        let mut flags = SampleFlags::SYNC;
        if new_sd {
            flags.insert(SampleFlags::NEW_SD);
        }
        Sample {
            dts: i * 1024,
            cts: i * 1024,
            duration: 1024,
            size,
            flags,
            data: vec![0xAB; size as usize],
            ..Sample::default()
        }
    }

    #[test]
    fn accepts_samples_and_derives_tables() {
        let opts = MuxOptions::default();
        let mut t = audio_track(&opts);
        for i in 0..100u64 {
            t.add_sample(&audio_sample(i, 200, i == 0)).unwrap();
        }
        t.attach_dsi(vec![DsiEntry::new(FourCc::new(b"esds"), vec![0x11, 0x90])])
            .unwrap();
        t.setup(48000).unwrap();

        assert_eq!(t.sample_num, 100);
        assert_eq!(t.media_duration, 100 * 1024);
        assert_eq!(t.mdat_size, 100 * 200);
        assert!(t.all_rap_samples);
        assert!(t.all_same_size_samples);
        assert!(t.no_cts_offset);
        assert_eq!(t.stsd_lst.len(), 1);
        assert_eq!(t.size_lst.run_count(), 1);
        // chunk span 1000 ms at 48 kHz = 48000 units: ~47 frames each
        assert!(t.chunk_lst.len() > 1);
        let total: u64 = t.chunk_lst.iter().map(|c| c.size).sum();
        assert_eq!(total, t.mdat_size);
        let count: u32 = t.chunk_lst.iter().map(|c| c.sample_count).sum();
        assert_eq!(count, 100);
    }

    #[test]
    fn dts_must_increase() {
        let opts = MuxOptions::default();
        let mut t = audio_track(&opts);
        t.add_sample(&audio_sample(0, 10, true)).unwrap();
        let mut bad = audio_sample(0, 10, false);
        bad.dts = 0;
        assert!(t.add_sample(&bad).is_err());
    }

    #[test]
    fn new_sd_opens_chunk_and_description() {
        let opts = MuxOptions::default();
        let mut t = audio_track(&opts);
        for i in 0..10u64 {
            t.add_sample(&audio_sample(i, 100, i == 0 || i == 7)).unwrap();
        }
        assert_eq!(t.stsd_lst.len(), 2);
        assert_eq!(t.stsd_lst[1].first_sample, 7);
        // the chunk opened at sample 7 carries the new description
        let c = t
            .chunk_lst
            .iter()
            .chain(t.cur_chunk.iter())
            .find(|c| c.first_sample == 7)
            .unwrap();
        assert_eq!(c.stsd_idx, 1);
    }

    #[test]
    fn default_edit_list_from_cts_offset() {
        let opts = MuxOptions::default();
        let mut info = StreamInfo::video(FourCc::new(b"avc1"));
        info.time_scale = 90000;
        let mut t = Track::new(1, info, TrackConfig::default(), &opts);
        for i in 0..4u64 {
            let s = Sample {
                dts: i * 3000,
                cts: i * 3000 + 3000, // one-frame reorder delay
                duration: 3000,
                size: 10,
                flags: if i == 0 {
                    SampleFlags::SYNC | SampleFlags::NEW_SD
                } else {
                    SampleFlags::empty()
                },
                data: vec![0; 10],
                ..Sample::default()
            };
            t.add_sample(&s).unwrap();
        }
        t.attach_dsi(vec![DsiEntry::new(FourCc::new(b"avcC"), vec![1])])
            .unwrap();
        t.setup(600).unwrap();
        assert!(!t.no_cts_offset);
        assert_eq!(t.edit_lst.len(), 1);
        assert_eq!(t.edit_lst[0].media_time, 3000);
        // 12000 units at 90 kHz = 80 units at 600
        assert_eq!(t.edit_lst[0].segment_duration, 80);
        assert_eq!(t.presentation_duration(), 80);
    }

    #[test]
    fn spill_read_back() {
        let opts = MuxOptions::default();
        let mut t = audio_track(&opts);
        for i in 0..5u64 {
            let mut s = audio_sample(i, 4, i == 0);
            s.data = vec![i as u8; 4];
            t.add_sample(&s).unwrap();
        }
        t.setup(48000).unwrap();
        let bytes = t.read_samples(1, 2).unwrap();
        assert_eq!(bytes, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn warped_timescale() {
        let opts = MuxOptions::default();
        let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
        info.time_scale = 48000;
        let cfg = TrackConfig {
            warp_media_timescale: Some(24000),
            ..TrackConfig::default()
        };
        let mut t = Track::new(1, info, cfg, &opts);
        t.add_sample(&audio_sample(0, 10, true)).unwrap();
        t.add_sample(&audio_sample(1, 10, false)).unwrap();
        assert_eq!(t.media_timescale, 24000);
        assert_eq!(t.dts_lst.get(1).unwrap().dts, 512);
        assert_eq!(t.media_duration, 1024);
    }
}
