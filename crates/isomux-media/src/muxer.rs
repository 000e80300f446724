//! The muxer orchestrator: drives tracks, sample tables, the box
//! serializer, and the fragmenter against a byte sink.
//!
//! Lifecycle: `add_track` while configuring, `input_sample` per
//! sample, `finish_track` once a stream is exhausted, then a single
//! `output` call that writes the whole file and returns the sink.

use std::io::{Seek, SeekFrom, Write};

use bytes::BytesMut;

use isomux_common::{DsiEntry, Error, Result, Sample, StreamInfo};

use crate::bitrate::calculate_bitrate;
use crate::boxes::enc::{encrypt_sample, write_saiz, write_saio, write_senc, BlockEncryptor};
use crate::boxes::frag::{
    write_avcn, write_mfhd, write_mfra, write_sidx, write_tfdt, write_tfhd, write_trik,
    write_trun, SidxEntry, TF_BASE_DATA_OFFSET, TR_DATA_OFFSET,
};
use crate::boxes::moov::{
    write_ainf, write_bloc, write_free, write_ftyp, write_moov, write_pdin, write_styp, UserData,
};
use crate::boxes::stbl::{write_sdtp_entries, write_subs, StcoPatch};
use crate::boxes::{box_end, box_start, mdat_header, mdat_header_size, patch_u32, patch_u64};
use crate::config::{rescale_u64, EncStyle, FragOptions, MuxConfig, TrackConfig};
use crate::fragment::{create_fragment_list, prepare_traf};
use crate::track::{TfraEntry, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Configured,
    Populated,
    Done,
}

/// Scratch-buffer growth granularity.
const SCRATCH_GRANULARITY: usize = 4096;

pub struct Muxer<W: Write + Seek> {
    cfg: MuxConfig,
    pub tracks: Vec<Track>,
    sink: W,
    state: MuxState,
    movie_timescale: u32,
    sequence_number: u32,
    udta: UserData,
    scratch: Vec<u8>,
}

impl<W: Write + Seek> Muxer<W> {
    pub fn new(cfg: MuxConfig, sink: W) -> Self {
        Self {
            cfg,
            tracks: Vec::new(),
            sink,
            state: MuxState::Configured,
            movie_timescale: 0,
            sequence_number: 0,
            udta: UserData::default(),
            scratch: Vec::new(),
        }
    }

    /// Add a track; returns its index for `input_sample`.
    pub fn add_track(&mut self, config: TrackConfig, info: StreamInfo) -> Result<usize> {
        if self.state != MuxState::Configured {
            return Err(Error::internal("add_track after sample input"));
        }
        let id = config
            .track_id
            .unwrap_or(self.tracks.len() as u32 + 1);
        if self.tracks.iter().any(|t| t.id == id) {
            return Err(Error::param(format!("duplicate track id {id}")));
        }
        self.tracks
            .push(Track::new(id, info, config, &self.cfg.options));
        Ok(self.tracks.len() - 1)
    }

    /// Attach the caller's encryption primitive to a track configured
    /// with `EncOptions`.
    pub fn set_track_encryptor(
        &mut self,
        track_idx: usize,
        encryptor: Box<dyn BlockEncryptor>,
    ) -> Result<()> {
        let track = self
            .tracks
            .get_mut(track_idx)
            .ok_or_else(|| Error::param("no such track"))?;
        if track.enc_opts.is_none() {
            return Err(Error::param("track has no encryption options"));
        }
        track.encryptor = Some(encryptor);
        Ok(())
    }

    /// Inject an opaque atom into the movie-level `udta`.
    pub fn add_movie_udta_atom(&mut self, atom: Vec<u8>) {
        self.udta.movie_atoms.push(atom);
    }

    /// Attach a `meta` box (handler, optional XML document, items) to
    /// the movie-level `udta`.
    pub fn add_movie_meta(&mut self, meta: &crate::boxes::meta::MetaData) {
        let mut buf = BytesMut::new();
        crate::boxes::meta::write_meta(&mut buf, meta);
        self.udta.movie_atoms.push(buf.to_vec());
    }

    /// Inject an opaque atom into one track's `udta`.
    pub fn add_track_udta_atom(&mut self, track_idx: usize, atom: Vec<u8>) -> Result<()> {
        let id = self
            .tracks
            .get(track_idx)
            .ok_or_else(|| Error::param("no such track"))?
            .id;
        self.udta.track_atoms.push((id, atom));
        Ok(())
    }

    /// Accept one sample for a track; samples must arrive in DTS order
    /// per track, inter-track ordering is free.
    pub fn input_sample(&mut self, track_idx: usize, sample: &Sample) -> Result<()> {
        if self.state == MuxState::Done {
            return Err(Error::internal("input_sample after output"));
        }
        self.state = MuxState::Populated;
        let track = self
            .tracks
            .get_mut(track_idx)
            .ok_or_else(|| Error::param("no such track"))?;
        track.add_sample(sample)
    }

    /// Push an explicit edit-list entry for a track.
    pub fn add_track_edit(&mut self, track_idx: usize, duration: u64, media_time: i64) -> Result<()> {
        let track = self
            .tracks
            .get_mut(track_idx)
            .ok_or_else(|| Error::param("no such track"))?;
        track.add_edit(duration, media_time);
        Ok(())
    }

    /// Finish a track: record the parser's final stream info and DSI
    /// list.
    pub fn finish_track(
        &mut self,
        track_idx: usize,
        info: StreamInfo,
        dsi: Vec<DsiEntry>,
    ) -> Result<()> {
        let track = self
            .tracks
            .get_mut(track_idx)
            .ok_or_else(|| Error::param("no such track"))?;
        track.info = info.clone();
        track.attach_dsi(dsi)?;
        for entry in &mut track.stsd_lst {
            entry.info = info.clone();
        }
        Ok(())
    }

    /// Pre-write finalization of every track.
    fn setup_muxer(&mut self) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(Error::EmptyStream);
        }
        self.movie_timescale = self
            .cfg
            .movie_timescale
            .unwrap_or(self.tracks[0].media_timescale);
        if self.movie_timescale == 0 {
            return Err(Error::param("movie timescale is zero"));
        }
        let movie_timescale = self.movie_timescale;
        for track in &mut self.tracks {
            calculate_bitrate(track);
            track.setup(movie_timescale)?;
        }
        Ok(())
    }

    fn grow_scratch(&mut self, needed: usize) {
        if self.scratch.len() < needed {
            let rounded = needed.div_ceil(SCRATCH_GRANULARITY) * SCRATCH_GRANULARITY;
            self.scratch.resize(rounded, 0);
        }
    }

    /// Write the file and return the sink.
    pub fn output(mut self) -> Result<W> {
        if self.state != MuxState::Populated {
            return Err(Error::internal("output without samples"));
        }
        self.setup_muxer()?;
        if self.cfg.frag.is_some() {
            self.output_fragmented()?;
        } else {
            self.output_classical()?;
        }
        self.state = MuxState::Done;
        self.sink.flush()?;
        Ok(self.sink)
    }

    /// Write only the initialization segment of a fragmented movie
    /// (`ftyp` + `moov` with `mvex` and empty sample tables) and return
    /// the sink. The fragments themselves are produced by a separate
    /// mux run per segment.
    pub fn output_init_segment(mut self) -> Result<W> {
        if self.state != MuxState::Populated {
            return Err(Error::internal("output without samples"));
        }
        if self.cfg.frag.is_none() {
            return Err(Error::param("init segments require fragmented options"));
        }
        self.setup_muxer()?;
        let mut head = BytesMut::new();
        self.write_head_prefix(&mut head);
        write_moov(
            &mut head,
            &self.cfg,
            &self.tracks,
            self.movie_timescale,
            false,
            &self.udta,
        );
        self.sink.write_all(&head)?;
        self.state = MuxState::Done;
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn movie_avg_bitrate(&self) -> u32 {
        self.tracks.iter().map(|t| t.info.bit_rate).sum()
    }

    fn movie_duration_secs(&self) -> u64 {
        let d = self
            .tracks
            .iter()
            .map(|t| t.presentation_duration())
            .max()
            .unwrap_or(0);
        d / self.movie_timescale.max(1) as u64
    }

    /// Pre-`moov` boxes shared by both output shapes.
    fn write_head_prefix(&self, buf: &mut BytesMut) {
        write_ftyp(buf, &self.cfg);
        if self.cfg.options.free_box_size > 0 {
            write_free(buf, self.cfg.options.free_box_size);
        }
        if self.cfg.options.write_pdin {
            write_pdin(buf, self.movie_avg_bitrate(), self.movie_duration_secs());
        }
        if self.cfg.options.write_bloc {
            write_bloc(buf, "");
        }
        if self.cfg.options.write_ainf {
            write_ainf(buf, "");
        }
    }

    // ----- classical (moov + mdat) -------------------------------------

    fn output_classical(&mut self) -> Result<()> {
        if self.tracks.iter().any(|t| t.enc_opts.is_some()) {
            return Err(Error::param(
                "encryption requires fragmented output",
            ));
        }

        // assemble the head; upgrade to co64 when the chunk offsets
        // would not fit 32 bits
        let total_mdat: u64 = self.tracks.iter().map(|t| t.mdat_size).sum();
        let mut co64 = self.cfg.options.co64;
        let (head, patches) = loop {
            let mut buf = BytesMut::new();
            self.write_head_prefix(&mut buf);
            let patches = write_moov(
                &mut buf,
                &self.cfg,
                &self.tracks,
                self.movie_timescale,
                co64,
                &self.udta,
            );
            let mdat_start = buf.len() as u64;
            let needs_co64 =
                mdat_start + mdat_header_size(total_mdat) + total_mdat > u32::MAX as u64;
            if needs_co64 && !co64 {
                co64 = true;
                continue;
            }
            break (buf, patches);
        };

        let mdat_start = head.len() as u64;
        self.sink.write_all(&head)?;
        self.sink.write_all(&mdat_header(total_mdat))?;

        // interleave chunks smallest-dts-first and record offsets
        let mut cursors = vec![0usize; self.tracks.len()];
        let mut offsets: Vec<Vec<u64>> = vec![Vec::new(); self.tracks.len()];
        let mut pos = mdat_start + mdat_header_size(total_mdat);
        let mut current_out = 0u64;

        loop {
            // rule (a): any track with a chunk due at or before the
            // current output time; else (b) the smallest pending dts
            let mut pick: Option<(usize, u64)> = None;
            for (i, track) in self.tracks.iter().enumerate() {
                if let Some(chunk) = track.chunk_lst.get(cursors[i]) {
                    let dts = rescale_u64(chunk.dts, self.movie_timescale, track.media_timescale);
                    if dts <= current_out {
                        pick = Some((i, dts));
                        break;
                    }
                    match pick {
                        Some((_, best)) if best <= dts => {}
                        _ => pick = Some((i, dts)),
                    }
                }
            }
            let Some((i, dts)) = pick else { break };
            current_out = current_out.max(dts);

            let chunk = self.tracks[i].chunk_lst[cursors[i]];
            let needed = chunk.size as usize;
            self.grow_scratch(needed);
            let mut buf = std::mem::take(&mut self.scratch);
            self.tracks[i].read_samples_into(
                chunk.first_sample,
                chunk.sample_count,
                &mut buf[..needed],
            )?;
            self.sink.write_all(&buf[..needed])?;
            self.scratch = buf;

            offsets[i].push(pos);
            pos += chunk.size;
            cursors[i] += 1;
        }

        // re-emit the chunk-offset tables with real values
        self.patch_stco(&patches, &offsets)?;
        self.sink.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn patch_stco(&mut self, patches: &[StcoPatch], offsets: &[Vec<u64>]) -> Result<()> {
        for (patch, track_offsets) in patches.iter().zip(offsets) {
            if patch.chunk_count as usize != track_offsets.len() {
                return Err(Error::internal("chunk count diverged during mdat write"));
            }
            self.sink.seek(SeekFrom::Start(patch.buf_offset as u64))?;
            let mut buf = Vec::with_capacity(track_offsets.len() * 8);
            for &off in track_offsets {
                if patch.co64 {
                    buf.extend_from_slice(&off.to_be_bytes());
                } else {
                    if off > u32::MAX as u64 {
                        return Err(Error::param(
                            "32-bit chunk offsets requested but the movie needs 64-bit",
                        ));
                    }
                    buf.extend_from_slice(&(off as u32).to_be_bytes());
                }
            }
            self.sink.write_all(&buf)?;
        }
        Ok(())
    }

    // ----- fragmented (moof + mdat) ------------------------------------

    fn output_fragmented(&mut self) -> Result<()> {
        let frag = self.cfg.frag.clone().unwrap();
        create_fragment_list(&mut self.tracks, &frag)?;

        let mut head = BytesMut::new();
        self.write_head_prefix(&mut head);
        write_moov(
            &mut head,
            &self.cfg,
            &self.tracks,
            self.movie_timescale,
            false,
            &self.udta,
        );
        self.sink.write_all(&head)?;
        let mut pos = head.len() as u64;

        // reserve one sidx per track, back-patched at the end
        struct SidxSlot {
            track_idx: usize,
            file_offset: u64,
            version: u8,
            entries: Vec<SidxEntry>,
            first_moof_offset: u64,
            earliest_dts: u64,
        }
        let mut sidx_slots: Vec<SidxSlot> = Vec::new();
        if frag.write_sidx {
            for (i, track) in self.tracks.iter().enumerate() {
                let version = if track.media_duration > u32::MAX as u64 {
                    1
                } else {
                    0
                };
                let count = track.segment_lst.len();
                let mut dummy = BytesMut::new();
                write_sidx(
                    &mut dummy,
                    track.id,
                    track.media_timescale,
                    version,
                    0,
                    0,
                    &vec![SidxEntry::default(); count],
                );
                self.sink.write_all(&dummy)?;
                sidx_slots.push(SidxSlot {
                    track_idx: i,
                    file_offset: pos,
                    version,
                    entries: Vec::with_capacity(count),
                    first_moof_offset: 0,
                    earliest_dts: 0,
                });
                pos += dummy.len() as u64;
            }
        }

        // emit fragments in start-time order across tracks
        let mut cursors = vec![0usize; self.tracks.len()];
        loop {
            let mut pick: Option<(usize, u64)> = None;
            for (i, track) in self.tracks.iter().enumerate() {
                if let Some(&(start, _)) = track.segment_lst.get(cursors[i]) {
                    let dts = track
                        .dts_lst
                        .get(start as usize)
                        .map(|e| e.dts)
                        .unwrap_or(0);
                    let movie_dts =
                        rescale_u64(dts, self.movie_timescale, track.media_timescale);
                    match pick {
                        Some((_, best)) if best <= movie_dts => {}
                        _ => pick = Some((i, movie_dts)),
                    }
                }
            }
            let Some((i, _)) = pick else { break };
            let seg = self.tracks[i].segment_lst[cursors[i]];
            cursors[i] += 1;

            let (written, moof_offset, duration) = self.emit_fragment(i, seg, &frag, pos)?;
            if let Some(slot) = sidx_slots.iter_mut().find(|s| s.track_idx == i) {
                if slot.entries.is_empty() {
                    slot.first_moof_offset = moof_offset;
                    slot.earliest_dts = self.tracks[i]
                        .dts_lst
                        .get(seg.0 as usize)
                        .map(|e| e.dts)
                        .unwrap_or(0);
                }
                slot.entries.push(SidxEntry {
                    referenced_size: written as u32,
                    subsegment_duration: duration as u32,
                    starts_with_sap: true,
                    sap_type: 1,
                });
            }
            pos += written;
        }

        // random-access tail
        if frag.write_mfra || frag.force_tfra {
            let mut buf = BytesMut::new();
            let mut per_track: Vec<(u32, &[TfraEntry])> = self
                .tracks
                .iter()
                .map(|t| (t.id, t.tfra_entries.as_slice()))
                .collect();
            per_track.sort_by_key(|(id, _)| *id);
            write_mfra(&mut buf, &per_track);
            self.sink.write_all(&buf)?;
            pos += buf.len() as u64;
        }

        // sidx back-patch with real sizes and durations
        for slot in &sidx_slots {
            let track = &self.tracks[slot.track_idx];
            let sidx_end =
                slot.file_offset + crate::boxes::frag::sidx_size(slot.version, slot.entries.len() as u32);
            let first_offset = slot.first_moof_offset.saturating_sub(sidx_end);
            let mut buf = BytesMut::new();
            write_sidx(
                &mut buf,
                track.id,
                track.media_timescale,
                slot.version,
                slot.earliest_dts,
                first_offset,
                &slot.entries,
            );
            self.sink.seek(SeekFrom::Start(slot.file_offset))?;
            self.sink.write_all(&buf)?;
        }
        self.sink.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Emit one `moof + mdat` pair (preceded by `styp` when enabled).
    /// Returns `(bytes_written, moof_file_offset, fragment_duration)`.
    fn emit_fragment(
        &mut self,
        track_idx: usize,
        seg: (u32, u32),
        frag: &FragOptions,
        file_pos: u64,
    ) -> Result<(u64, u64, u64)> {
        self.sequence_number += 1;
        let sequence_number = self.sequence_number;

        let mut styp = BytesMut::new();
        if frag.write_styp {
            write_styp(&mut styp, &self.cfg);
        }
        let moof_file_offset = file_pos + styp.len() as u64;

        let plan = prepare_traf(&self.tracks[track_idx], frag, seg);

        // payload, encrypted in place when the track is protected
        let track = &mut self.tracks[track_idx];
        let payload_len: usize = plan.rows.iter().map(|r| r.size as usize).sum();
        let mut payload = track.read_samples(seg.0, plan.count)?;
        if payload.len() != payload_len {
            return Err(Error::internal("fragment payload size mismatch"));
        }

        let mut enc_infos = Vec::new();
        if let Some(enc) = track.encryptor.as_deref_mut() {
            let mut off = 0usize;
            for i in seg.0..seg.0 + plan.count {
                let size = track.size_lst.value_at(i as u64).unwrap_or(0) as usize;
                let subs = &track.subs_lst[i as usize];
                let info = encrypt_sample(enc, &mut payload[off..off + size], subs);
                off += size;
                enc_infos.push(info);
            }
            track.enc_info_lst.extend(enc_infos.iter().cloned());
        }

        // assemble moof
        let mut moof = BytesMut::new();
        let moof_start = box_start(&mut moof, b"moof");
        write_mfhd(&mut moof, sequence_number);

        let traf_start = box_start(&mut moof, b"traf");
        let bdo_patch = write_tfhd(&mut moof, &plan.tfhd);
        if frag.write_tfdt {
            write_tfdt(&mut moof, plan.start_dts);
        }
        let data_offset_patch = write_trun(&mut moof, &plan.trun, &plan.rows);

        if frag.write_sdtp && !track.sdtp_lst.is_empty() {
            let slice = &track.sdtp_lst[seg.0 as usize..(seg.0 + plan.count) as usize];
            write_sdtp_entries(&mut moof, slice);
        }

        let subs_rows: Vec<(u32, &[u32])> = (seg.0..seg.0 + plan.count)
            .filter(|&i| !track.subs_lst[i as usize].is_empty())
            .map(|i| (i - seg.0, track.subs_lst[i as usize].as_slice()))
            .collect();
        if !subs_rows.is_empty() {
            write_subs(&mut moof, &subs_rows, self.cfg.options.subs_v1);
        }

        if frag.write_trik {
            let entries = &track.trik_lst[seg.0 as usize..(seg.0 + plan.count) as usize];
            write_trik(&mut moof, entries, plan.count as usize);
        }
        if frag.write_avcn {
            if let Some(avcc) = track
                .stsd_lst
                .first()
                .and_then(|e| e.dsi.iter().find(|d| d.tag.as_bytes() == b"avcC"))
            {
                write_avcn(&mut moof, &avcc.data);
            }
        }

        let mut saio_patch = None;
        let mut senc_payload_off = 0usize;
        if !enc_infos.is_empty() && frag.write_senc {
            let style = track.enc_opts.as_ref().map(|e| e.style).unwrap_or_default();
            // PIFF carries only the uuid-wrapped senc, no aux-info boxes
            if style != EncStyle::Piff {
                write_saiz(&mut moof, &enc_infos);
                saio_patch = Some(write_saio(&mut moof));
            }
            senc_payload_off = write_senc(&mut moof, &enc_infos, style);
        }

        box_end(&mut moof, traf_start);
        box_end(&mut moof, moof_start);

        // back-patch offsets now that the moof size is known
        let hdr_size = mdat_header_size(payload.len() as u64);
        if let Some(at) = data_offset_patch {
            if plan.trun.tr_flags & TR_DATA_OFFSET != 0 {
                let data_offset = moof.len() as u64 + hdr_size;
                patch_u32(&mut moof, at, data_offset as u32);
            }
        }
        if let Some(at) = bdo_patch {
            if plan.tfhd.tf_flags & TF_BASE_DATA_OFFSET != 0 {
                let bdo = moof_file_offset + moof.len() as u64 + hdr_size;
                patch_u64(&mut moof, at, bdo);
            }
        }
        if let Some(at) = saio_patch {
            // offset of the senc payload, moof-relative under
            // default-base-is-moof, absolute otherwise
            let value = if frag.default_base_is_moof || frag.no_bdo_in_tfhd {
                senc_payload_off as u64
            } else {
                moof_file_offset + senc_payload_off as u64
            };
            patch_u32(&mut moof, at, value as u32);
        }

        // random access bookkeeping
        let entries = track.dts_lst.entries();
        if frag.one_tfra_entry_per_traf || track.all_rap_samples {
            let e = entries[seg.0 as usize];
            track.tfra_entries.push(TfraEntry {
                time: e.dts,
                moof_offset: moof_file_offset,
                traf_number: 1,
                trun_number: 1,
                sample_number: 1,
            });
        } else {
            for (n, i) in (seg.0..seg.0 + plan.count).enumerate() {
                if track.sync_lst.dts_of(i).is_some() {
                    track.tfra_entries.push(TfraEntry {
                        time: entries[i as usize].dts,
                        moof_offset: moof_file_offset,
                        traf_number: 1,
                        trun_number: 1,
                        sample_number: n as u32 + 1,
                    });
                }
            }
        }

        self.sink.write_all(&styp)?;
        self.sink.write_all(&moof)?;
        self.sink.write_all(&mdat_header(payload.len() as u64))?;
        self.sink.write_all(&payload)?;

        let written =
            styp.len() as u64 + moof.len() as u64 + hdr_size + payload.len() as u64;
        let duration = plan.end_dts - plan.start_dts;
        Ok((written, moof_file_offset, duration))
    }
}
