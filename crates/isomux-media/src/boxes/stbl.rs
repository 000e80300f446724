//! Sample-table box writers: `stsd` with typed sample entries and
//! codec sub-boxes, and the compressed tables produced by the
//! sample-table encoder.

use bytes::{BufMut, BytesMut};

use isomux_common::{FourCc, StreamKind};

use super::enc::write_sinf;
use super::{box_end, box_start, full_box_start};
use crate::config::MuxOptions;
use crate::sample_table::{stsc_rows, stts_rows};
use crate::track::{StsdEntry, Track};

/// Where a `stco`/`co64` entry array sits in the assembled buffer, for
/// offset back-patching after `mdat` is written.
#[derive(Debug, Clone, Copy)]
pub struct StcoPatch {
    pub buf_offset: usize,
    pub co64: bool,
    pub chunk_count: u32,
}

/// MPEG-4 descriptor tags.
const ES_DESCR_TAG: u8 = 0x03;
const DECODER_CONFIG_DESCR_TAG: u8 = 0x04;
const DEC_SPECIFIC_INFO_TAG: u8 = 0x05;
const SL_CONFIG_DESCR_TAG: u8 = 0x06;

/// Size of a descriptor including its tag and expandable length field.
fn descriptor_size(content_size: u32) -> u32 {
    if content_size < 128 {
        return 1 + 1 + content_size;
    }
    let mut u = 2;
    while content_size >> (7 * u) != 0 {
        u += 1;
    }
    u + 1 + content_size
}

/// Descriptor tag plus MPEG-4 expandable length (continuation high bit
/// set until the last byte).
fn write_descriptor_hdr(buf: &mut BytesMut, tag: u8, content_size: u32) {
    let mut bytes_more = descriptor_size(content_size) - content_size - 2;
    buf.put_u8(tag);
    while bytes_more > 0 {
        buf.put_u8(((content_size >> (7 * bytes_more)) | 0x80) as u8);
        bytes_more -= 1;
    }
    buf.put_u8((content_size & 0x7f) as u8);
}

/// `esds`: ES_Descr -> DecoderConfigDescr (OTI, stream type, buffer,
/// bitrates) -> DecSpecificInfo (the DSI bytes) -> SLConfigDescr.
pub fn write_esds(buf: &mut BytesMut, entry: &StsdEntry, dsi: &[u8]) {
    let info = &entry.info;
    let esds = full_box_start(buf, b"esds", 0, 0);

    let dsi_descriptor_size = if dsi.is_empty() {
        0
    } else {
        descriptor_size(dsi.len() as u32)
    };

    write_descriptor_hdr(
        buf,
        ES_DESCR_TAG,
        3 + descriptor_size(13 + dsi_descriptor_size) + descriptor_size(1),
    );
    buf.put_u16(0); // ES_ID
    buf.put_u8(0); // flags

    write_descriptor_hdr(buf, DECODER_CONFIG_DESCR_TAG, 13 + dsi_descriptor_size);
    buf.put_u8(info.object_type_indication);
    if info.kind.is_audio() {
        buf.put_u8((0x05 << 2) | 0x01);
    } else {
        buf.put_u8((0x04 << 2) | 0x01);
    }
    // bufferSizeDB in bytes, 24 bits
    let buffer_bytes = info.buffer_size_db >> 3;
    buf.put_u8((buffer_bytes >> 16) as u8);
    buf.put_u16((buffer_bytes & 0xffff) as u16);
    buf.put_u32(info.bit_rate.max(info.max_bit_rate));
    buf.put_u32(info.bit_rate);

    if !dsi.is_empty() {
        write_descriptor_hdr(buf, DEC_SPECIFIC_INFO_TAG, dsi.len() as u32);
        buf.put_slice(dsi);
    }

    write_descriptor_hdr(buf, SL_CONFIG_DESCR_TAG, 1);
    buf.put_u8(0x02); // MP4 file

    box_end(buf, esds);
}

fn write_pasp(buf: &mut BytesMut, par: (u32, u32)) {
    let pasp = box_start(buf, b"pasp");
    buf.put_u32(par.0);
    buf.put_u32(par.1);
    box_end(buf, pasp);
}

fn write_colr(buf: &mut BytesMut, colour: (u16, u16, u16)) {
    let colr = box_start(buf, b"colr");
    buf.put_slice(b"nclc");
    buf.put_u16(colour.0);
    buf.put_u16(colour.1);
    buf.put_u16(colour.2);
    box_end(buf, colr);
}

/// Codec-configuration child boxes from the entry's DSI list.
fn write_dsi_boxes(buf: &mut BytesMut, entry: &StsdEntry) {
    for dsi in &entry.dsi {
        if dsi.tag == FourCc::new(b"esds") {
            write_esds(buf, entry, &dsi.data);
        } else {
            let b = box_start(buf, dsi.tag.as_bytes());
            buf.put_slice(&dsi.data);
            box_end(buf, b);
        }
    }
}

fn write_visual_entry(buf: &mut BytesMut, track: &Track, entry: &StsdEntry) {
    let encrypted = track.enc_opts.is_some();
    let coding: &[u8; 4] = if encrypted {
        b"encv"
    } else {
        entry.info.coding_name.as_bytes()
    };
    let start = box_start(buf, coding);

    buf.put_slice(&[0u8; 6]); // reserved
    buf.put_u16(1); // data_reference_index
    buf.put_u16(0); // pre_defined
    buf.put_u16(0); // reserved
    buf.put_slice(&[0u8; 12]); // pre_defined
    buf.put_u16(entry.info.width as u16);
    buf.put_u16(entry.info.height as u16);
    buf.put_u32(0x0048_0000); // horiz resolution 72 dpi
    buf.put_u32(0x0048_0000); // vert resolution 72 dpi
    buf.put_u32(0); // reserved
    buf.put_u16(1); // frame_count
    buf.put_slice(&[0u8; 32]); // compressor name
    buf.put_u16(0x0018); // depth
    buf.put_i16(-1); // pre_defined

    if entry.info.par != (0, 0) {
        write_pasp(buf, entry.info.par);
    }
    write_dsi_boxes(buf, entry);
    if let Some(colour) = entry.info.colour {
        write_colr(buf, colour);
    }
    if let Some(enc) = &track.enc_opts {
        write_sinf(buf, entry.info.coding_name.as_bytes(), enc);
    }

    box_end(buf, start);
}

fn write_audio_entry(buf: &mut BytesMut, track: &Track, entry: &StsdEntry) {
    let encrypted = track.enc_opts.is_some();
    let coding: &[u8; 4] = if encrypted {
        b"enca"
    } else {
        entry.info.coding_name.as_bytes()
    };
    let start = box_start(buf, coding);

    buf.put_slice(&[0u8; 6]); // reserved
    buf.put_u16(1); // data_reference_index
    buf.put_u32(0); // reserved
    buf.put_u32(0); // reserved
    buf.put_u16(entry.info.channel_count);
    buf.put_u16(16); // sample size
    buf.put_u16(0); // pre_defined
    buf.put_u16(0); // reserved
    buf.put_u32(entry.info.sample_rate << 16);

    write_dsi_boxes(buf, entry);
    if let Some(enc) = &track.enc_opts {
        write_sinf(buf, entry.info.coding_name.as_bytes(), enc);
    }

    box_end(buf, start);
}

fn write_plain_entry(buf: &mut BytesMut, entry: &StsdEntry) {
    let start = box_start(buf, entry.info.coding_name.as_bytes());
    buf.put_slice(&[0u8; 6]); // reserved
    buf.put_u16(1); // data_reference_index
    for dsi in &entry.dsi {
        buf.put_slice(&dsi.data);
    }
    box_end(buf, start);
}

pub fn write_stsd(buf: &mut BytesMut, track: &Track) {
    let stsd = full_box_start(buf, b"stsd", 0, 0);
    buf.put_u32(track.stsd_lst.len() as u32);
    for entry in &track.stsd_lst {
        match entry.info.kind {
            StreamKind::Video => write_visual_entry(buf, track, entry),
            StreamKind::Audio => write_audio_entry(buf, track, entry),
            _ => write_plain_entry(buf, entry),
        }
    }
    box_end(buf, stsd);
}

fn write_stts(buf: &mut BytesMut, track: &Track) {
    let rows = stts_rows(track);
    let stts = full_box_start(buf, b"stts", 0, 0);
    buf.put_u32(rows.len() as u32);
    for (count, delta) in rows {
        buf.put_u32(count);
        buf.put_u32(delta);
    }
    box_end(buf, stts);
}

fn write_ctts(buf: &mut BytesMut, track: &Track) {
    let version = if track.uses_ctts_v1() { 1 } else { 0 };
    let ctts = full_box_start(buf, b"ctts", version, 0);
    buf.put_u32(track.cts_offset_lst.run_count() as u32);
    for run in track.cts_offset_lst.runs() {
        buf.put_u32(run.count);
        if version == 1 {
            buf.put_i32(run.value as i32);
        } else {
            buf.put_u32(run.value as u32);
        }
    }
    box_end(buf, ctts);
}

fn write_stss(buf: &mut BytesMut, track: &Track) {
    let stss = full_box_start(buf, b"stss", 0, 0);
    buf.put_u32(track.sync_lst.len() as u32);
    for e in track.sync_lst.entries() {
        buf.put_u32(e.idx + 1);
    }
    box_end(buf, stss);
}

fn write_stsz(buf: &mut BytesMut, track: &Track) {
    let stsz = full_box_start(buf, b"stsz", 0, 0);
    if track.all_same_size_samples {
        buf.put_u32(track.size_lst.value_at(0).unwrap_or(0));
        buf.put_u32(track.sample_num);
    } else {
        buf.put_u32(0);
        buf.put_u32(track.sample_num);
        for size in track.size_lst.iter() {
            buf.put_u32(size);
        }
    }
    box_end(buf, stsz);
}

fn write_stsc(buf: &mut BytesMut, track: &Track) {
    let rows = stsc_rows(&track.chunk_lst);
    let stsc = full_box_start(buf, b"stsc", 0, 0);
    buf.put_u32(rows.len() as u32);
    for (first, spc, sdi) in rows {
        buf.put_u32(first);
        buf.put_u32(spc);
        buf.put_u32(sdi);
    }
    box_end(buf, stsc);
}

/// Chunk-offset table with zeroed entries; real offsets are patched in
/// once `mdat` is written.
fn write_stco(buf: &mut BytesMut, track: &Track, co64: bool) -> StcoPatch {
    let fourcc: &[u8; 4] = if co64 { b"co64" } else { b"stco" };
    let stco = full_box_start(buf, fourcc, 0, 0);
    let count = track.chunk_lst.len() as u32;
    buf.put_u32(count);
    let patch_at = buf.len();
    for _ in 0..count {
        if co64 {
            buf.put_u64(0);
        } else {
            buf.put_u32(0);
        }
    }
    box_end(buf, stco);
    StcoPatch {
        buf_offset: patch_at,
        co64,
        chunk_count: count,
    }
}

pub fn write_sdtp(buf: &mut BytesMut, track: &Track) {
    write_sdtp_entries(buf, &track.sdtp_lst);
}

/// `sdtp` over an explicit slice of rows (also used fragment-locally).
pub fn write_sdtp_entries(buf: &mut BytesMut, entries: &[crate::track::SdtpEntry]) {
    let sdtp = full_box_start(buf, b"sdtp", 0, 0);
    for e in entries {
        buf.put_u8(e.byte());
    }
    box_end(buf, sdtp);
}

/// `subs` over the whole track: only samples with real subdivisions get
/// entries.
pub fn write_subs(buf: &mut BytesMut, rows: &[(u32, &[u32])], v1: bool) {
    let version = if v1 { 1 } else { 0 };
    let subs = full_box_start(buf, b"subs", version, 0);
    buf.put_u32(rows.len() as u32);
    let mut prev = 0u32;
    for (sample_idx, sizes) in rows {
        buf.put_u32(sample_idx + 1 - prev); // sample_delta, 1-based chain
        prev = sample_idx + 1;
        buf.put_u16(sizes.len() as u16);
        for s in *sizes {
            if v1 {
                buf.put_u32(*s);
            } else {
                buf.put_u16((*s).min(u16::MAX as u32) as u16);
            }
            buf.put_u8(0); // subsample_priority
            buf.put_u8(0); // discardable
            buf.put_u32(0); // codec_specific_parameters
        }
    }
    box_end(buf, subs);
}

/// The full `stbl` for classical output. Returns the chunk-offset
/// patch descriptor.
pub fn write_stbl(buf: &mut BytesMut, track: &Track, opts: &MuxOptions, co64: bool) -> StcoPatch {
    let stbl = box_start(buf, b"stbl");
    write_stsd(buf, track);
    write_stts(buf, track);
    if !track.no_cts_offset {
        write_ctts(buf, track);
    }
    if opts.write_stss && !track.all_rap_samples {
        write_stss(buf, track);
    }
    if !track.sdtp_lst.is_empty() && track.info.kind.is_video() {
        write_sdtp(buf, track);
    }
    write_stsz(buf, track);
    write_stsc(buf, track);
    let patch = write_stco(buf, track, co64);
    let subs_rows: Vec<(u32, &[u32])> = track
        .subs_lst
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_empty())
        .map(|(i, v)| (i as u32, v.as_slice()))
        .collect();
    if !subs_rows.is_empty() {
        write_subs(buf, &subs_rows, opts.subs_v1);
    }
    box_end(buf, stbl);
    patch
}

/// Empty sample tables for a fragmented init segment.
pub fn write_empty_stbl(buf: &mut BytesMut, track: &Track) {
    let stbl = box_start(buf, b"stbl");
    write_stsd(buf, track);
    for fourcc in [b"stts", b"stsc"] {
        let b = full_box_start(buf, fourcc, 0, 0);
        buf.put_u32(0);
        box_end(buf, b);
    }
    let stsz = full_box_start(buf, b"stsz", 0, 0);
    buf.put_u32(0);
    buf.put_u32(0);
    box_end(buf, stsz);
    let stco = full_box_start(buf, b"stco", 0, 0);
    buf.put_u32(0);
    box_end(buf, stco);
    box_end(buf, stbl);
}
