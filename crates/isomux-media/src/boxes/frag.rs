//! Fragment box writers: `mfhd`, `tfhd`, `tfdt`, `trun`, `trik`,
//! `avcn`, `sidx`, and the `mfra`/`tfra`/`mfro` random-access tail.

use bytes::{BufMut, BytesMut};

use super::{box_end, box_start, full_box_start};
use crate::track::{TfraEntry, TrikEntry};

// tfhd tf_flags
pub const TF_BASE_DATA_OFFSET: u32 = 0x0000_0001;
pub const TF_SAMPLE_DESCRIPTION_INDEX: u32 = 0x0000_0002;
pub const TF_DEFAULT_SAMPLE_DURATION: u32 = 0x0000_0008;
pub const TF_DEFAULT_SAMPLE_SIZE: u32 = 0x0000_0010;
pub const TF_DEFAULT_SAMPLE_FLAGS: u32 = 0x0000_0020;
pub const TF_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;

// trun tr_flags
pub const TR_DATA_OFFSET: u32 = 0x0000_0001;
pub const TR_FIRST_FLAGS: u32 = 0x0000_0004;
pub const TR_SAMPLE_DURATION: u32 = 0x0000_0100;
pub const TR_SAMPLE_SIZE: u32 = 0x0000_0200;
pub const TR_SAMPLE_FLAGS: u32 = 0x0000_0400;
pub const TR_CTS_OFFSETS: u32 = 0x0000_0800;

pub fn write_mfhd(buf: &mut BytesMut, sequence_number: u32) {
    let mfhd = full_box_start(buf, b"mfhd", 0, 0);
    buf.put_u32(sequence_number);
    box_end(buf, mfhd);
}

/// Assembled `tfhd` parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TfhdInfo {
    pub track_id: u32,
    pub tf_flags: u32,
    pub base_data_offset: u64,
    pub sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

/// Write `tfhd`; when `BASE_DATA_OFFSET` is set, the 8 offset bytes are
/// written as zero and their buffer position is returned for patching.
pub fn write_tfhd(buf: &mut BytesMut, info: &TfhdInfo) -> Option<usize> {
    let tfhd = full_box_start(buf, b"tfhd", 0, info.tf_flags);
    buf.put_u32(info.track_id);
    let mut bdo_patch = None;
    if info.tf_flags & TF_BASE_DATA_OFFSET != 0 {
        bdo_patch = Some(buf.len());
        buf.put_u64(info.base_data_offset);
    }
    if info.tf_flags & TF_SAMPLE_DESCRIPTION_INDEX != 0 {
        buf.put_u32(info.sample_description_index);
    }
    if info.tf_flags & TF_DEFAULT_SAMPLE_DURATION != 0 {
        buf.put_u32(info.default_sample_duration);
    }
    if info.tf_flags & TF_DEFAULT_SAMPLE_SIZE != 0 {
        buf.put_u32(info.default_sample_size);
    }
    if info.tf_flags & TF_DEFAULT_SAMPLE_FLAGS != 0 {
        buf.put_u32(info.default_sample_flags);
    }
    box_end(buf, tfhd);
    bdo_patch
}

pub fn write_tfdt(buf: &mut BytesMut, base_media_decode_time: u64) {
    let version = if base_media_decode_time > u32::MAX as u64 {
        1
    } else {
        0
    };
    let tfdt = full_box_start(buf, b"tfdt", version, 0);
    if version == 1 {
        buf.put_u64(base_media_decode_time);
    } else {
        buf.put_u32(base_media_decode_time as u32);
    }
    box_end(buf, tfdt);
}

/// One `trun` row; which fields are emitted is governed by the flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrunRow {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub cts_offset: i64,
}

/// Assembled `trun` parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrunInfo {
    pub tr_flags: u32,
    pub version: u8,
    pub first_sample_flags: u32,
}

/// Write `trun`; when `DATA_OFFSET` is set, its buffer position is
/// returned for patching once the `moof` size is known.
pub fn write_trun(buf: &mut BytesMut, info: &TrunInfo, rows: &[TrunRow]) -> Option<usize> {
    let trun = full_box_start(buf, b"trun", info.version, info.tr_flags);
    buf.put_u32(rows.len() as u32);
    let mut offset_patch = None;
    if info.tr_flags & TR_DATA_OFFSET != 0 {
        offset_patch = Some(buf.len());
        buf.put_i32(0);
    }
    if info.tr_flags & TR_FIRST_FLAGS != 0 {
        buf.put_u32(info.first_sample_flags);
    }
    for row in rows {
        if info.tr_flags & TR_SAMPLE_DURATION != 0 {
            buf.put_u32(row.duration);
        }
        if info.tr_flags & TR_SAMPLE_SIZE != 0 {
            buf.put_u32(row.size);
        }
        if info.tr_flags & TR_SAMPLE_FLAGS != 0 {
            buf.put_u32(row.flags);
        }
        if info.tr_flags & TR_CTS_OFFSETS != 0 {
            if info.version == 0 {
                buf.put_u32(row.cts_offset.max(0) as u32);
            } else {
                buf.put_i32(row.cts_offset as i32);
            }
        }
    }
    box_end(buf, trun);
    offset_patch
}

/// CFF `trik` trick-play box: one byte per sample. The entry list and
/// the run's sample count must agree; a divergence is clamped and
/// logged rather than silently truncated.
pub fn write_trik(buf: &mut BytesMut, entries: &[TrikEntry], sample_count: usize) {
    if entries.len() != sample_count {
        tracing::warn!(
            entries = entries.len(),
            sample_count,
            "trik entry count does not match trun sample count"
        );
    }
    let trik = full_box_start(buf, b"trik", 0, 0);
    for e in entries.iter().take(sample_count) {
        buf.put_u8(((e.pic_type & 0x3) << 6) | (e.dependency_level & 0x3f));
    }
    box_end(buf, trik);
}

/// CFF `avcn`: an in-fragment copy of the decoder configuration for
/// trick-play.
pub fn write_avcn(buf: &mut BytesMut, avcc: &[u8]) {
    let avcn = box_start(buf, b"avcn");
    buf.put_slice(avcc);
    box_end(buf, avcn);
}

/// One `sidx` reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidxEntry {
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
}

/// Exact serialized size of a `sidx` with `count` references.
pub fn sidx_size(version: u8, count: u32) -> u64 {
    let time_fields = if version == 1 { 16 } else { 8 };
    12 + 4 + 4 + time_fields + 2 + 2 + 12 * count as u64
}

/// Serialize a complete `sidx`. Written once as a dummy of the exact
/// final size, then re-written in place when the real byte counts are
/// known.
pub fn write_sidx(
    buf: &mut BytesMut,
    reference_id: u32,
    timescale: u32,
    version: u8,
    earliest_presentation_time: u64,
    first_offset: u64,
    entries: &[SidxEntry],
) {
    let sidx = full_box_start(buf, b"sidx", version, 0);
    buf.put_u32(reference_id);
    buf.put_u32(timescale);
    if version == 1 {
        buf.put_u64(earliest_presentation_time);
        buf.put_u64(first_offset);
    } else {
        buf.put_u32(earliest_presentation_time as u32);
        buf.put_u32(first_offset as u32);
    }
    buf.put_u16(0); // reserved
    buf.put_u16(entries.len() as u16);
    for e in entries {
        buf.put_u32(e.referenced_size & 0x7fff_ffff); // reference_type 0
        buf.put_u32(e.subsegment_duration);
        let mut sap = 0u32;
        if e.starts_with_sap {
            sap |= 1 << 31;
        }
        sap |= ((e.sap_type as u32) & 0x7) << 28;
        buf.put_u32(sap);
    }
    box_end(buf, sidx);
}

/// `tfra` for one track; version picked from the largest time/offset.
pub fn write_tfra(buf: &mut BytesMut, track_id: u32, entries: &[TfraEntry]) {
    let version = if entries
        .iter()
        .any(|e| e.time > u32::MAX as u64 || e.moof_offset > u32::MAX as u64)
    {
        1
    } else {
        0
    };
    let tfra = full_box_start(buf, b"tfra", version, 0);
    buf.put_u32(track_id);
    buf.put_u32(0); // 1-byte traf/trun/sample number fields
    buf.put_u32(entries.len() as u32);
    for e in entries {
        if version == 1 {
            buf.put_u64(e.time);
            buf.put_u64(e.moof_offset);
        } else {
            buf.put_u32(e.time as u32);
            buf.put_u32(e.moof_offset as u32);
        }
        buf.put_u8(e.traf_number as u8);
        buf.put_u8(e.trun_number as u8);
        buf.put_u8(e.sample_number as u8);
    }
    box_end(buf, tfra);
}

/// `mfra` with one `tfra` per `(track, entries)` pair, ordered by
/// track id, closed by `mfro` carrying the total `mfra` size.
pub fn write_mfra(buf: &mut BytesMut, per_track: &[(u32, &[TfraEntry])]) {
    let mfra = box_start(buf, b"mfra");
    for (track_id, entries) in per_track {
        write_tfra(buf, *track_id, entries);
    }
    let mfro = full_box_start(buf, b"mfro", 0, 0);
    // mfra size including this mfro: current size + remaining 4 bytes
    let total = (buf.len() - mfra + 4) as u32;
    buf.put_u32(total);
    box_end(buf, mfro);
    box_end(buf, mfra);
}
