//! Movie-level box writers: `ftyp`/`styp`, `moov` and its children,
//! and the optional `pdin`/`bloc`/`ainf`/`free` boxes.

use bytes::{BufMut, BytesMut};

use isomux_common::StreamKind;

use super::stbl::{write_empty_stbl, write_stbl, StcoPatch};
use super::{box_end, box_start, full_box_start};
use crate::config::{MuxConfig, MuxOptions};
use crate::track::Track;

/// The identity transform, 16.16 / 2.30 fixed point.
const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

/// Pack an ISO-639-2/T code into the 15-bit `mdhd` field.
fn pack_language(lang: &[u8; 3]) -> u16 {
    let c = |b: u8| -> u16 { ((b.to_ascii_lowercase().saturating_sub(0x60)) as u16) & 0x1f };
    (c(lang[0]) << 10) | (c(lang[1]) << 5) | c(lang[2])
}

pub fn write_ftyp(buf: &mut BytesMut, cfg: &MuxConfig) {
    let ftyp = box_start(buf, b"ftyp");
    let major = cfg.major_brand.as_bytes();
    buf.put_slice(&major[..4.min(major.len())]);
    for _ in major.len()..4 {
        buf.put_u8(b' ');
    }
    buf.put_u32(cfg.minor_version);
    for brand in &cfg.compatible_brands {
        let b = brand.as_bytes();
        buf.put_slice(&b[..4.min(b.len())]);
        for _ in b.len()..4 {
            buf.put_u8(b' ');
        }
    }
    box_end(buf, ftyp);
}

/// `styp` for fragmented segments: same layout as `ftyp`.
pub fn write_styp(buf: &mut BytesMut, cfg: &MuxConfig) {
    let styp = box_start(buf, b"styp");
    let major = cfg.major_brand.as_bytes();
    buf.put_slice(&major[..4.min(major.len())]);
    for _ in major.len()..4 {
        buf.put_u8(b' ');
    }
    buf.put_u32(cfg.minor_version);
    for brand in &cfg.compatible_brands {
        let b = brand.as_bytes();
        buf.put_slice(&b[..4.min(b.len())]);
        for _ in b.len()..4 {
            buf.put_u8(b' ');
        }
    }
    box_end(buf, styp);
}

/// `free` padding box.
pub fn write_free(buf: &mut BytesMut, size: u32) {
    let total = size.max(8);
    let free = box_start(buf, b"free");
    for _ in 8..total {
        buf.put_u8(0);
    }
    box_end(buf, free);
}

/// `pdin`: a small progressive-download curve derived from the movie
/// bitrate: base/16, base/2, base, and 16x base when finite.
pub fn write_pdin(buf: &mut BytesMut, avg_bitrate: u32, duration_secs: u64) {
    let pdin = full_box_start(buf, b"pdin", 0, 0);
    let base = avg_bitrate.max(8) / 8; // bytes per second
    let mut rates = vec![base / 16, base / 2, base];
    if duration_secs > 0 {
        rates.push(base.saturating_mul(16));
    }
    for rate in rates {
        let rate = rate.max(1);
        // initial delay so the download finishes with playback
        let delay = if rate >= base {
            0
        } else {
            duration_secs.saturating_mul((base - rate) as u64) / rate as u64
        };
        buf.put_u32(rate);
        buf.put_u32(delay.min(u32::MAX as u64) as u32);
    }
    box_end(buf, pdin);
}

/// CFF `bloc` base-location box: 256-byte base location, 256-byte
/// purchase location, 512 reserved bytes.
pub fn write_bloc(buf: &mut BytesMut, base_location: &str) {
    let bloc = full_box_start(buf, b"bloc", 0, 0);
    let mut loc = [0u8; 256];
    let b = base_location.as_bytes();
    let n = b.len().min(255);
    loc[..n].copy_from_slice(&b[..n]);
    buf.put_slice(&loc);
    buf.put_slice(&[0u8; 256]); // purchase location
    buf.put_slice(&[0u8; 512]); // reserved
    box_end(buf, bloc);
}

/// CFF `ainf` asset-information box.
pub fn write_ainf(buf: &mut BytesMut, apid: &str) {
    let ainf = full_box_start(buf, b"ainf", 0, 0);
    buf.put_u32(0); // profile_version
    buf.put_slice(apid.as_bytes());
    buf.put_u8(0);
    box_end(buf, ainf);
}

/// `iods`: canonical MP4 initial object descriptor with unrestricted
/// profile indications.
pub fn write_iods(buf: &mut BytesMut, audio_profile: u8, video_profile: u8) {
    let iods = full_box_start(buf, b"iods", 0, 0);
    buf.put_u8(0x10); // MP4_IOD_Tag
    buf.put_u8(7); // length
    buf.put_u16(0x004f); // ObjectDescriptorID 1 + flags
    buf.put_u8(0xff); // OD profile
    buf.put_u8(0xff); // scene profile
    buf.put_u8(audio_profile);
    buf.put_u8(video_profile);
    buf.put_u8(0xff); // graphics profile
    box_end(buf, iods);
}

fn write_mvhd(buf: &mut BytesMut, timescale: u32, duration: u64, next_track_id: u32) {
    let version = if duration > u32::MAX as u64 { 1 } else { 0 };
    let mvhd = full_box_start(buf, b"mvhd", version, 0);
    if version == 1 {
        buf.put_u64(0); // creation_time
        buf.put_u64(0); // modification_time
        buf.put_u32(timescale);
        buf.put_u64(duration);
    } else {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(timescale);
        buf.put_u32(duration as u32);
    }
    buf.put_u32(0x0001_0000); // rate 1.0
    buf.put_u16(0x0100); // volume 1.0
    buf.put_u16(0); // reserved
    buf.put_u64(0); // reserved
    for v in UNITY_MATRIX {
        buf.put_u32(v);
    }
    buf.put_slice(&[0u8; 24]); // pre_defined
    buf.put_u32(next_track_id);
    box_end(buf, mvhd);
}

fn write_tkhd(buf: &mut BytesMut, track: &Track, duration: u64) {
    let version = if duration > u32::MAX as u64 { 1 } else { 0 };
    let tkhd = full_box_start(buf, b"tkhd", version, 7); // enabled, in movie, in preview
    if version == 1 {
        buf.put_u64(0);
        buf.put_u64(0);
        buf.put_u32(track.id);
        buf.put_u32(0);
        buf.put_u64(duration);
    } else {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(track.id);
        buf.put_u32(0);
        buf.put_u32(duration as u32);
    }
    buf.put_u64(0); // reserved
    buf.put_u16(0); // layer
    buf.put_u16(track.config.alternate_group);
    buf.put_u16(if track.info.kind.is_audio() { 0x0100 } else { 0 });
    buf.put_u16(0); // reserved

    // text tracks inject their translation into matrix columns 7 and 8
    let mut matrix = UNITY_MATRIX;
    if matches!(track.info.kind, StreamKind::Text | StreamKind::Subtitle) {
        matrix[6] = (track.config.translation.0 as i32 as u32) << 16;
        matrix[7] = (track.config.translation.1 as i32 as u32) << 16;
    }
    for v in matrix {
        buf.put_u32(v);
    }

    if track.info.kind.is_video() {
        buf.put_u32(track.info.width << 16);
        buf.put_u32(track.info.height << 16);
    } else {
        buf.put_u32(0);
        buf.put_u32(0);
    }
    box_end(buf, tkhd);
}

fn write_elst(buf: &mut BytesMut, track: &Track) {
    let needs_v1 = track.edit_lst.iter().any(|e| {
        e.segment_duration > u32::MAX as u64 || e.media_time.unsigned_abs() > i32::MAX as u64
    });
    let version = if needs_v1 { 1 } else { 0 };
    let edts = box_start(buf, b"edts");
    let elst = full_box_start(buf, b"elst", version, 0);
    buf.put_u32(track.edit_lst.len() as u32);
    for e in &track.edit_lst {
        if version == 1 {
            buf.put_u64(e.segment_duration);
            buf.put_i64(e.media_time);
        } else {
            buf.put_u32(e.segment_duration as u32);
            buf.put_i32(e.media_time as i32);
        }
        buf.put_i16(e.media_rate);
        buf.put_i16(0); // media_rate_fraction
    }
    box_end(buf, elst);
    box_end(buf, edts);
}

fn write_mdhd(buf: &mut BytesMut, track: &Track) {
    let version = if track.media_duration > u32::MAX as u64 {
        1
    } else {
        0
    };
    let mdhd = full_box_start(buf, b"mdhd", version, 0);
    if version == 1 {
        buf.put_u64(0);
        buf.put_u64(0);
        buf.put_u32(track.media_timescale);
        buf.put_u64(track.media_duration);
    } else {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(track.media_timescale);
        buf.put_u32(track.media_duration as u32);
    }
    buf.put_u16(pack_language(&track.language));
    buf.put_u16(0); // pre_defined
    box_end(buf, mdhd);
}

fn write_hdlr(buf: &mut BytesMut, track: &Track) {
    let hdlr = full_box_start(buf, b"hdlr", 0, 0);
    buf.put_u32(0); // pre_defined
    buf.put_slice(track.info.kind.handler_type().as_bytes());
    buf.put_slice(&[0u8; 12]); // reserved
    buf.put_slice(track.info.kind.handler_name().as_bytes());
    buf.put_u8(0);
    box_end(buf, hdlr);
}

fn write_dinf(buf: &mut BytesMut) {
    let dinf = box_start(buf, b"dinf");
    let dref = full_box_start(buf, b"dref", 0, 0);
    buf.put_u32(1); // entry_count
    let url = full_box_start(buf, b"url ", 0, 1); // self-contained
    box_end(buf, url);
    box_end(buf, dref);
    box_end(buf, dinf);
}

fn write_media_header(buf: &mut BytesMut, kind: StreamKind) {
    match kind {
        StreamKind::Video => {
            let vmhd = full_box_start(buf, b"vmhd", 0, 1);
            buf.put_u16(0); // graphicsmode
            buf.put_slice(&[0u8; 6]); // opcolor
            box_end(buf, vmhd);
        }
        StreamKind::Audio => {
            let smhd = full_box_start(buf, b"smhd", 0, 0);
            buf.put_u16(0); // balance
            buf.put_u16(0); // reserved
            box_end(buf, smhd);
        }
        _ => {
            let nmhd = full_box_start(buf, b"nmhd", 0, 0);
            box_end(buf, nmhd);
        }
    }
}

fn write_trak(
    buf: &mut BytesMut,
    track: &Track,
    opts: &MuxOptions,
    co64: bool,
    fragmented: bool,
    udta_atoms: &[Vec<u8>],
) -> Option<StcoPatch> {
    let trak = box_start(buf, b"trak");
    write_tkhd(buf, track, track.presentation_duration());
    if !track.edit_lst.is_empty() {
        write_elst(buf, track);
    }

    let mdia = box_start(buf, b"mdia");
    write_mdhd(buf, track);
    write_hdlr(buf, track);

    let minf = box_start(buf, b"minf");
    write_media_header(buf, track.info.kind);
    write_dinf(buf);
    let patch = if fragmented {
        write_empty_stbl(buf, track);
        None
    } else {
        Some(write_stbl(buf, track, opts, co64))
    };
    box_end(buf, minf);
    box_end(buf, mdia);

    if !udta_atoms.is_empty() {
        let udta = box_start(buf, b"udta");
        for atom in udta_atoms {
            buf.put_slice(atom);
        }
        box_end(buf, udta);
    }

    box_end(buf, trak);
    patch
}

fn write_mvex(buf: &mut BytesMut, tracks: &[Track], movie_duration: u64) {
    let mvex = box_start(buf, b"mvex");

    let version = if movie_duration > u32::MAX as u64 { 1 } else { 0 };
    let mehd = full_box_start(buf, b"mehd", version, 0);
    if version == 1 {
        buf.put_u64(movie_duration);
    } else {
        buf.put_u32(movie_duration as u32);
    }
    box_end(buf, mehd);

    for track in tracks {
        let trex = full_box_start(buf, b"trex", 0, 0);
        buf.put_u32(track.id);
        buf.put_u32(track.trex.sample_description_index);
        buf.put_u32(track.trex.duration);
        buf.put_u32(track.trex.size);
        buf.put_u32(track.trex.flags);
        box_end(buf, trex);
    }
    box_end(buf, mvex);
}

/// Opaque `udta`/`meta` atoms carried verbatim.
#[derive(Debug, Default)]
pub struct UserData {
    pub movie_atoms: Vec<Vec<u8>>,
    pub track_atoms: Vec<(u32, Vec<u8>)>,
}

/// The complete `moov`. Returns one chunk-offset patch per track for
/// classical output (empty for fragmented).
pub fn write_moov(
    buf: &mut BytesMut,
    cfg: &MuxConfig,
    tracks: &[Track],
    movie_timescale: u32,
    co64: bool,
    udta: &UserData,
) -> Vec<StcoPatch> {
    let fragmented = cfg.frag.is_some();
    let movie_duration = tracks
        .iter()
        .map(|t| t.presentation_duration())
        .max()
        .unwrap_or(0);
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;

    let mut patches = Vec::new();
    let moov = box_start(buf, b"moov");
    write_mvhd(buf, movie_timescale, movie_duration, next_track_id);
    if cfg.options.write_iods {
        write_iods(buf, 0xff, 0xff);
    }
    for track in tracks {
        let atoms: Vec<Vec<u8>> = udta
            .track_atoms
            .iter()
            .filter(|(id, _)| *id == track.id)
            .map(|(_, a)| a.clone())
            .collect();
        if let Some(p) = write_trak(buf, track, &cfg.options, co64, fragmented, &atoms) {
            patches.push(p);
        }
    }
    if fragmented {
        write_mvex(buf, tracks, movie_duration);
    }
    if !udta.movie_atoms.is_empty() {
        let u = box_start(buf, b"udta");
        for atom in &udta.movie_atoms {
            buf.put_slice(atom);
        }
        box_end(buf, u);
    }
    box_end(buf, moov);
    patches
}
