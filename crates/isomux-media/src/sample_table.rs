//! Reduction of per-sample track state to the compressed sample-table
//! rows (`stts`, `stsc`, chunk offsets). The box writers serialize the
//! rows produced here.

use crate::track::{Chunk, Track};

/// `stts` rows: coalesced `(sample_count, sample_delta)`. The final
/// sample's delta is `media_duration - last_dts`.
pub fn stts_rows(track: &Track) -> Vec<(u32, u32)> {
    let entries = track.dts_lst.entries();
    let mut rows: Vec<(u32, u32)> = Vec::new();
    let n = entries.len();
    for i in 0..n {
        let delta = if i + 1 < n {
            (entries[i + 1].dts - entries[i].dts) as u32
        } else {
            (track.first_dts + track.media_duration - entries[i].dts) as u32
        };
        match rows.last_mut() {
            Some(last) if last.1 == delta => last.0 += 1,
            _ => rows.push((1, delta)),
        }
    }
    rows
}

/// `stsc` rows: `(first_chunk, samples_per_chunk,
/// sample_description_index)`, all 1-based, emitted only when the pair
/// changes from the previous chunk.
pub fn stsc_rows(chunks: &[Chunk]) -> Vec<(u32, u32, u32)> {
    let mut rows: Vec<(u32, u32, u32)> = Vec::new();
    for (i, c) in chunks.iter().enumerate() {
        let spc = c.sample_count;
        let sdi = c.stsd_idx + 1;
        match rows.last() {
            Some(&(_, last_spc, last_sdi)) if last_spc == spc && last_sdi == sdi => {}
            _ => rows.push((i as u32 + 1, spc, sdi)),
        }
    }
    rows
}

/// Reconstruct the per-sample dts sequence from stts rows (test aid and
/// consistency guard).
pub fn dts_from_stts(rows: &[(u32, u32)], first_dts: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut dts = first_dts;
    for &(count, delta) in rows {
        for _ in 0..count {
            out.push(dts);
            dts += delta as u64;
        }
    }
    out
}
