//! Fragment-boundary selection and per-fragment `tfhd`/`trun`
//! assembly.
//!
//! `create_fragment_list` partitions each track's samples into
//! contiguous `[start_idx, end_idx)` fragments bounded by the min/max
//! duration window, aligned to sync samples where possible, and clipped
//! by sample-description changes. `prepare_traf` then derives the
//! header flags and rows for one fragment.

use isomux_common::{Error, Result};

use crate::boxes::frag::{
    TfhdInfo, TrunInfo, TrunRow, TF_BASE_DATA_OFFSET, TF_DEFAULT_BASE_IS_MOOF,
    TF_DEFAULT_SAMPLE_DURATION, TF_DEFAULT_SAMPLE_FLAGS, TF_DEFAULT_SAMPLE_SIZE,
    TF_SAMPLE_DESCRIPTION_INDEX, TR_CTS_OFFSETS, TR_DATA_OFFSET, TR_FIRST_FLAGS,
    TR_SAMPLE_DURATION, TR_SAMPLE_FLAGS, TR_SAMPLE_SIZE,
};
use crate::config::{rescale_u64, FragOptions, FragStyle};
use crate::track::Track;
use isomux_common::StreamKind;

/// Minimum fragment window when fragments must open on sync samples.
const SYNC_FORCED_MIN_MS: u32 = 10;

/// Partition every track's samples into fragments.
pub fn create_fragment_list(tracks: &mut [Track], frag: &FragOptions) -> Result<()> {
    let frag_min_ms = if frag.require_first_is_sync {
        SYNC_FORCED_MIN_MS
    } else {
        frag.frag_min_ms
    };
    if frag.frag_max_ms == 0 || frag.frag_max_ms <= frag_min_ms {
        return Err(Error::param("max fragment duration must exceed min"));
    }

    for track in tracks.iter_mut() {
        let max_units = rescale_u64(frag.frag_max_ms as u64, track.media_timescale, 1000);
        let min_units = rescale_u64(frag_min_ms as u64, track.media_timescale, 1000);
        let one_sample_per_frag = track.info.coding_name.as_bytes() == b"stpp";

        track.segment_lst.clear();
        track.dts_cursor.rewind();
        track.sync_cursor.rewind();
        let mut frag_dts = track.first_dts;
        let stream_end = track.first_dts + track.media_duration;

        while frag_dts < stream_end {
            let first = match track.dts_cursor.peek(&track.dts_lst) {
                Some(e) => e,
                None => break,
            };
            let idx_start = first.idx;
            let mut idx_stop = idx_start + 1;
            let mut stop_dts = match track.dts_cursor.peek2(&track.dts_lst) {
                Some(e) => e.dts,
                None => stream_end,
            };
            let mut stop_is_sync = false;

            let mut dts_max = frag_dts + max_units;
            let dts_min = frag_dts + min_units;

            if !one_sample_per_frag {
                // a sample-description change forces a boundary
                let dts_max_sd = track.next_sd_change_dts(idx_start);
                if dts_max > dts_max_sd {
                    dts_max = dts_max_sd;
                }

                if !track.all_rap_samples {
                    match track.sync_cursor.peek(&track.sync_lst) {
                        Some(s) if s.idx == idx_start => {}
                        _ => {
                            track.frag_no_sync = true;
                            tracing::warn!(
                                track = track.id,
                                "fragment does not begin at a sync sample"
                            );
                            if frag.require_first_is_sync {
                                return Err(Error::param(
                                    "sync-sample distance exceeds the maximum fragment duration",
                                ));
                            }
                        }
                    }

                    // prefer the last sync sample inside the window
                    track.sync_cursor.save_mark();
                    while let Some(s) = track.sync_cursor.next(&track.sync_lst) {
                        if s.dts > dts_max {
                            break;
                        }
                        if s.idx > idx_stop {
                            idx_stop = s.idx;
                            stop_dts = s.dts;
                            stop_is_sync = true;
                        }
                    }
                    track.sync_cursor.goto_mark();
                }

                if stop_dts <= dts_min || !stop_is_sync {
                    // no usable sync in range: fill with plain samples
                    track.dts_cursor.save_mark();
                    let mut exhausted = true;
                    while let Some(e) = track.dts_cursor.next(&track.dts_lst) {
                        if e.dts > dts_max {
                            exhausted = false;
                            break;
                        }
                        if e.idx > idx_stop {
                            idx_stop = e.idx;
                            stop_dts = e.dts;
                        }
                    }
                    if exhausted && stream_end <= dts_max {
                        idx_stop = track.dts_lst.len() as u32;
                        stop_dts = stream_end;
                    }
                    track.dts_cursor.goto_mark();
                }
            }

            track.dts_cursor.skip_below(&track.dts_lst, idx_stop);
            track.sync_cursor.skip_below(&track.sync_lst, idx_stop);

            track.segment_lst.push((idx_start, idx_stop));
            frag_dts = stop_dts;
        }

        track.sidx_reference_count = track.segment_lst.len() as u16;
        track.dts_cursor.rewind();
        track.sync_cursor.rewind();
    }

    Ok(())
}

/// How the sample flags behave across one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleMode {
    Same,
    SameExceptFirst,
    Different,
}

fn sample_mode(track: &Track, first: u32, count: u32) -> (SampleMode, u32, u32) {
    if track.sdtp_lst.is_empty() || count == 0 {
        return (SampleMode::Same, track.trex.flags, track.trex.flags);
    }
    let flags: Vec<u32> = (first..first + count)
        .map(|i| track.sdtp_lst[i as usize].sample_flags())
        .collect();
    let first_val = flags[0];
    let rest = &flags[1..];
    if rest.is_empty() {
        return (SampleMode::Same, first_val, first_val);
    }
    let rest_val = rest[0];
    if rest.iter().any(|&f| f != rest_val) {
        return (SampleMode::Different, first_val, rest_val);
    }
    if first_val == rest_val {
        (SampleMode::Same, first_val, rest_val)
    } else {
        (SampleMode::SameExceptFirst, first_val, rest_val)
    }
}

/// The assembled plan for one `traf`.
#[derive(Debug, Clone)]
pub struct TrafPlan {
    pub tfhd: TfhdInfo,
    pub trun: TrunInfo,
    pub rows: Vec<TrunRow>,
    pub first: u32,
    pub count: u32,
    pub start_dts: u64,
    pub end_dts: u64,
}

/// Derive `tfhd`/`trun` flags and rows for the fragment
/// `[first, first + count)` of `track`.
pub fn prepare_traf(track: &Track, frag: &FragOptions, seg: (u32, u32)) -> TrafPlan {
    let (first, stop) = seg;
    let count = stop - first;

    let mut tfhd = TfhdInfo {
        track_id: track.id,
        ..Default::default()
    };

    // 1-based index of the sample description governing this run
    let sd_index = track
        .stsd_lst
        .iter()
        .filter(|e| e.first_sample <= first)
        .count() as u32;
    if frag.force_tfhd_sampdescidx || sd_index > 1 {
        tfhd.tf_flags |= TF_SAMPLE_DESCRIPTION_INDEX;
        tfhd.sample_description_index = sd_index.max(1);
    }

    // sample-flag shape across the run
    let (mut mode, first_val, rest_val) = if !frag.write_sdtp {
        sample_mode(track, first, count)
    } else {
        // flags travel in the sdtp box instead
        (SampleMode::Same, track.trex.flags, track.trex.flags)
    };

    if frag.empty_trex {
        tfhd.tf_flags |= TF_DEFAULT_SAMPLE_FLAGS;
        tfhd.default_sample_flags = 0;
        if !frag.empty_tfhd {
            tfhd.tf_flags |= TF_DEFAULT_SAMPLE_DURATION | TF_DEFAULT_SAMPLE_SIZE;
            tfhd.default_sample_duration = track.trex.duration;
            tfhd.default_sample_size = track.trex.size;
        } else {
            tfhd.tf_flags &= !TF_DEFAULT_SAMPLE_FLAGS;
        }
    } else if mode != SampleMode::Different && rest_val != track.trex.flags {
        if !frag.empty_tfhd {
            tfhd.tf_flags |= TF_DEFAULT_SAMPLE_FLAGS;
            tfhd.default_sample_flags = rest_val;
        } else {
            mode = SampleMode::Different;
        }
    }

    if frag.no_bdo_in_tfhd {
        if frag.default_base_is_moof {
            tfhd.tf_flags |= TF_DEFAULT_BASE_IS_MOOF;
        }
    } else {
        tfhd.tf_flags |= TF_BASE_DATA_OFFSET;
    }

    // trun flags
    let mut tr_flags = 0u32;
    if frag.no_bdo_in_tfhd {
        tr_flags |= TR_DATA_OFFSET;
    }
    if frag.empty_tfhd {
        tr_flags |= TR_SAMPLE_DURATION | TR_SAMPLE_SIZE;
    }
    match mode {
        SampleMode::SameExceptFirst => {
            tr_flags |= TR_FIRST_FLAGS;
            tr_flags &= !TR_SAMPLE_FLAGS;
        }
        SampleMode::Different if !track.sdtp_lst.is_empty() && !frag.write_sdtp => {
            tr_flags |= TR_SAMPLE_FLAGS;
            tr_flags &= !TR_FIRST_FLAGS;
        }
        _ => {}
    }

    // per-sample durations when any delta differs from the default
    let default_duration = if tfhd.tf_flags & TF_DEFAULT_SAMPLE_DURATION != 0 {
        tfhd.default_sample_duration
    } else {
        track.trex.duration
    };
    let entries = track.dts_lst.entries();
    let stream_end = track.first_dts + track.media_duration;
    let delta_at = |i: u32| -> u32 {
        let here = entries[i as usize].dts;
        let next = entries
            .get(i as usize + 1)
            .map(|e| e.dts)
            .unwrap_or(stream_end);
        (next - here) as u32
    };
    if (first..first + count).any(|i| delta_at(i) != default_duration) {
        tr_flags |= TR_SAMPLE_DURATION;
    }

    let default_size = if tfhd.tf_flags & TF_DEFAULT_SAMPLE_SIZE != 0 {
        tfhd.default_sample_size
    } else {
        track.trex.size
    };
    if (first..first + count).any(|i| track.size_lst.value_at(i as u64) != Some(default_size)) {
        tr_flags |= TR_SAMPLE_SIZE;
    }

    if !track.no_cts_offset {
        tr_flags |= TR_CTS_OFFSETS;
    }

    if frag.style == FragStyle::Ccff
        && matches!(track.info.kind, StreamKind::Video | StreamKind::Subtitle)
    {
        tr_flags |= TR_SAMPLE_DURATION | TR_SAMPLE_SIZE | TR_DATA_OFFSET;
    }

    let version = if track.uses_ctts_v1() && !frag.force_trun_v0 {
        1
    } else {
        0
    };

    let mut cts_cursor = isomux_common::RunCursor::new();
    // advance the run cursor to the first sample of the fragment
    for _ in 0..first {
        cts_cursor.next(&track.cts_offset_lst);
    }

    let rows: Vec<TrunRow> = (first..first + count)
        .map(|i| TrunRow {
            duration: delta_at(i),
            size: track.size_lst.value_at(i as u64).unwrap_or(0),
            flags: if track.sdtp_lst.is_empty() {
                track.trex.flags
            } else {
                track.sdtp_lst[i as usize].sample_flags()
            },
            cts_offset: cts_cursor.next(&track.cts_offset_lst).unwrap_or(0),
        })
        .collect();

    let start_dts = entries[first as usize].dts;
    let end_dts = entries
        .get((first + count) as usize)
        .map(|e| e.dts)
        .unwrap_or(stream_end);

    TrafPlan {
        tfhd,
        trun: TrunInfo {
            tr_flags,
            version,
            first_sample_flags: first_val,
        },
        rows,
        first,
        count,
        start_dts,
        end_dts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MuxOptions, TrackConfig};
    use isomux_common::{Dependency, DsiEntry, FourCc, Sample, SampleFlags, StreamInfo};

    /// Video track, 1000 Hz, one sample per 40 units, syncs every
    /// `gop` samples.
    fn video_track(n: u64, gop: u64) -> Track {
        let mut info = StreamInfo::video(FourCc::new(b"avc1"));
        info.time_scale = 1000;
        let mut t = Track::new(1, info, TrackConfig::default(), &MuxOptions::default());
        for i in 0..n {
            let sync = i % gop == 0;
            let mut flags = SampleFlags::empty();
            if sync {
                flags.insert(SampleFlags::SYNC);
            }
            if i == 0 {
                flags.insert(SampleFlags::NEW_SD);
            }
            t.add_sample(&Sample {
                dts: i * 40,
                cts: i * 40,
                duration: 40,
                size: 100,
                flags,
                dependency: Dependency {
                    is_leading: 0,
                    depends_on: if sync { 2 } else { 1 },
                    is_depended_on: 1,
                    has_redundancy: 2,
                },
                data: vec![0; 100],
                ..Sample::default()
            })
            .unwrap();
        }
        t.attach_dsi(vec![DsiEntry::new(FourCc::new(b"avcC"), vec![1])])
            .unwrap();
        t.setup(1000).unwrap();
        t
    }

    #[test]
    fn fragments_align_to_syncs() {
        // 100 frames at 25 fps, gop 25 -> syncs at 0, 25, 50, 75
        let mut tracks = vec![video_track(100, 25)];
        let frag = FragOptions {
            frag_min_ms: 500,
            frag_max_ms: 2000,
            ..Default::default()
        };
        create_fragment_list(&mut tracks, &frag).unwrap();
        let t = &tracks[0];
        // boundaries land on syncs: the last sync inside each window
        assert_eq!(t.segment_lst, vec![(0, 50), (50, 75), (75, 100)]);
        assert_eq!(t.sidx_reference_count, 3);
        for &(start, _) in &t.segment_lst {
            assert!(t.is_sync_sample(start));
        }
        // every fragment covers each sample exactly once
        let covered: u32 = t.segment_lst.iter().map(|(a, b)| b - a).sum();
        assert_eq!(covered, 100);
    }

    #[test]
    fn window_without_sync_takes_plain_samples() {
        // one big gop: only sample 0 is sync
        let mut tracks = vec![video_track(100, 1000)];
        let frag = FragOptions {
            frag_min_ms: 200,
            frag_max_ms: 1000,
            ..Default::default()
        };
        create_fragment_list(&mut tracks, &frag).unwrap();
        let t = &tracks[0];
        assert!(t.segment_lst.len() > 1);
        assert!(t.frag_no_sync);
        let covered: u32 = t.segment_lst.iter().map(|(a, b)| b - a).sum();
        assert_eq!(covered, 100);
        // contiguity
        for w in t.segment_lst.windows(2) {
            assert_eq!(w[0].1, w[1].0);
        }
    }

    #[test]
    fn require_sync_fails_on_long_gop() {
        let mut tracks = vec![video_track(100, 1000)];
        let frag = FragOptions {
            frag_max_ms: 1000,
            require_first_is_sync: true,
            ..Default::default()
        };
        assert!(create_fragment_list(&mut tracks, &frag).is_err());
    }

    #[test]
    fn sd_change_forces_boundary() {
        // sd change at sample 75 (dts 3000), max window 2 s
        let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
        info.time_scale = 1000;
        let mut t = Track::new(1, info, TrackConfig::default(), &MuxOptions::default());
        for i in 0..100u64 {
            let mut flags = SampleFlags::SYNC;
            if i == 0 || i == 75 {
                flags.insert(SampleFlags::NEW_SD);
            }
            t.add_sample(&Sample {
                dts: i * 40,
                cts: i * 40,
                duration: 40,
                size: 10,
                flags,
                data: vec![0; 10],
                ..Sample::default()
            })
            .unwrap();
        }
        t.attach_dsi(vec![
            DsiEntry::new(FourCc::new(b"esds"), vec![0]),
            DsiEntry::new(FourCc::new(b"esds"), vec![1]),
        ])
        .unwrap();
        t.setup(1000).unwrap();

        let mut tracks = vec![t];
        let frag = FragOptions {
            frag_min_ms: 500,
            frag_max_ms: 2000,
            ..Default::default()
        };
        create_fragment_list(&mut tracks, &frag).unwrap();
        let t = &tracks[0];
        // a fragment boundary lands exactly on sample 75
        assert!(t.segment_lst.iter().any(|&(start, _)| start == 75));
        // and no fragment straddles it
        assert!(!t
            .segment_lst
            .iter()
            .any(|&(start, stop)| start < 75 && stop > 75));
    }

    #[test]
    fn traf_plan_flags() {
        let track = video_track(50, 25);
        let frag = FragOptions::default();
        let plan = prepare_traf(&track, &frag, (0, 25));
        assert_eq!(plan.count, 25);
        // default-base-is-moof and a data offset
        assert_ne!(plan.tfhd.tf_flags & TF_DEFAULT_BASE_IS_MOOF, 0);
        assert_ne!(plan.trun.tr_flags & TR_DATA_OFFSET, 0);
        // uniform duration and size: no per-sample fields
        assert_eq!(plan.trun.tr_flags & TR_SAMPLE_DURATION, 0);
        assert_eq!(plan.trun.tr_flags & TR_SAMPLE_SIZE, 0);
        // no cts offsets on this track
        assert_eq!(plan.trun.tr_flags & TR_CTS_OFFSETS, 0);
        // sync-opening run: first sample flag differs from the rest
        assert_ne!(plan.trun.tr_flags & TR_FIRST_FLAGS, 0);
        assert_eq!(plan.rows.len(), 25);
        assert_eq!(plan.start_dts, 0);
        assert_eq!(plan.end_dts, 1000);
    }

    #[test]
    fn empty_tfhd_pushes_fields_to_trun() {
        let track = video_track(50, 25);
        let frag = FragOptions {
            empty_trex: true,
            empty_tfhd: true,
            ..Default::default()
        };
        let plan = prepare_traf(&track, &frag, (0, 25));
        assert_eq!(plan.tfhd.tf_flags & TF_DEFAULT_SAMPLE_DURATION, 0);
        assert_ne!(plan.trun.tr_flags & TR_SAMPLE_DURATION, 0);
        assert_ne!(plan.trun.tr_flags & TR_SAMPLE_SIZE, 0);
    }
}
