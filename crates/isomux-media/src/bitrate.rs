//! Peak and average bitrate finalization for AAC and MPEG-4 Visual
//! tracks, run once all samples have been accepted.

use crate::track::Track;

/// Window length cap in frames.
const MAX_FILTER_LEN: usize = 48;

/// Correction denominator for the AAC 1024-sample frame window.
const AAC_WINDOW_DENOM: u64 = 1024;

/// Per-rate numerators compensating for the 1024-sample framing when
/// sliding a 1-second window.
fn aac_window_correction(media_timescale: u32) -> u64 {
    match media_timescale {
        16000 => 1000,
        22050 => 1002,
        24000 => 1043,
        32000 => 1032,
        44100 => 1026,
        48000 => 1021,
        _ => 0,
    }
}

fn finalize(
    media_timescale: u32,
    is_aac: bool,
    max_window_size: u32,
    size_sum: u64,
    media_duration: u64,
) -> (u32, u32) {
    let correction = if is_aac {
        aac_window_correction(media_timescale)
    } else {
        0
    };
    let max_bitrate = if correction != 0 {
        (8 * max_window_size as u64 * correction / AAC_WINDOW_DENOM) as u32
    } else {
        8 * max_window_size
    };
    let avg_bitrate = if media_duration > 0 {
        (8 * size_sum * media_timescale as u64 / media_duration) as u32
    } else {
        0
    };
    (max_bitrate, avg_bitrate)
}

/// Slide a 1-second window of frame sizes over the track and store the
/// peak and average bitrates into each sample description (and the
/// track-level stream info).
///
/// Applies to AAC (`objectTypeIndication` 0x40) and MPEG-4 Visual
/// (0x20) only; anything else keeps the parser-reported rates.
pub fn calculate_bitrate(track: &mut Track) {
    let oti = track.info.object_type_indication;
    let is_aac = oti == 0x40;
    if (!is_aac && oti != 0x20) || track.media_duration == 0 {
        return;
    }

    let filter_len = if is_aac {
        // one second of 1024-sample frames
        (track.media_timescale as usize + 1023) / 1024
    } else {
        ((track.media_timescale as u64 * track.sample_num as u64 + track.media_duration - 1)
            / track.media_duration) as usize
    };
    let filter_len = filter_len.clamp(1, MAX_FILTER_LEN);

    // sample-description boundaries split the calculation
    let mut boundaries: Vec<u32> = track
        .stsd_lst
        .iter()
        .skip(1)
        .map(|e| e.first_sample)
        .collect();
    boundaries.push(track.sample_num);

    let sizes: Vec<u32> = track.size_lst.iter().collect();
    let dts = track.dts_lst.entries();

    let mut window: Vec<u32> = vec![0; filter_len];
    let mut max_window_size = 0u32;
    let mut size_sum = 0u64;
    let mut segment_first_dts = track.first_dts;
    let mut seg = 0usize;

    for (i, &size) in sizes.iter().enumerate() {
        if i as u32 == boundaries[seg] {
            // finalize the finished segment and start a new window
            let boundary_dts = dts[i].dts;
            let (max, avg) = finalize(
                track.media_timescale,
                is_aac,
                max_window_size,
                size_sum,
                boundary_dts - segment_first_dts,
            );
            track.stsd_lst[seg].info.max_bit_rate = max;
            track.stsd_lst[seg].info.bit_rate = avg;
            segment_first_dts = boundary_dts;
            seg += 1;
            window.iter_mut().for_each(|w| *w = 0);
            max_window_size = 0;
            size_sum = 0;
        }

        window.rotate_right(1);
        window[0] = size;
        size_sum += size as u64;
        let total: u32 = window.iter().sum();
        max_window_size = max_window_size.max(total);
    }

    let end_dts = track.first_dts + track.media_duration;
    let (max, avg) = finalize(
        track.media_timescale,
        is_aac,
        max_window_size,
        size_sum,
        end_dts - segment_first_dts,
    );
    track.stsd_lst[seg].info.max_bit_rate = max;
    track.stsd_lst[seg].info.bit_rate = avg;
    track.info.max_bit_rate = max;
    track.info.bit_rate = avg;
}
