//! End-to-end scenarios: parse synthetic elementary streams, mux them,
//! and verify the produced boxes by re-parsing the output.

mod common;

use std::io::Cursor;

use common::*;
use isomux::{
    run, BlockEncryptor, Codec, Dependency, EncOptions, EncStyle, FragOptions, InputStream,
    MetaData, MetaItem, MuxConfig, Muxer, Sample, SampleFlags, StreamInfo, TrackConfig,
};
use isomux_common::{DsiEntry, FourCc};
use isomux_media::boxes::enc::{PIFF_SENC_UUID, PIFF_TENC_UUID};

fn mux_to_vec(cfg: MuxConfig, codec: Codec, stream: Vec<u8>) -> Vec<u8> {
    let input = InputStream {
        codec,
        source: Cursor::new(stream),
        track: TrackConfig::default(),
    };
    let sink = run(cfg, vec![input], Cursor::new(Vec::new())).unwrap();
    sink.into_inner()
}

#[test]
fn single_track_aac() {
    // 100 ADTS frames, 48 kHz stereo, AOT 2, constant payload size
    let mut stream = Vec::new();
    for _ in 0..100 {
        stream.extend_from_slice(&adts_frame(3, 2, &[0x42; 100]));
    }
    let data = mux_to_vec(MuxConfig::default(), Codec::Aac, stream);

    // ftyp is always first
    let tops = top_level(&data);
    assert_eq!(&tops[0].fourcc, b"ftyp");
    let fourccs: Vec<[u8; 4]> = tops.iter().map(|b| b.fourcc).collect();
    assert!(fourccs.contains(b"moov"));
    assert!(fourccs.contains(b"mdat"));

    // movie and media timescales follow the audio rate
    let mvhd = find_all(&data, &[b"moov"], b"mvhd")[0].clone();
    assert_eq!(data[mvhd.start], 0); // version
    assert_eq!(be_u32(&data, mvhd.start + 12), 48000);
    let mdhd = find_all(&data, &[b"moov", b"trak", b"mdia"], b"mdhd")[0].clone();
    assert_eq!(be_u32(&data, mdhd.start + 12), 48000);

    let stbl = find_path(&data, &[b"moov", b"trak", b"mdia", b"minf", b"stbl"]).unwrap();

    // one mp4a sample description
    let stsd = children(&data, stbl.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"stsd")
        .unwrap();
    assert_eq!(be_u32(&data, stsd.body.start + 4), 1);
    assert_eq!(&data[stsd.body.start + 12..stsd.body.start + 16], b"mp4a");

    // stts is one row: (100, 1024)
    let stts = children(&data, stbl.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"stts")
        .unwrap();
    assert_eq!(be_u32(&data, stts.body.start + 4), 1);
    assert_eq!(be_u32(&data, stts.body.start + 8), 100);
    assert_eq!(be_u32(&data, stts.body.start + 12), 1024);

    // fixed-size stsz, no ctts, no stss (every sample is sync)
    let stsz = children(&data, stbl.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"stsz")
        .unwrap();
    assert_eq!(be_u32(&data, stsz.body.start + 4), 100);
    assert_eq!(be_u32(&data, stsz.body.start + 8), 100);
    assert!(!children(&data, stbl.clone())
        .iter()
        .any(|b| &b.fourcc == b"ctts"));
    assert!(!children(&data, stbl.clone())
        .iter()
        .any(|b| &b.fourcc == b"stss"));

    // mdat payload is the frames with their 7-byte ADTS headers gone
    let mdat = tops.iter().find(|b| &b.fourcc == b"mdat").unwrap();
    assert_eq!(mdat.body.len(), 100 * 100);

    // chunk offsets land inside the mdat payload
    let stco = children(&data, stbl)
        .into_iter()
        .find(|b| &b.fourcc == b"stco")
        .unwrap();
    let n = be_u32(&data, stco.body.start + 4) as usize;
    assert!(n >= 1);
    let mut offsets = Vec::new();
    for i in 0..n {
        offsets.push(be_u32(&data, stco.body.start + 8 + 4 * i) as usize);
    }
    assert_eq!(offsets[0], mdat.body.start);
    for o in &offsets {
        assert!(*o >= mdat.body.start && *o < mdat.body.end);
    }
}

#[test]
fn avc_gops_reorder_and_edit_list() {
    let data = mux_to_vec(MuxConfig::default(), Codec::Avc, avc_three_gops());

    let stbl = find_path(&data, &[b"moov", b"trak", b"mdia", b"minf", b"stbl"]).unwrap();

    // IDRs land on samples 1, 5, 9
    let stss = children(&data, stbl.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"stss")
        .unwrap();
    assert_eq!(be_u32(&data, stss.body.start + 4), 3);
    assert_eq!(be_u32(&data, stss.body.start + 8), 1);
    assert_eq!(be_u32(&data, stss.body.start + 12), 5);
    assert_eq!(be_u32(&data, stss.body.start + 16), 9);

    // reorder produces non-monotone composition offsets
    let ctts = children(&data, stbl.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"ctts")
        .unwrap();
    let rows = be_u32(&data, ctts.body.start + 4) as usize;
    let mut offsets = Vec::new();
    for i in 0..rows {
        let count = be_u32(&data, ctts.body.start + 8 + 8 * i);
        let value = be_u32(&data, ctts.body.start + 12 + 8 * i);
        for _ in 0..count {
            offsets.push(value);
        }
    }
    assert_eq!(offsets.len(), 12);
    // per GOP: I +1 frame, P +3 frames, B +0, B +0 (frame duration 2)
    assert_eq!(&offsets[0..4], &[2, 6, 0, 0]);
    assert!(offsets.windows(2).any(|w| w[1] < w[0]));

    // the reorder delay becomes a single edit
    let elst = find_all(&data, &[b"moov", b"trak", b"edts"], b"elst")[0].clone();
    assert_eq!(be_u32(&data, elst.start + 4), 1); // entry count
    let segment_duration = be_u32(&data, elst.start + 8);
    let media_time = be_u32(&data, elst.start + 12);
    assert_eq!(media_time, 2); // first cts offset
    assert_eq!(segment_duration, 24); // 12 frames of duration 2

    // sdtp rows: intra opens the gop, B frames are not depended on
    let sdtp = children(&data, stbl)
        .into_iter()
        .find(|b| &b.fourcc == b"sdtp")
        .unwrap();
    let rows = &data[sdtp.body.start + 4..sdtp.body.end];
    assert_eq!(rows.len(), 12);
    assert_eq!((rows[0] >> 4) & 0x3, 2); // sample_depends_on = no
    assert_eq!((rows[2] >> 4) & 0x3, 1); // B depends
    assert_eq!((rows[2] >> 2) & 0x3, 2); // B not depended on
}

#[test]
fn eac3_two_substreams_dec3() {
    let mut stream = Vec::new();
    for _ in 0..3 {
        stream.extend_from_slice(&ec3_frame(0, 0, 256, false));
        stream.extend_from_slice(&ec3_frame(1, 0, 128, true));
    }
    let data = mux_to_vec(MuxConfig::default(), Codec::Eac3, stream);

    let stsd = find_all(
        &data,
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl"],
        b"stsd",
    )[0]
    .clone();
    assert_eq!(&data[stsd.start + 12..stsd.start + 16], b"ec-3");

    // dec3 inside the ec-3 entry
    let entry_body = stsd.start + 8 + 8; // stsd fullbox+count, entry header
    let audio_fields = entry_body + 28;
    let dec3 = children(&data, audio_fields..stsd.end)
        .into_iter()
        .find(|b| &b.fourcc == b"dec3")
        .unwrap();
    let d = &data[dec3.body.clone()];
    // 13-bit data rate: 64 + 32 kbps
    assert_eq!(((d[0] as u32) << 8 | d[1] as u32) >> 3, 96);
    // one independent substream
    assert_eq!(d[1] & 0x7, 0);
    let row = u32::from_be_bytes([d[2], d[3], d[4], d[5]]);
    assert_eq!((row >> 25) & 0x1f, 16); // bsid
    assert_eq!((row >> 17) & 0x7, 7); // acmod
    assert_eq!((row >> 16) & 0x1, 1); // lfeon
    assert_eq!((row >> 9) & 0xf, 1); // one dependent substream
    assert_eq!(row & 0x1ff, 0x02); // chan_loc carries Lrs/Rrs
}

#[test]
fn fragmented_sd_change_boundary() {
    // channel-configuration change at frame 75 opens a new sample
    // description mid-stream
    let mut stream = Vec::new();
    for i in 0..100 {
        let channels = if i < 75 { 2 } else { 1 };
        stream.extend_from_slice(&adts_frame(3, channels, &[0x42; 64]));
    }
    let cfg = MuxConfig {
        frag: Some(FragOptions {
            frag_min_ms: 500,
            frag_max_ms: 2000,
            ..Default::default()
        }),
        ..Default::default()
    };
    let data = mux_to_vec(cfg, Codec::Aac, stream);

    let tops = top_level(&data);
    let moofs: Vec<_> = tops.iter().filter(|b| &b.fourcc == b"moof").collect();
    assert_eq!(moofs.len(), 2);

    // the sidx references every fragment
    let sidx = tops.iter().find(|b| &b.fourcc == b"sidx").unwrap();
    let ref_count = be_u16(&data, sidx.body.start + 22);
    assert_eq!(ref_count, 2);

    // first trun covers exactly the 75 samples before the change
    let trun = find_all(&data, &[], b"moof")
        .into_iter()
        .flat_map(|moof| {
            children(&data, moof)
                .into_iter()
                .filter(|b| &b.fourcc == b"traf")
                .flat_map(|traf| children(&data, traf.body))
        })
        .find(|b| &b.fourcc == b"trun")
        .unwrap();
    assert_eq!(be_u32(&data, trun.body.start + 4), 75);

    // the second fragment's decode time sits at the boundary
    let second_traf = children(&data, moofs[1].body.clone())
        .into_iter()
        .find(|b| &b.fourcc == b"traf")
        .unwrap();
    let tfdt = children(&data, second_traf.body)
        .into_iter()
        .find(|b| &b.fourcc == b"tfdt")
        .unwrap();
    assert_eq!(be_u32(&data, tfdt.body.start + 4), 75 * 1024);

    // sidx sizes cover the moof+mdat pairs exactly
    let mut referenced: u64 = 0;
    for i in 0..ref_count as usize {
        referenced += (be_u32(&data, sidx.body.start + 24 + 12 * i) & 0x7fff_ffff) as u64;
    }
    let sidx_end = sidx.body.end;
    assert_eq!(referenced, (data.len() - sidx_end) as u64);
}

#[test]
fn sixty_four_bit_upgrade() {
    // durations beyond 32 bits force version-1 timing boxes
    let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
    info.time_scale = 90000;
    info.sample_rate = 90000;
    info.channel_count = 2;
    info.object_type_indication = 0x40;

    let sink = Cursor::new(Vec::new());
    let mut muxer = Muxer::new(MuxConfig::default(), sink);
    let idx = muxer.add_track(TrackConfig::default(), info.clone()).unwrap();
    let step: u64 = 3_000_000_000; // under 2^32, three of them beyond 2^33
    for i in 0..3u64 {
        muxer
            .input_sample(
                idx,
                &Sample {
                    dts: i * step,
                    cts: i * step,
                    duration: step as u32,
                    size: 8,
                    flags: if i == 0 {
                        SampleFlags::SYNC | SampleFlags::NEW_SD
                    } else {
                        SampleFlags::SYNC
                    },
                    data: vec![0; 8],
                    ..Sample::default()
                },
            )
            .unwrap();
    }
    muxer
        .finish_track(idx, info, vec![DsiEntry::new(FourCc::new(b"esds"), vec![0x11, 0x90])])
        .unwrap();
    let data = muxer.output().unwrap().into_inner();

    let mvhd = find_all(&data, &[b"moov"], b"mvhd")[0].clone();
    assert_eq!(data[mvhd.start], 1);
    // v1 layout: timescale after two u64 times
    assert_eq!(be_u32(&data, mvhd.start + 20), 90000);
    assert_eq!(be_u64(&data, mvhd.start + 24), 9_000_000_000);

    let tkhd = find_all(&data, &[b"moov", b"trak"], b"tkhd")[0].clone();
    assert_eq!(data[tkhd.start], 1);
    let mdhd = find_all(&data, &[b"moov", b"trak", b"mdia"], b"mdhd")[0].clone();
    assert_eq!(data[mdhd.start], 1);
}

/// Deterministic xor stand-in for the caller-supplied AES-CTR
/// primitive.
struct XorEncryptor {
    counter: u64,
}

impl BlockEncryptor for XorEncryptor {
    fn encrypt(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= 0x5a;
        }
    }

    fn advance_iv(&mut self) {
        self.counter += 1;
    }

    fn iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; 16];
        iv[8..].copy_from_slice(&self.counter.to_be_bytes());
        iv
    }
}

/// Fragmented mux of 10 encrypted video samples, two NAL subsamples
/// each (50 clear + 200 split), in the requested encryption style.
fn encrypted_fixture(style: EncStyle) -> Vec<u8> {
    let mut info = StreamInfo::video(FourCc::new(b"avc1"));
    info.time_scale = 1000;
    info.width = 64;
    info.height = 64;

    let track_cfg = TrackConfig {
        enc: Some(EncOptions {
            style,
            iv_size: 16,
            key_id: [9; 16],
        }),
        ..Default::default()
    };

    let cfg = MuxConfig {
        frag: Some(FragOptions {
            frag_min_ms: 100,
            frag_max_ms: 10_000,
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut muxer = Muxer::new(cfg, Cursor::new(Vec::new()));
    let idx = muxer.add_track(track_cfg, info.clone()).unwrap();
    muxer
        .set_track_encryptor(idx, Box::new(XorEncryptor { counter: 0 }))
        .unwrap();

    for i in 0..10u64 {
        muxer
            .input_sample(
                idx,
                &Sample {
                    dts: i * 40,
                    cts: i * 40,
                    duration: 40,
                    size: 250,
                    flags: if i == 0 {
                        SampleFlags::SYNC | SampleFlags::NEW_SD
                    } else {
                        SampleFlags::SYNC
                    },
                    dependency: Dependency {
                        is_leading: 0,
                        depends_on: 2,
                        is_depended_on: 1,
                        has_redundancy: 2,
                    },
                    subsample_sizes: vec![50, 200],
                    data: vec![0u8; 250],
                    ..Sample::default()
                },
            )
            .unwrap();
    }
    let avcc = vec![1, 66, 0, 30, 0xff, 0xe1, 0, 2, 0x67, 0x42, 1, 0, 2, 0x68, 0xee];
    muxer
        .finish_track(idx, info, vec![DsiEntry::new(FourCc::new(b"avcC"), avcc)])
        .unwrap();
    muxer.output().unwrap().into_inner()
}

#[test]
fn encrypted_subsample_fragments() {
    let data = encrypted_fixture(EncStyle::Cenc);

    // protected sample entry with tenc carrying the 16-byte IV size
    let stsd = find_all(
        &data,
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl"],
        b"stsd",
    )[0]
    .clone();
    assert_eq!(&data[stsd.start + 12..stsd.start + 16], b"encv");
    let tenc_at = data[stsd.clone()]
        .windows(4)
        .position(|w| w == b"tenc")
        .unwrap()
        + stsd.start;
    // fullbox header then reserved, 24-bit algorithm id 1, iv size, kid
    assert_eq!(&data[tenc_at + 8..tenc_at + 11], &[0, 0, 1]);
    assert_eq!(data[tenc_at + 11], 16);
    assert_eq!(&data[tenc_at + 12..tenc_at + 28], &[9; 16]);

    // traf carries saiz, saio, and a subsampled senc
    let moof = top_level(&data)
        .into_iter()
        .find(|b| &b.fourcc == b"moof")
        .unwrap();
    let traf = children(&data, moof.body)
        .into_iter()
        .find(|b| &b.fourcc == b"traf")
        .unwrap();
    let traf_children = children(&data, traf.body);
    assert!(traf_children.iter().any(|b| &b.fourcc == b"saiz"));
    assert!(traf_children.iter().any(|b| &b.fourcc == b"saio"));
    let senc = traf_children
        .iter()
        .find(|b| &b.fourcc == b"senc")
        .unwrap();

    // subsample flag, 10 samples
    assert_eq!(data[senc.body.start + 3], 0x2);
    assert_eq!(be_u32(&data, senc.body.start + 4), 10);
    // first entry: 16-byte IV, 2 subsamples: (50 clear, 0) and the
    // 96 + (200 & 0xf) split
    let e = senc.body.start + 8;
    assert_eq!(be_u16(&data, e + 16), 2);
    assert_eq!(be_u16(&data, e + 18), 50);
    assert_eq!(be_u32(&data, e + 20), 0);
    assert_eq!(be_u16(&data, e + 24), 104);
    assert_eq!(be_u32(&data, e + 26), 96);

    // mdat bytes: clear prefix untouched, tail xored
    let mdat = top_level(&data)
        .into_iter()
        .find(|b| &b.fourcc == b"mdat")
        .unwrap();
    let first = &data[mdat.body.start..mdat.body.start + 250];
    assert!(first[..154].iter().all(|&b| b == 0));
    assert!(first[154..].iter().all(|&b| b == 0x5a));
}

#[test]
fn piff_encrypted_fragments() {
    let data = encrypted_fixture(EncStyle::Piff);

    // the protection box in sinf is the PIFF tenc uuid, not a tenc
    let stsd = find_all(
        &data,
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl"],
        b"stsd",
    )[0]
    .clone();
    assert_eq!(&data[stsd.start + 12..stsd.start + 16], b"encv");
    assert!(!data.windows(4).any(|w| w == b"tenc"));
    let tenc_at = data[stsd.clone()]
        .windows(16)
        .position(|w| w == PIFF_TENC_UUID)
        .unwrap()
        + stsd.start;
    assert_eq!(&data[tenc_at - 4..tenc_at], b"uuid");
    // version/flags, 24-bit algorithm id 1, iv size, kid
    assert_eq!(&data[tenc_at + 16..tenc_at + 20], &[0, 0, 0, 0]);
    assert_eq!(&data[tenc_at + 20..tenc_at + 23], &[0, 0, 1]);
    assert_eq!(data[tenc_at + 23], 16);
    assert_eq!(&data[tenc_at + 24..tenc_at + 40], &[9; 16]);
    // scheme type piff, version 1.1
    let schm = data[stsd.clone()]
        .windows(4)
        .position(|w| w == b"schm")
        .unwrap()
        + stsd.start;
    assert_eq!(&data[schm + 8..schm + 12], b"piff");

    // the traf carries only the uuid-wrapped senc: no aux-info boxes
    let moof = top_level(&data)
        .into_iter()
        .find(|b| &b.fourcc == b"moof")
        .unwrap();
    let traf = children(&data, moof.body)
        .into_iter()
        .find(|b| &b.fourcc == b"traf")
        .unwrap();
    let traf_children = children(&data, traf.body);
    assert!(!traf_children.iter().any(|b| &b.fourcc == b"saiz"));
    assert!(!traf_children.iter().any(|b| &b.fourcc == b"saio"));
    assert!(!traf_children.iter().any(|b| &b.fourcc == b"senc"));
    let senc = traf_children
        .iter()
        .find(|b| &b.fourcc == b"uuid")
        .unwrap();
    assert_eq!(&data[senc.body.start..senc.body.start + 16], PIFF_SENC_UUID);

    // subsample flag, 10 samples, then the same entry layout as senc
    assert_eq!(data[senc.body.start + 19], 0x2);
    assert_eq!(be_u32(&data, senc.body.start + 20), 10);
    let e = senc.body.start + 24;
    assert_eq!(be_u16(&data, e + 16), 2);
    assert_eq!(be_u16(&data, e + 18), 50);
    assert_eq!(be_u32(&data, e + 20), 0);
    assert_eq!(be_u16(&data, e + 24), 104);
    assert_eq!(be_u32(&data, e + 26), 96);

    // payload encryption is unchanged by the container style
    let mdat = top_level(&data)
        .into_iter()
        .find(|b| &b.fourcc == b"mdat")
        .unwrap();
    let first = &data[mdat.body.start..mdat.body.start + 250];
    assert!(first[..154].iter().all(|&b| b == 0));
    assert!(first[154..].iter().all(|&b| b == 0x5a));
}

#[test]
fn init_segment_only() {
    let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
    info.time_scale = 48000;
    info.sample_rate = 48000;
    info.channel_count = 2;
    info.object_type_indication = 0x40;

    let cfg = MuxConfig {
        frag: Some(FragOptions::default()),
        ..Default::default()
    };
    let mut muxer = Muxer::new(cfg, Cursor::new(Vec::new()));
    let idx = muxer.add_track(TrackConfig::default(), info.clone()).unwrap();
    muxer.add_movie_meta(&MetaData {
        handler_type: *b"cfmd",
        xml: Some("<asset/>".into()),
        items: vec![MetaItem {
            item_id: 1,
            data: vec![0xab; 16],
        }],
    });
    muxer
        .input_sample(
            idx,
            &Sample {
                dts: 0,
                cts: 0,
                duration: 1024,
                size: 4,
                flags: SampleFlags::SYNC | SampleFlags::NEW_SD,
                data: vec![0; 4],
                ..Sample::default()
            },
        )
        .unwrap();
    muxer
        .finish_track(idx, info, vec![DsiEntry::new(FourCc::new(b"esds"), vec![0x11, 0x90])])
        .unwrap();
    let data = muxer.output_init_segment().unwrap().into_inner();

    let tops = top_level(&data);
    assert_eq!(&tops[0].fourcc, b"ftyp");
    assert_eq!(&tops[1].fourcc, b"moov");
    assert_eq!(tops.len(), 2);
    assert!(find_path(&data, &[b"moov", b"mvex"]).is_some());
    // the meta rides in the movie udta
    let udta = find_path(&data, &[b"moov", b"udta"]).unwrap();
    let meta = children(&data, udta)
        .into_iter()
        .find(|b| &b.fourcc == b"meta")
        .unwrap();
    let xml = children(&data, meta.body.start + 4..meta.body.end)
        .into_iter()
        .find(|b| &b.fourcc == b"xml ")
        .unwrap();
    assert_eq!(&data[xml.body.start + 4..xml.body.start + 12], b"<asset/>");
    // empty sample tables in the init segment
    let stsz = find_all(
        &data,
        &[b"moov", b"trak", b"mdia", b"minf", b"stbl"],
        b"stsz",
    )[0]
    .clone();
    assert_eq!(be_u32(&data, stsz.start + 8), 0);
}

#[test]
fn fragmented_avc_truns_start_on_sync() {
    let cfg = MuxConfig {
        frag: Some(FragOptions {
            frag_min_ms: 50,
            frag_max_ms: 200,
            ..Default::default()
        }),
        ..Default::default()
    };
    let data = mux_to_vec(cfg, Codec::Avc, avc_three_gops());

    // every moof sequence number increases from 1
    let mut seq = 0u32;
    for moof in find_all(&data, &[], b"moof") {
        let mfhd = children(&data, moof.clone())
            .into_iter()
            .find(|b| &b.fourcc == b"mfhd")
            .unwrap();
        let n = be_u32(&data, mfhd.body.start + 4);
        assert_eq!(n, seq + 1);
        seq = n;

        // trun sample count matches the mdat payload via sizes
        let traf = children(&data, moof)
            .into_iter()
            .find(|b| &b.fourcc == b"traf")
            .unwrap();
        let trun = children(&data, traf.body)
            .into_iter()
            .find(|b| &b.fourcc == b"trun")
            .unwrap();
        assert!(be_u32(&data, trun.body.start + 4) > 0);
    }
    assert!(seq >= 1);
}
