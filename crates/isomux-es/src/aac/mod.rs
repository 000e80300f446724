//! AAC ADTS elementary-stream parser.
//!
//! Locates ADTS syncwords, validates the sync against the following
//! frame, and emits one raw_data_block per sample with the ADTS header
//! stripped. Multiple raw data blocks per ADTS frame are rejected.
//! A sampling-frequency-index change is fatal; any other configuration
//! change opens a new sample description.

pub mod asc;

use std::io::{Read, Seek, SeekFrom};

use isomux_common::{DsiEntry, Error, FourCc, Result, Sample, SampleFlags, StreamInfo};
use isomux_io::BitReader;

pub use asc::{AacDsi, SignalingMode};
use asc::SFI_TO_FREQ;

/// Result of an ADTS header scan.
enum SyncResult {
    Found,
    EndOfData,
    MultiBlock,
}

/// AAC ADTS elementary-stream parser.
pub struct AacParser<R> {
    r: BitReader<R>,

    // current ADTS header
    id_mpeg2: bool,
    protection_absent: bool,
    profile_object_type: u32,
    sampling_frequency_index: u32,
    channel_configuration: u32,
    raw_block_positions: [u16; 5],
    num_raw_data_blocks: u32,
    frame_length_remain: i64,
    frame_size: u32,

    sample_num: u64,
    samples_per_frame: u32,
    sample_rate: u32,
    time_scale: u32,
    channel_count: u32,
    buffer_size_db: u32,
    dts: u64,

    dsi: AacDsi,
    dsi_entries: Vec<DsiEntry>,
    signaling: SignalingMode,
    conformance: Option<FourCc>,
}

impl<R: Read + Seek> AacParser<R> {
    pub fn new(src: R) -> Self {
        Self {
            r: BitReader::new(src),
            id_mpeg2: false,
            protection_absent: true,
            profile_object_type: 0,
            sampling_frequency_index: 0,
            channel_configuration: 0,
            raw_block_positions: [0; 5],
            num_raw_data_blocks: 0,
            frame_length_remain: 0,
            frame_size: 0,
            sample_num: 0,
            samples_per_frame: 1024,
            sample_rate: 0,
            time_scale: 0,
            channel_count: 0,
            buffer_size_db: 0,
            dts: 0,
            dsi: AacDsi::default(),
            dsi_entries: Vec::new(),
            signaling: SignalingMode::Implicit,
            conformance: None,
        }
    }

    /// Choose how SBR/PS is expressed in the written ASC. Only DSI
    /// fields change; stream content is untouched.
    pub fn set_signaling_mode(&mut self, mode: SignalingMode) {
        self.signaling = mode;
        self.dsi.set_signaling_mode(mode);
    }

    pub fn signaling_mode(&self) -> SignalingMode {
        self.signaling
    }

    /// Enable CFF conformance checking for the given brand
    /// (`cffs`/`cffh`); findings are warnings, never errors.
    pub fn set_conformance(&mut self, brand: FourCc) {
        self.conformance = Some(brand);
    }

    pub fn stream_info(&self) -> StreamInfo {
        let mut info = StreamInfo::audio(FourCc::new(b"mp4a"));
        info.time_scale = self.time_scale;
        info.sample_rate = self.sample_rate;
        info.channel_count = self.channel_count as u16;
        info.buffer_size_db = self.buffer_size_db;
        info.bit_rate = self.dsi.avg_bitrate;
        info.max_bit_rate = self.dsi.max_bitrate;
        info.object_type_indication = 0x40;
        info
    }

    pub fn dsi_entries(&self) -> Vec<DsiEntry> {
        self.dsi_entries.clone()
    }

    /// Current DSI, for bitrate finalization by the muxer.
    pub fn dsi_mut(&mut self) -> &mut AacDsi {
        &mut self.dsi
    }

    /// Scan to the next ADTS header and parse it, double-checking the
    /// sync against the frame that follows.
    fn adts_header(&mut self) -> Result<SyncResult> {
        loop {
            if self.r.is_eod().map_err(Error::from)? {
                return Ok(SyncResult::EndOfData);
            }
            let pos_sync = self.r.position()?;

            let mut b = [0u8; 1];
            if self.r.read_some(&mut b)? == 0 {
                return Ok(SyncResult::EndOfData);
            }
            if b[0] != 0xff {
                continue;
            }
            if self.r.read_bits(4).map_err(|_| Error::EndOfStream)? != 0x0f {
                self.r.byte_align();
                continue;
            }

            let hdr = |e: std::io::Error| -> Error {
                let _ = e;
                Error::EndOfStream
            };
            self.id_mpeg2 = self.r.read_bool().map_err(hdr)?;
            self.r.skip_bits(2)?; // layer
            self.protection_absent = self.r.read_bool().map_err(hdr)?;
            self.profile_object_type = self.r.read_bits(2).map_err(hdr)?;
            self.sampling_frequency_index = self.r.read_bits(4).map_err(hdr)?;
            self.r.skip_bits(1)?; // private_bit
            self.channel_configuration = self.r.read_bits(3).map_err(hdr)?;
            self.r.skip_bits(2)?; // original_copy, home

            if self.channel_configuration == 0 {
                // in-band PCE carries the real layout; assume 5.1
                tracing::warn!("adts channel_configuration is 0, overriding to 6");
                self.channel_configuration = 6;
            }

            self.r.skip_bits(2)?; // copyright id bit/start
            let mut len_remain = self.r.read_bits(13).map_err(hdr)? as i64;
            self.r.skip_bits(11)?; // adts_buffer_fullness
            self.num_raw_data_blocks = self.r.read_bits(2).map_err(hdr)?;

            len_remain -= 7;
            if self.num_raw_data_blocks == 0 {
                if !self.protection_absent {
                    self.r.skip_bytes(2)?;
                    len_remain -= 2;
                }
            } else if !self.protection_absent {
                for i in 1..=self.num_raw_data_blocks as usize {
                    self.raw_block_positions[i] = self.r.read_u16().map_err(hdr)?;
                }
                self.r.skip_bytes(2)?;
                len_remain -= 2 * (self.num_raw_data_blocks as i64 + 1);
            } else {
                // assume equal-size raw data blocks
                self.frame_size = (len_remain / (self.num_raw_data_blocks as i64 + 1)) as u32;
            }

            if len_remain < 0 {
                self.r.seek(SeekFrom::Start(pos_sync + 1))?;
                continue;
            }

            // double check: the next frame must start with a syncword
            let here = self.r.position()?;
            let total = self.r.size()?;
            if total - here != len_remain as u64 {
                if total - here < len_remain as u64 + 2 {
                    return Ok(SyncResult::EndOfData);
                }
                self.r.skip_bytes(len_remain)?;
                let b = self.r.read_u8().map_err(|_| Error::EndOfStream)?;
                if b != 0xff {
                    self.r.seek(SeekFrom::Start(pos_sync + 1))?;
                    continue;
                }
                if self.r.read_bits(4).map_err(|_| Error::EndOfStream)? != 0x0f {
                    self.r.seek(SeekFrom::Start(pos_sync + 2))?;
                    continue;
                }
                self.r.seek(SeekFrom::Start(here))?;
            }

            if self.num_raw_data_blocks != 0 {
                // multiple AAC frames per ADTS frame need decoder help
                return Ok(SyncResult::MultiBlock);
            }

            self.frame_length_remain = len_remain;
            return Ok(SyncResult::Found);
        }
    }

    /// Rebuild the current DSI from the ADTS header fields.
    fn init_dsi(&mut self) {
        if self.id_mpeg2 {
            tracing::warn!("adts ID=1 (MPEG-2 profile) not fully supported");
        }
        if self.profile_object_type == 2 {
            tracing::warn!("profile_ObjectType 2 (AAC SSR) not fully supported");
        }

        self.samples_per_frame = 1024 * (self.num_raw_data_blocks + 1);
        self.sample_rate = SFI_TO_FREQ[self.sampling_frequency_index as usize];
        self.time_scale = self.sample_rate;
        if self.num_raw_data_blocks > 0 && !self.protection_absent {
            self.frame_size =
                (self.raw_block_positions[1] - self.raw_block_positions[0]) as u32 - 2;
        }
        self.channel_count = self.channel_configuration;

        // 5.1 / 7.1 buffers exclude the LFE channel
        self.buffer_size_db = if self.channel_count == 6 || self.channel_count == 8 {
            (self.channel_count - 1) * 768 * 8
        } else {
            self.channel_count * 768 * 8
        };

        self.dsi.audio_object_type = self.profile_object_type as u8 + 1;
        self.dsi.sampling_frequency_index = self.sampling_frequency_index as u8;
        self.dsi.sampling_frequency = self.sample_rate;
        self.dsi.channel_configuration = self.channel_configuration as u8;
        self.dsi.channel_count = self.channel_count as u8;
        self.dsi.buffer_size_db = self.buffer_size_db;

        if let Some(brand) = self.conformance {
            if brand == FourCc::new(b"cffs") || brand == FourCc::new(b"cffh") {
                if self.dsi.audio_object_type != 2 {
                    tracing::warn!("cff: wrong audio object type, expecting AOT 2");
                }
                if self.sample_rate != 48000 {
                    tracing::warn!("cff: wrong sample rate, expecting 48000");
                }
            }
        }
    }

    fn config_changed(&self) -> bool {
        self.dsi.audio_object_type != self.profile_object_type as u8 + 1
            || self.dsi.sampling_frequency_index != self.sampling_frequency_index as u8
            || self.dsi.channel_configuration != self.channel_configuration as u8
            || self.dsi.buffer_size_db != self.buffer_size_db_for_current()
    }

    fn buffer_size_db_for_current(&self) -> u32 {
        let ch = self.channel_configuration;
        if ch == 6 || ch == 8 {
            (ch - 1) * 768 * 8
        } else {
            ch * 768 * 8
        }
    }

    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        let mut flags = SampleFlags::empty();

        if self.r.is_eod().map_err(Error::from)? && self.frame_length_remain == 0 {
            return Ok(None);
        }

        if self.frame_length_remain == 0 {
            match self.adts_header()? {
                SyncResult::MultiBlock => {
                    return Err(Error::unsupported(
                        "multiple AAC frames per ADTS frame",
                    ))
                }
                SyncResult::EndOfData => return Ok(None),
                SyncResult::Found => {}
            }
        }

        if self.sample_num == 0 {
            self.init_dsi();
            flags.insert(SampleFlags::NEW_SD);
            self.dsi_entries
                .push(DsiEntry::new(FourCc::new(b"esds"), self.dsi.write()));
        } else if self.config_changed() {
            if self.dsi.sampling_frequency_index != self.sampling_frequency_index as u8 {
                return Err(Error::ConfigChange(
                    "change in AAC sampling rate is not allowed".into(),
                ));
            }
            // new sample description for the new configuration
            self.init_dsi();
            flags.insert(SampleFlags::NEW_SD);
            self.dsi_entries
                .push(DsiEntry::new(FourCc::new(b"esds"), self.dsi.write()));
        }

        flags.insert(SampleFlags::SYNC); // all audio samples are sync frames
        if self.sample_num != 0 {
            self.dts += self.samples_per_frame as u64;
        }

        self.frame_size = self.frame_length_remain as u32;
        self.frame_length_remain = 0;

        let mut data = vec![0u8; self.frame_size as usize];
        let pos = self.r.position()?;
        self.r.read_bytes(&mut data).map_err(|_| Error::EndOfStream)?;

        self.sample_num += 1;

        Ok(Some(Sample {
            dts: self.dts,
            cts: self.dts,
            duration: self.samples_per_frame,
            size: self.frame_size,
            pos: pos as i64,
            flags,
            data,
            ..Sample::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build one ADTS frame (protection absent) around `payload`.
    fn adts_frame(sfi: u32, channels: u32, payload: &[u8]) -> Vec<u8> {
        let frame_len = 7 + payload.len() as u32;
        let mut out = Vec::new();
        out.push(0xff);
        out.push(0xf1); // MPEG-4, layer 0, protection absent
        out.push(((1 << 6) | (sfi << 2) | (channels >> 2)) as u8); // AOT 2 => profile 1
        out.push((((channels & 0x3) << 6) | (frame_len >> 11)) as u8);
        out.push(((frame_len >> 3) & 0xff) as u8);
        out.push((((frame_len & 0x7) << 5) | 0x1f) as u8);
        out.push(0xfc); // buffer fullness + 0 raw blocks
        out.extend_from_slice(payload);
        out
    }

    fn parse_all(stream: Vec<u8>) -> Vec<Sample> {
        let mut p = AacParser::new(Cursor::new(stream));
        let mut out = Vec::new();
        while let Some(s) = p.next_sample().unwrap() {
            out.push(s);
        }
        out
    }

    #[test]
    fn strips_adts_headers() {
        let mut stream = Vec::new();
        for i in 0..4u8 {
            stream.extend_from_slice(&adts_frame(3, 2, &vec![i; 100 + i as usize]));
        }
        let samples = parse_all(stream);
        assert_eq!(samples.len(), 4);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.size as usize, 100 + i);
            assert!(s.is_sync());
            assert_eq!(s.duration, 1024);
            assert_eq!(s.dts, i as u64 * 1024);
            assert_eq!(s.data[0], i as u8);
        }
        assert!(samples[0].is_new_sd());
        assert!(!samples[1].is_new_sd());
    }

    #[test]
    fn stream_info_and_dsi() {
        let mut stream = Vec::new();
        for _ in 0..2 {
            stream.extend_from_slice(&adts_frame(3, 2, &[0u8; 64]));
        }
        let mut p = AacParser::new(Cursor::new(stream));
        while p.next_sample().unwrap().is_some() {}
        let info = p.stream_info();
        assert_eq!(info.sample_rate, 48000);
        assert_eq!(info.time_scale, 48000);
        assert_eq!(info.channel_count, 2);
        assert_eq!(info.buffer_size_db, 2 * 768 * 8);
        assert_eq!(info.object_type_indication, 0x40);
        let dsi = p.dsi_entries();
        assert_eq!(dsi.len(), 1);
        assert_eq!(dsi[0].tag, FourCc::new(b"esds"));
        // ASC for LC 48 kHz stereo
        assert_eq!(dsi[0].data, vec![0x11, 0x90]);
    }

    #[test]
    fn resyncs_over_garbage() {
        let mut stream = vec![0x00, 0x12, 0xff, 0x01]; // junk, incl. a fake 0xff
        for _ in 0..2 {
            stream.extend_from_slice(&adts_frame(3, 2, &[0xAA; 32]));
        }
        let samples = parse_all(stream);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].size, 32);
    }

    #[test]
    fn sampling_rate_change_is_fatal() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&adts_frame(3, 2, &[0u8; 32]));
        stream.extend_from_slice(&adts_frame(4, 2, &[0u8; 32])); // 44.1 kHz
        let mut p = AacParser::new(Cursor::new(stream));
        assert!(p.next_sample().unwrap().is_some());
        assert!(matches!(p.next_sample(), Err(Error::ConfigChange(_))));
    }

    #[test]
    fn channel_change_opens_new_sd() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&adts_frame(3, 2, &[0u8; 32]));
        stream.extend_from_slice(&adts_frame(3, 1, &[0u8; 32]));
        let mut p = AacParser::new(Cursor::new(stream));
        let s0 = p.next_sample().unwrap().unwrap();
        assert!(s0.is_new_sd());
        let s1 = p.next_sample().unwrap().unwrap();
        assert!(s1.is_new_sd());
        assert_eq!(p.dsi_entries().len(), 2);
    }
}
