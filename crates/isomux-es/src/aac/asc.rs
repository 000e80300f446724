//! AudioSpecificConfig (ISO/IEC 14496-3 section 1.6.2.1) model, reader, and
//! writer, including the program config element and SBR/PS signaling.

use std::io::Cursor;

use isomux_common::{Error, Result};
use isomux_io::{BitReader, BitWriter};

use crate::es_err;

pub const AOT_AAC_MAIN: u8 = 1;
pub const AOT_AAC_LC: u8 = 2;
pub const AOT_AAC_SSR: u8 = 3;
pub const AOT_AAC_LTP: u8 = 4;
pub const AOT_SBR: u8 = 5;
pub const AOT_AAC_SCALABLE: u8 = 6;
pub const AOT_ER_AAC_LC: u8 = 17;
pub const AOT_ER_AAC_LTP: u8 = 19;
pub const AOT_ER_AAC_SCALABLE: u8 = 20;
pub const AOT_ER_BSAC: u8 = 22;
pub const AOT_ER_AAC_LD: u8 = 23;
pub const AOT_PS: u8 = 29;

/// MPEG-4 audio profile-level indications.
pub const AAC_PROFILE_LEVEL_2: u8 = 0x29;
pub const AAC_PROFILE_LEVEL_4: u8 = 0x2A;
pub const AAC_PROFILE_LEVEL_5: u8 = 0x2B;
pub const HEAAC_PROFILE_LEVEL_2: u8 = 0x2C;
pub const HEAAC_PROFILE_LEVEL_4: u8 = 0x2E;
pub const HEAAC_PROFILE_LEVEL_5: u8 = 0x2F;
pub const HEAACV2_PROFILE_LEVEL_2: u8 = 0x30;

/// samplingFrequencyIndex to rate (ISO/IEC 14496-3 section 1.6.3.4).
pub const SFI_TO_FREQ: [u32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0, 0,
    0,
];

/// SBR sync extension and PS sync extension codes.
const SYNC_EXT_SBR: u32 = 0x2b7;
const SYNC_EXT_PS: u32 = 0x548;

/// How SBR/PS capability is expressed in the written ASC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingMode {
    /// Plain AAC-LC signaling, SBR/PS implied by the stream.
    #[default]
    Implicit,
    /// Backward-compatible SBR via the 0x2b7 sync extension.
    SbrBackward,
    /// Non-backward-compatible: AOT 5 up front.
    SbrNonBackward,
    /// Backward-compatible PS via 0x2b7 + 0x548.
    PsBackward,
    /// Non-backward-compatible: AOT 29 up front.
    PsNonBackward,
}

/// One front/side/back/cc channel element of a PCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PceElement {
    pub is_cpe: bool,
    pub tag: u8,
}

/// Program config element fields, present when
/// `channel_configuration == 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramConfig {
    pub element_instance_tag: u8,
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub front: Vec<PceElement>,
    pub side: Vec<PceElement>,
    pub back: Vec<PceElement>,
    pub lfe_tags: Vec<u8>,
    pub assoc_data_tags: Vec<u8>,
    pub cc: Vec<PceElement>,
    pub mono_mixdown: Option<u8>,
    pub stereo_mixdown: Option<u8>,
    /// (matrix_mixdown_idx, pseudo_surround_enable)
    pub matrix_mixdown: Option<(u8, bool)>,
    pub comment: Vec<u8>,
}

impl ProgramConfig {
    /// Channel count contributed by the PCE elements.
    pub fn channel_count(&self) -> u32 {
        let pairs = |els: &[PceElement]| {
            els.iter().map(|e| if e.is_cpe { 2u32 } else { 1 }).sum::<u32>()
        };
        pairs(&self.front) + pairs(&self.side) + pairs(&self.back) + self.lfe_tags.len() as u32
    }
}

/// The full AudioSpecificConfig field matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AacDsi {
    pub audio_object_type: u8,
    pub audio_object_type_ext: u8,
    /// AOT after the SBR/PS extension pair (non-backward signaling).
    pub audio_object_type2: u8,
    pub audio_object_type_ext2: u8,
    /// AOT of the sync extension (backward-compatible signaling).
    pub extension_audio_object_type: u8,
    pub extension_audio_object_type_ext: u8,

    pub sampling_frequency_index: u8,
    pub sampling_frequency: u32,
    pub sbr_sampling_frequency_index: u8,
    pub sbr_sampling_frequency: u32,

    pub channel_configuration: u8,
    pub extension_channel_configuration: u8,
    pub channel_count: u8,

    pub frame_length_flag: bool,
    pub depends_on_core_coder: bool,
    pub core_coder_delay: u16,
    pub extension_flag: bool,
    pub extension_flag3: bool,

    pub has_sbr: bool,
    pub has_ps: bool,
    pub have_sbr_ext: bool,
    pub have_ps_ext: bool,

    pub pce: Option<ProgramConfig>,

    /// esds bookkeeping, bits.
    pub buffer_size_db: u32,
    pub avg_bitrate: u32,
    pub max_bitrate: u32,
}

fn read_aot(r: &mut BitReader<Cursor<&[u8]>>) -> Result<(u8, u8)> {
    let aot = r.read_bits(5).map_err(es_err("asc"))? as u8;
    if aot == 31 {
        let ext = r.read_bits(6).map_err(es_err("asc"))? as u8;
        Ok((aot, ext))
    } else {
        Ok((aot, 0))
    }
}

fn effective_aot(aot: u8, ext: u8) -> u8 {
    if aot == 31 {
        32 + ext
    } else {
        aot
    }
}

fn write_aot(w: &mut BitWriter, aot: u8, ext: u8) {
    w.write_bits(5, aot as u32);
    if aot == 31 {
        w.write_bits(6, ext as u32);
    }
}

fn read_sampling_frequency(r: &mut BitReader<Cursor<&[u8]>>) -> Result<(u8, u32)> {
    let index = r.read_bits(4).map_err(es_err("asc"))? as u8;
    let freq = if index == 0xf {
        r.read_bits(24).map_err(es_err("asc"))?
    } else {
        SFI_TO_FREQ[index as usize]
    };
    Ok((index, freq))
}

fn write_sampling_frequency(w: &mut BitWriter, index: u8, freq: u32) {
    w.write_bits(4, index as u32);
    if index == 0xf {
        w.write_bits(24, freq);
    }
}

fn read_pce_elements(
    r: &mut BitReader<Cursor<&[u8]>>,
    count: usize,
) -> Result<Vec<PceElement>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let is_cpe = r.read_bool().map_err(es_err("pce"))?;
        let tag = r.read_bits(4).map_err(es_err("pce"))? as u8;
        out.push(PceElement { is_cpe, tag });
    }
    Ok(out)
}

fn write_pce_elements(w: &mut BitWriter, els: &[PceElement]) {
    for e in els {
        w.write_bool(e.is_cpe);
        w.write_bits(4, e.tag as u32);
    }
}

impl AacDsi {
    /// Parse a raw AudioSpecificConfig.
    pub fn parse(asc: &[u8]) -> Result<Self> {
        let mut r = BitReader::from_slice(asc);
        let mut dsi = AacDsi::default();

        let (aot, ext) = read_aot(&mut r)?;
        dsi.audio_object_type = aot;
        dsi.audio_object_type_ext = ext;
        let mut aot_eff = effective_aot(aot, ext);

        let (sfi, freq) = read_sampling_frequency(&mut r)?;
        dsi.sampling_frequency_index = sfi;
        dsi.sampling_frequency = freq;

        dsi.channel_configuration = r.read_bits(4).map_err(es_err("asc"))? as u8;

        let mut extension_aot = 0u8;
        if aot_eff == AOT_SBR || aot_eff == AOT_PS {
            extension_aot = AOT_SBR;
            dsi.has_sbr = true;
            if aot_eff == AOT_PS {
                dsi.has_ps = true;
            }
            let (i, f) = read_sampling_frequency(&mut r)?;
            dsi.sbr_sampling_frequency_index = i;
            dsi.sbr_sampling_frequency = f;
            let (a2, e2) = read_aot(&mut r)?;
            dsi.audio_object_type2 = a2;
            dsi.audio_object_type_ext2 = e2;
            aot_eff = effective_aot(a2, e2);
            if aot_eff == AOT_ER_BSAC {
                dsi.extension_channel_configuration =
                    r.read_bits(4).map_err(es_err("asc"))? as u8;
            }
        }

        // GASpecificConfig
        dsi.frame_length_flag = r.read_bool().map_err(es_err("asc"))?;
        dsi.depends_on_core_coder = r.read_bool().map_err(es_err("asc"))?;
        if dsi.depends_on_core_coder {
            dsi.core_coder_delay = r.read_bits(14).map_err(es_err("asc"))? as u16;
        }
        dsi.extension_flag = r.read_bool().map_err(es_err("asc"))?;

        if dsi.channel_configuration == 0 {
            dsi.pce = Some(Self::parse_pce(&mut r)?);
            dsi.channel_count = dsi.pce.as_ref().unwrap().channel_count() as u8;
        } else {
            dsi.channel_count = dsi.channel_configuration;
        }

        if aot_eff == AOT_AAC_SCALABLE || aot_eff == AOT_ER_AAC_SCALABLE {
            r.read_bits(3).map_err(es_err("asc"))?; // layerNr
        }

        if dsi.extension_flag {
            if aot_eff == AOT_ER_BSAC {
                r.read_bits(5).map_err(es_err("asc"))?; // numOfSubFrame
                r.read_bits(11).map_err(es_err("asc"))?; // layer_length
            }
            if matches!(
                aot_eff,
                AOT_ER_AAC_LC | AOT_ER_AAC_LTP | AOT_ER_AAC_SCALABLE | AOT_ER_AAC_LD
            ) {
                r.read_bits(3).map_err(es_err("asc"))?; // resilience flags
            }
            dsi.extension_flag3 = r.read_bool().map_err(es_err("asc"))?;
        }

        // backward-compatible SBR/PS sync extension
        if extension_aot != AOT_SBR && r.remaining_bits().map_err(Error::from)? >= 11 {
            let sync = r.read_bits(11).map_err(es_err("asc"))?;
            dsi.have_sbr_ext = true;
            if sync == SYNC_EXT_SBR {
                let (a, e) = read_aot(&mut r)?;
                dsi.extension_audio_object_type = a;
                dsi.extension_audio_object_type_ext = e;
                if effective_aot(a, e) == AOT_SBR {
                    dsi.has_sbr = r.read_bool().map_err(es_err("asc"))?;
                    if dsi.has_sbr {
                        let (i, f) = read_sampling_frequency(&mut r)?;
                        dsi.sbr_sampling_frequency_index = i;
                        dsi.sbr_sampling_frequency = f;
                        if r.remaining_bits().map_err(Error::from)? >= 12 {
                            dsi.have_ps_ext = true;
                            let sync2 = r.read_bits(11).map_err(es_err("asc"))?;
                            if sync2 == SYNC_EXT_PS {
                                dsi.has_ps = r.read_bool().map_err(es_err("asc"))?;
                            }
                        }
                    }
                }
            }
        }

        Ok(dsi)
    }

    fn parse_pce(r: &mut BitReader<Cursor<&[u8]>>) -> Result<ProgramConfig> {
        let mut pce = ProgramConfig {
            element_instance_tag: r.read_bits(4).map_err(es_err("pce"))? as u8,
            object_type: r.read_bits(2).map_err(es_err("pce"))? as u8,
            sampling_frequency_index: r.read_bits(4).map_err(es_err("pce"))? as u8,
            ..ProgramConfig::default()
        };
        let num_front = r.read_bits(4).map_err(es_err("pce"))? as usize;
        let num_side = r.read_bits(4).map_err(es_err("pce"))? as usize;
        let num_back = r.read_bits(4).map_err(es_err("pce"))? as usize;
        let num_lfe = r.read_bits(2).map_err(es_err("pce"))? as usize;
        let num_assoc = r.read_bits(3).map_err(es_err("pce"))? as usize;
        let num_cc = r.read_bits(4).map_err(es_err("pce"))? as usize;

        if r.read_bool().map_err(es_err("pce"))? {
            pce.mono_mixdown = Some(r.read_bits(4).map_err(es_err("pce"))? as u8);
        }
        if r.read_bool().map_err(es_err("pce"))? {
            pce.stereo_mixdown = Some(r.read_bits(4).map_err(es_err("pce"))? as u8);
        }
        if r.read_bool().map_err(es_err("pce"))? {
            let idx = r.read_bits(2).map_err(es_err("pce"))? as u8;
            let pseudo = r.read_bool().map_err(es_err("pce"))?;
            pce.matrix_mixdown = Some((idx, pseudo));
        }

        pce.front = read_pce_elements(r, num_front)?;
        pce.side = read_pce_elements(r, num_side)?;
        pce.back = read_pce_elements(r, num_back)?;
        for _ in 0..num_lfe {
            pce.lfe_tags.push(r.read_bits(4).map_err(es_err("pce"))? as u8);
        }
        for _ in 0..num_assoc {
            pce.assoc_data_tags
                .push(r.read_bits(4).map_err(es_err("pce"))? as u8);
        }
        pce.cc = read_pce_elements(r, num_cc)?;

        r.byte_align();
        let comment_bytes = r.read_bits(8).map_err(es_err("pce"))? as usize;
        for _ in 0..comment_bytes {
            pce.comment.push(r.read_bits(8).map_err(es_err("pce"))? as u8);
        }
        Ok(pce)
    }

    /// Serialize the AudioSpecificConfig exactly as configured.
    pub fn write(&self) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(32);

        let aot_eff = effective_aot(self.audio_object_type, self.audio_object_type_ext);
        write_aot(&mut w, self.audio_object_type, self.audio_object_type_ext);
        write_sampling_frequency(&mut w, self.sampling_frequency_index, self.sampling_frequency);
        w.write_bits(4, self.channel_configuration as u32);

        let mut ext_aot = 0u8;
        if aot_eff == AOT_SBR || aot_eff == AOT_PS {
            // non-backward-compatible signaling
            ext_aot = AOT_SBR;
            write_sampling_frequency(
                &mut w,
                self.sbr_sampling_frequency_index,
                self.sbr_sampling_frequency,
            );
            write_aot(&mut w, self.audio_object_type2, self.audio_object_type_ext2);
            if effective_aot(self.audio_object_type2, self.audio_object_type_ext2) == AOT_ER_BSAC {
                w.write_bits(4, self.extension_channel_configuration as u32);
            }
        }

        w.write_bool(self.frame_length_flag);
        w.write_bool(self.depends_on_core_coder);
        if self.depends_on_core_coder {
            w.write_bits(14, self.core_coder_delay as u32);
        }
        w.write_bool(self.extension_flag);

        if self.channel_configuration == 0 {
            if let Some(pce) = &self.pce {
                Self::write_pce(&mut w, pce);
            }
        }

        if ext_aot != AOT_SBR && self.have_sbr_ext {
            w.write_bits(11, SYNC_EXT_SBR);
            write_aot(
                &mut w,
                self.extension_audio_object_type,
                self.extension_audio_object_type_ext,
            );
            let e = effective_aot(
                self.extension_audio_object_type,
                self.extension_audio_object_type_ext,
            );
            if e == AOT_SBR {
                w.write_bool(self.has_sbr);
                if self.has_sbr {
                    write_sampling_frequency(
                        &mut w,
                        self.sbr_sampling_frequency_index,
                        self.sbr_sampling_frequency,
                    );
                }
                if self.have_ps_ext {
                    w.write_bits(11, SYNC_EXT_PS);
                    w.write_bool(self.has_ps);
                }
            } else if e == AOT_ER_BSAC {
                w.write_bool(self.has_sbr);
                if self.has_sbr {
                    write_sampling_frequency(
                        &mut w,
                        self.sbr_sampling_frequency_index,
                        self.sbr_sampling_frequency,
                    );
                }
                w.write_bits(4, self.extension_channel_configuration as u32);
            }
        }

        w.into_vec()
    }

    fn write_pce(w: &mut BitWriter, pce: &ProgramConfig) {
        w.write_bits(4, pce.element_instance_tag as u32);
        w.write_bits(2, pce.object_type as u32);
        w.write_bits(4, pce.sampling_frequency_index as u32);
        w.write_bits(4, pce.front.len() as u32);
        w.write_bits(4, pce.side.len() as u32);
        w.write_bits(4, pce.back.len() as u32);
        w.write_bits(2, pce.lfe_tags.len() as u32);
        w.write_bits(3, pce.assoc_data_tags.len() as u32);
        w.write_bits(4, pce.cc.len() as u32);

        match pce.mono_mixdown {
            Some(n) => {
                w.write_bit(1);
                w.write_bits(4, n as u32);
            }
            None => w.write_bit(0),
        }
        match pce.stereo_mixdown {
            Some(n) => {
                w.write_bit(1);
                w.write_bits(4, n as u32);
            }
            None => w.write_bit(0),
        }
        match pce.matrix_mixdown {
            Some((idx, pseudo)) => {
                w.write_bit(1);
                w.write_bits(2, idx as u32);
                w.write_bool(pseudo);
            }
            None => w.write_bit(0),
        }

        write_pce_elements(w, &pce.front);
        write_pce_elements(w, &pce.side);
        write_pce_elements(w, &pce.back);
        for t in &pce.lfe_tags {
            w.write_bits(4, *t as u32);
        }
        for t in &pce.assoc_data_tags {
            w.write_bits(4, *t as u32);
        }
        write_pce_elements(w, &pce.cc);
        w.flush_bits();
        w.write_u8(pce.comment.len() as u8);
        for b in &pce.comment {
            w.write_u8(*b);
        }
    }

    /// Rewrite only the DSI signaling fields; stream content is
    /// untouched.
    pub fn set_signaling_mode(&mut self, mode: SignalingMode) {
        match mode {
            SignalingMode::SbrNonBackward => {
                self.audio_object_type = if self.has_sbr { AOT_SBR } else { AOT_AAC_LC };
                self.audio_object_type2 = AOT_AAC_LC;
                self.audio_object_type_ext2 = 0;
            }
            SignalingMode::PsNonBackward => {
                self.audio_object_type = if self.has_ps {
                    AOT_PS
                } else if self.has_sbr {
                    AOT_SBR
                } else {
                    AOT_AAC_LC
                };
                self.audio_object_type2 = AOT_AAC_LC;
                self.audio_object_type_ext2 = 0;
            }
            SignalingMode::SbrBackward | SignalingMode::PsBackward => {
                self.audio_object_type = AOT_AAC_LC;
                self.audio_object_type_ext = 0;
                self.extension_audio_object_type = AOT_SBR;
                self.extension_audio_object_type_ext = 0;
                self.have_sbr_ext = true;
                self.have_ps_ext = mode == SignalingMode::PsBackward;
            }
            SignalingMode::Implicit => {
                self.audio_object_type = AOT_AAC_LC;
                self.audio_object_type_ext = 0;
                self.have_sbr_ext = false;
                self.have_ps_ext = false;
            }
        }
    }

    /// MPEG-4 audio profile-level indication from channel count,
    /// sample rate, and SBR/PS presence.
    pub fn profile_level_id(&self, sample_rate: u32) -> u8 {
        let channels = self.channel_configuration;
        if self.has_sbr {
            if self.has_ps {
                HEAACV2_PROFILE_LEVEL_2
            } else if sample_rate > 48000 {
                HEAAC_PROFILE_LEVEL_5
            } else if channels <= 2 {
                HEAAC_PROFILE_LEVEL_2
            } else {
                HEAAC_PROFILE_LEVEL_4
            }
        } else if sample_rate > 48000 {
            AAC_PROFILE_LEVEL_5
        } else if channels <= 2 {
            AAC_PROFILE_LEVEL_2
        } else {
            AAC_PROFILE_LEVEL_4
        }
    }
}
