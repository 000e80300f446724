//! Typed muxer configuration.
//!
//! Every knob of the muxer is an explicit field on one of these
//! structs; there are no global flag words. All of them deserialize
//! from a JSON job description.

use serde::Deserialize;

/// Movie-level options for classical and fragmented output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxOptions {
    /// Write an `iods` initial object descriptor.
    pub write_iods: bool,
    /// Write a `pdin` progressive-download hint box.
    pub write_pdin: bool,
    /// Write a CFF `bloc` base-location box.
    pub write_bloc: bool,
    /// Write a CFF `ainf` asset-information box.
    pub write_ainf: bool,
    /// Write a `free` box of this many bytes after `ftyp` (0 = none).
    pub free_box_size: u32,
    /// Use `ctts` version 1 (signed offsets, base-subtracted).
    pub ctts_v1: bool,
    /// Use `subs` version 1 (32-bit subsample sizes).
    pub subs_v1: bool,
    /// Write `stss` (ignored when every sample is a sync sample).
    pub write_stss: bool,
    /// Force 64-bit chunk offsets (`co64`); auto-upgraded when needed.
    pub co64: bool,
    /// Chunk span in milliseconds; a chunk never crosses this window.
    pub chunk_span_ms: u32,
    /// Maximum chunk payload in bytes.
    pub max_chunk_size: u32,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            write_iods: false,
            write_pdin: false,
            write_bloc: false,
            write_ainf: false,
            free_box_size: 0,
            ctts_v1: false,
            subs_v1: false,
            write_stss: true,
            co64: false,
            chunk_span_ms: 1000,
            max_chunk_size: 1024 * 1024,
        }
    }
}

/// Fragmentation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragStyle {
    #[default]
    Default,
    /// Common File Format: forces per-sample duration/size/data-offset
    /// in video and subtitle `trun`s.
    Ccff,
}

/// Options for fragmented output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragOptions {
    pub style: FragStyle,
    /// Minimum fragment duration in milliseconds.
    pub frag_min_ms: u32,
    /// Maximum fragment duration in milliseconds.
    pub frag_max_ms: u32,
    /// Fail when a fragment cannot begin at a sync sample.
    pub require_first_is_sync: bool,
    /// Write a `styp` before each `moof`.
    pub write_styp: bool,
    /// Write `tfdt` decode-time boxes.
    pub write_tfdt: bool,
    /// Write an `sdtp` box inside each `traf`.
    pub write_sdtp: bool,
    /// Write `senc` sample-encryption boxes (when encrypted).
    pub write_senc: bool,
    /// Write CFF `trik` trick-play boxes.
    pub write_trik: bool,
    /// Write CFF `avcn` NAL-storage boxes.
    pub write_avcn: bool,
    /// Write `tfra` entries even for all-sync tracks.
    pub force_tfra: bool,
    /// Never write `base_data_offset` in `tfhd`.
    pub no_bdo_in_tfhd: bool,
    /// Suppress `trex` defaults (defaults appear per `trun` row).
    pub empty_trex: bool,
    /// Suppress `tfhd` defaults.
    pub empty_tfhd: bool,
    /// One `tfra` entry per `traf` instead of one per sync sample.
    pub one_tfra_entry_per_traf: bool,
    /// Write a back-patched `sidx` per track.
    pub write_sidx: bool,
    /// Set the default-base-is-moof `tfhd` flag.
    pub default_base_is_moof: bool,
    /// Close the file with an `mfra`.
    pub write_mfra: bool,
    /// Always write `sample_description_index` in `tfhd`.
    pub force_tfhd_sampdescidx: bool,
    /// Use `trun` version 0 even when `ctts` version 1 is enabled.
    pub force_trun_v0: bool,
}

impl Default for FragOptions {
    fn default() -> Self {
        Self {
            style: FragStyle::Default,
            frag_min_ms: 1000,
            frag_max_ms: 4000,
            require_first_is_sync: false,
            write_styp: false,
            write_tfdt: true,
            write_sdtp: false,
            write_senc: true,
            write_trik: false,
            write_avcn: false,
            force_tfra: false,
            no_bdo_in_tfhd: true,
            empty_trex: false,
            empty_tfhd: false,
            one_tfra_entry_per_traf: false,
            write_sidx: true,
            default_base_is_moof: true,
            write_mfra: false,
            force_tfhd_sampdescidx: false,
            force_trun_v0: false,
        }
    }
}

/// Common Encryption flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncStyle {
    #[default]
    Cenc,
    Piff,
}

/// Per-track encryption parameters. The AES-CTR primitive itself is
/// supplied by the caller as a [`crate::BlockEncryptor`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncOptions {
    pub style: EncStyle,
    /// IV size in bytes: 8 or 16.
    pub iv_size: u8,
    /// Default key identifier written into `tenc`.
    pub key_id: [u8; 16],
}

impl Default for EncOptions {
    fn default() -> Self {
        Self {
            style: EncStyle::Cenc,
            iv_size: 8,
            key_id: [0; 16],
        }
    }
}

/// Per-track configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Explicit track ID; allocated sequentially when absent.
    pub track_id: Option<u32>,
    /// ISO-639-2/T language code.
    pub language: String,
    /// Rescale every incoming timestamp to this timescale.
    pub warp_media_timescale: Option<u32>,
    pub alternate_group: u16,
    /// Matrix translation for text tracks, in pixels.
    pub translation: (i16, i16),
    pub chunk_span_ms: Option<u32>,
    pub max_chunk_size: Option<u32>,
    pub enc: Option<EncOptions>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            track_id: None,
            language: "und".into(),
            warp_media_timescale: None,
            alternate_group: 0,
            translation: (0, 0),
            chunk_span_ms: None,
            max_chunk_size: None,
            enc: None,
        }
    }
}

/// Top-level muxer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// `ftyp` major brand.
    pub major_brand: String,
    pub minor_version: u32,
    pub compatible_brands: Vec<String>,
    /// Movie timescale; defaults to the first track's media timescale.
    pub movie_timescale: Option<u32>,
    pub options: MuxOptions,
    /// Fragmented output when set.
    pub frag: Option<FragOptions>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            major_brand: "mp42".into(),
            minor_version: 1,
            compatible_brands: vec!["mp42".into(), "isom".into()],
            movie_timescale: None,
            options: MuxOptions::default(),
            frag: None,
        }
    }
}

/// Rescale `value` from `from` units per second to `to` units per
/// second, rounding down.
pub fn rescale_u64(value: u64, to: u32, from: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    value * to as u64 / from as u64
}
