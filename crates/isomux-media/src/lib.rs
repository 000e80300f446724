//! ISO-BMFF box serialization, track model, fragmenter, and muxer.
//!
//! The muxer accepts configured tracks and normalized samples, and
//! writes classical (`moov + mdat`) or fragmented
//! (`moof + mdat + mfra/sidx`) files:
//!
//! - `track` - per-track sample-table accounting and payload spill
//! - `sample_table` - reduction of per-sample values to `stts`/`stsc`/...
//! - `boxes` - size-prefixed box writers for the full hierarchy
//! - `fragment` - fragment-boundary selection and `moof` emission
//! - `muxer` - the orchestrator driving all of the above
//! - `bitrate` - AAC/MP4V peak and average bitrate finalization

pub mod bitrate;
pub mod boxes;
pub mod config;
pub mod fragment;
pub mod muxer;
pub mod sample_table;
pub mod track;

pub use boxes::enc::{BlockEncryptor, EncInfo};
pub use boxes::meta::{MetaData, MetaItem};
pub use config::{EncOptions, EncStyle, FragOptions, FragStyle, MuxConfig, MuxOptions, TrackConfig};
pub use muxer::Muxer;
pub use track::Track;
