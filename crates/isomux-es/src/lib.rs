//! Elementary-stream parsers for isomux.
//!
//! Each parser consumes a coded byte stream through a state machine,
//! detects access-unit / frame boundaries, parses the codec
//! configuration headers, derives timing, and emits normalized
//! [`Sample`]s plus an ordered list of decoder-specific-information
//! entries.
//!
//! Supported streams: H.264/AVC Annex-B (`avc`), AAC ADTS (`aac`),
//! AC-3 and E-AC-3 (`ac3` / `ec3`).

pub mod aac;
pub mod avc;
pub mod dd;

use std::io::{Read, Seek};

use isomux_common::{DsiEntry, Error, Result, Sample, StreamInfo};

pub use aac::{AacParser, SignalingMode};
pub use avc::AvcParser;
pub use dd::DdParser;

/// A pull-mode elementary-stream parser.
///
/// `next_sample` returns `Ok(None)` at a clean end of stream. Stream
/// info and the DSI list are complete only once the stream has been
/// fully pulled (bitrates and substream inventories accumulate while
/// parsing).
pub trait ElementaryParser {
    fn next_sample(&mut self) -> Result<Option<Sample>>;

    fn stream_info(&self) -> StreamInfo;

    fn dsi_entries(&self) -> Vec<DsiEntry>;
}

/// Input codec selector for [`parser_for_codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Avc,
    Aac,
    Ac3,
    Eac3,
}

impl Codec {
    /// Parse a codec name as used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "avc" | "h264" => Some(Self::Avc),
            "aac" => Some(Self::Aac),
            "ac3" => Some(Self::Ac3),
            "ec3" | "eac3" => Some(Self::Eac3),
            _ => None,
        }
    }
}

/// One parser over one source, whichever codec it is.
///
/// This is the explicit factory table that replaces a process-wide
/// parser registry: callers name the codec, the muxer never relies on
/// registration side effects.
pub enum AnyParser<R> {
    Avc(AvcParser<R>),
    Aac(AacParser<R>),
    Dd(DdParser<R>),
}

impl<R: Read + Seek> AnyParser<R> {
    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        match self {
            Self::Avc(p) => p.next_sample(),
            Self::Aac(p) => p.next_sample(),
            Self::Dd(p) => p.next_sample(),
        }
    }

    pub fn stream_info(&self) -> StreamInfo {
        match self {
            Self::Avc(p) => p.stream_info(),
            Self::Aac(p) => p.stream_info(),
            Self::Dd(p) => p.stream_info(),
        }
    }

    pub fn dsi_entries(&self) -> Vec<DsiEntry> {
        match self {
            Self::Avc(p) => p.dsi_entries(),
            Self::Aac(p) => p.dsi_entries(),
            Self::Dd(p) => p.dsi_entries(),
        }
    }
}

impl<R: Read + Seek> ElementaryParser for AnyParser<R> {
    fn next_sample(&mut self) -> Result<Option<Sample>> {
        AnyParser::next_sample(self)
    }

    fn stream_info(&self) -> StreamInfo {
        AnyParser::stream_info(self)
    }

    fn dsi_entries(&self) -> Vec<DsiEntry> {
        AnyParser::dsi_entries(self)
    }
}

/// Build a parser for `codec` over `source`.
pub fn parser_for_codec<R: Read + Seek>(codec: Codec, source: R) -> AnyParser<R> {
    match codec {
        Codec::Avc => AnyParser::Avc(AvcParser::new(source)),
        Codec::Aac => AnyParser::Aac(AacParser::new(source)),
        Codec::Ac3 | Codec::Eac3 => AnyParser::Dd(DdParser::new(source)),
    }
}

/// Map a bit-reader error inside an RBSP or frame header to a
/// malformed-stream error with context.
pub(crate) fn es_err(ctx: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |_| Error::es(format!("truncated or malformed {ctx}"))
}
