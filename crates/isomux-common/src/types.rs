//! Small value types shared between the parsers and the muxer.

use std::fmt;

/// A four-character code as used for box types, brands, coding names,
/// and DSI tags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// Construct from a byte-string literal, e.g. `FourCc::new(b"avcC")`.
    pub const fn new(b: &[u8; 4]) -> Self {
        Self(*b)
    }

    /// The raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Parse from a 4-character string. Returns `None` for any other
    /// length or non-ASCII input.
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 4 || !s.is_ascii() {
            return None;
        }
        Some(Self([b[0], b[1], b[2], b[3]]))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

/// The broad media kind of a track, selecting handler type and media
/// header box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Text,
    Subtitle,
    Meta,
    Hint,
}

impl StreamKind {
    /// Handler type written into `hdlr`.
    pub fn handler_type(&self) -> FourCc {
        match self {
            Self::Video => FourCc::new(b"vide"),
            Self::Audio => FourCc::new(b"soun"),
            Self::Text => FourCc::new(b"text"),
            Self::Subtitle => FourCc::new(b"subt"),
            Self::Meta => FourCc::new(b"meta"),
            Self::Hint => FourCc::new(b"hint"),
        }
    }

    /// Handler name string written into `hdlr`.
    pub fn handler_name(&self) -> &'static str {
        match self {
            Self::Video => "VideoHandler",
            Self::Audio => "SoundHandler",
            Self::Text => "TextHandler",
            Self::Subtitle => "SubtitleHandler",
            Self::Meta => "MetaHandler",
            Self::Hint => "HintHandler",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio)
    }
}

/// A decoder-specific-information entry: a codec configuration blob
/// identified by its four-character tag (`avcC`, `esds` payload,
/// `dac3`, `dec3`, ...). Entries are stable once appended to a parser's
/// DSI list.
#[derive(Debug, Clone)]
pub struct DsiEntry {
    pub tag: FourCc,
    pub data: Vec<u8>,
}

impl DsiEntry {
    pub fn new(tag: FourCc, data: Vec<u8>) -> Self {
        Self { tag, data }
    }
}

/// Stream-level properties a parser exposes to the muxer. Everything a
/// sample entry and the track headers need, in one place.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub kind: StreamKind,
    /// Sample entry coding name (`avc1`, `mp4a`, `ac-3`, `ec-3`, ...).
    pub coding_name: FourCc,
    /// Media timescale the parser's timestamps are expressed in.
    pub time_scale: u32,
    /// Audio sample rate (0 for video).
    pub sample_rate: u32,
    /// Audio channel count (0 for video).
    pub channel_count: u16,
    /// Visual width/height after cropping (0 for audio).
    pub width: u32,
    pub height: u32,
    /// Pixel aspect ratio; (0, 0) when unknown.
    pub par: (u32, u32),
    /// Colour description (primaries, transfer, matrix); None when the
    /// stream did not signal one.
    pub colour: Option<(u16, u16, u16)>,
    /// Average bitrate in bits per second.
    pub bit_rate: u32,
    /// Peak bitrate in bits per second.
    pub max_bit_rate: u32,
    /// Decoder buffer size in bits (esds `bufferSizeDB` is bytes; this
    /// is bits, converted at write time).
    pub buffer_size_db: u32,
    /// MPEG-4 objectTypeIndication for `esds`-carried codecs (0x40 for
    /// AAC); 0 when not applicable.
    pub object_type_indication: u8,
}

impl StreamInfo {
    /// A neutral audio descriptor, filled in by parsers.
    pub fn audio(coding_name: FourCc) -> Self {
        Self {
            kind: StreamKind::Audio,
            coding_name,
            time_scale: 0,
            sample_rate: 0,
            channel_count: 0,
            width: 0,
            height: 0,
            par: (0, 0),
            colour: None,
            bit_rate: 0,
            max_bit_rate: 0,
            buffer_size_db: 0,
            object_type_indication: 0,
        }
    }

    /// A neutral video descriptor, filled in by parsers.
    pub fn video(coding_name: FourCc) -> Self {
        Self {
            kind: StreamKind::Video,
            ..Self::audio(coding_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        let cc = FourCc::new(b"avcC");
        assert_eq!(cc.to_string(), "avcC");
        assert_eq!(FourCc::parse("mp4a"), Some(FourCc::new(b"mp4a")));
        assert_eq!(FourCc::parse("toolong"), None);
    }

    #[test]
    fn handler_types() {
        assert_eq!(StreamKind::Video.handler_type(), FourCc::new(b"vide"));
        assert_eq!(StreamKind::Audio.handler_type(), FourCc::new(b"soun"));
        assert!(StreamKind::Audio.is_audio());
        assert!(!StreamKind::Audio.is_video());
    }
}
