//! isomux: an ISO Base Media File Format multiplexer with built-in
//! elementary-stream parsers.
//!
//! The crates underneath do the work: `isomux-es` parses H.264/AVC,
//! AAC ADTS, and AC-3/E-AC-3 byte streams into normalized samples,
//! and `isomux-media` accounts them into sample tables and writes
//! classical or fragmented MP4. This facade wires a set of input
//! streams through the parsers into the muxer with one call:
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use isomux::{run, Codec, InputStream, MuxConfig, TrackConfig};
//!
//! # fn main() -> isomux::Result<()> {
//! let input = InputStream {
//!     codec: Codec::Aac,
//!     source: BufReader::new(File::open("audio.aac")?),
//!     track: TrackConfig::default(),
//! };
//! let sink = File::create("out.mp4")?;
//! run(MuxConfig::default(), vec![input], sink)?;
//! # Ok(())
//! # }
//! ```

pub use isomux_common::{
    Dependency, DsiEntry, Error, FourCc, Result, Sample, SampleFlags, StreamInfo, StreamKind,
};
pub use isomux_es::{parser_for_codec, AnyParser, Codec, ElementaryParser, SignalingMode};
pub use isomux_io::{ByteSink, ByteSource};
pub use isomux_media::{
    BlockEncryptor, EncOptions, EncStyle, FragOptions, FragStyle, MetaData, MetaItem, MuxConfig,
    MuxOptions, Muxer, Track, TrackConfig,
};

/// One elementary stream to mux.
pub struct InputStream<R> {
    pub codec: Codec,
    pub source: R,
    pub track: TrackConfig,
}

/// Parse every input stream and mux them into `sink`. Returns the sink
/// on success so callers can keep writing (or inspect an in-memory
/// buffer in tests).
pub fn run<R, W>(cfg: MuxConfig, inputs: Vec<InputStream<R>>, sink: W) -> Result<W>
where
    R: ByteSource,
    W: ByteSink,
{
    let mut muxer = Muxer::new(cfg, sink);

    for input in inputs {
        let mut parser = parser_for_codec(input.codec, input.source);

        // the stream info needed by add_track exists once the first
        // sample is out
        let first = parser.next_sample()?.ok_or(Error::EmptyStream)?;
        let idx = muxer.add_track(input.track, parser.stream_info())?;
        muxer.input_sample(idx, &first)?;
        while let Some(sample) = parser.next_sample()? {
            muxer.input_sample(idx, &sample)?;
        }
        let info = parser.stream_info();
        tracing::info!(
            track = idx + 1,
            coding = %info.coding_name,
            samples = muxer.tracks[idx].sample_num,
            "stream parsed"
        );
        muxer.finish_track(idx, info, parser.dsi_entries())?;
    }

    muxer.output()
}
