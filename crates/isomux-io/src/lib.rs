//! Byte- and bit-level stream abstractions for isomux.
//!
//! Sources and sinks are ordinary `Read + Seek` / `Write + Seek`
//! values; [`BitReader`] layers an MSB-first bit cache and exp-Golomb
//! decoding on top of a source, and [`BitWriter`] assembles bit-packed
//! configuration records in memory.
//!
//! The bit cache carries exactly two fields, `cached_bits` and
//! `cached_bit_num` (0..=8). Byte-level operations require the cache to
//! be empty, i.e. the stream to be byte aligned.

pub mod reader;
pub mod writer;

pub use reader::BitReader;
pub use writer::BitWriter;

use std::io::{Read, Seek, Write};

/// A readable, seekable byte source. Blanket-implemented for every
/// `Read + Seek` type.
pub trait ByteSource: Read + Seek {}

impl<T: Read + Seek> ByteSource for T {}

/// A writable, seekable byte sink. Blanket-implemented for every
/// `Write + Seek` type.
pub trait ByteSink: Write + Seek {}

impl<T: Write + Seek> ByteSink for T {}
