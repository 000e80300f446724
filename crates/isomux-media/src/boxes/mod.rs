//! ISO BMFF box serialization primitives.
//!
//! Every box follows the standard layout: 4-byte size (big-endian),
//! 4-byte type, then box-specific content. Writers build into a
//! `BytesMut` with a placeholder size that is patched once the body is
//! complete; boxes that may exceed 2^32-1 bytes use the
//! 1-plus-`largesize` form.

pub mod enc;
pub mod frag;
pub mod meta;
pub mod moov;
pub mod stbl;

use bytes::{BufMut, BytesMut};

/// Open a box: write the placeholder size and type, return the start
/// offset for [`box_end`].
pub(crate) fn box_start(buf: &mut BytesMut, box_type: &[u8; 4]) -> usize {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(box_type);
    start
}

/// Patch the size of a box opened with [`box_start`].
pub(crate) fn box_end(buf: &mut BytesMut, start: usize) {
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Open a full box (version + 24-bit flags).
pub(crate) fn full_box_start(
    buf: &mut BytesMut,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
) -> usize {
    let start = box_start(buf, box_type);
    buf.put_u32(((version as u32) << 24) | (flags & 0x00ff_ffff));
    start
}

/// Patch a big-endian u32 at an absolute buffer offset.
pub(crate) fn patch_u32(buf: &mut BytesMut, at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Patch a big-endian u64 at an absolute buffer offset.
pub(crate) fn patch_u64(buf: &mut BytesMut, at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

/// `mdat` header bytes for a payload of `data_size` bytes; switches to
/// the largesize form when the total would overflow 32 bits.
pub(crate) fn mdat_header(data_size: u64) -> Vec<u8> {
    if data_size + 8 > u32::MAX as u64 {
        let mut hdr = Vec::with_capacity(16);
        hdr.extend_from_slice(&1u32.to_be_bytes());
        hdr.extend_from_slice(b"mdat");
        hdr.extend_from_slice(&(data_size + 16).to_be_bytes());
        hdr
    } else {
        let mut hdr = Vec::with_capacity(8);
        hdr.extend_from_slice(&((data_size + 8) as u32).to_be_bytes());
        hdr.extend_from_slice(b"mdat");
        hdr
    }
}

/// Size of the `mdat` header for a payload of `data_size` bytes.
pub(crate) fn mdat_header_size(data_size: u64) -> u64 {
    if data_size + 8 > u32::MAX as u64 {
        16
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_size_patching() {
        let mut buf = BytesMut::new();
        let start = box_start(&mut buf, b"test");
        buf.put_slice(&[1, 2, 3]);
        box_end(&mut buf, start);
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf[0..4], &11u32.to_be_bytes());
        assert_eq!(&buf[4..8], b"test");
    }

    #[test]
    fn nested_boxes() {
        let mut buf = BytesMut::new();
        let outer = box_start(&mut buf, b"out ");
        let inner = full_box_start(&mut buf, b"innr", 1, 7);
        buf.put_u32(0xdead_beef);
        box_end(&mut buf, inner);
        box_end(&mut buf, outer);
        assert_eq!(&buf[0..4], &24u32.to_be_bytes());
        assert_eq!(&buf[8..12], &16u32.to_be_bytes());
        assert_eq!(&buf[12..16], b"innr");
        assert_eq!(&buf[16..20], &0x0100_0007u32.to_be_bytes());
    }

    #[test]
    fn mdat_header_forms() {
        let hdr = mdat_header(100);
        assert_eq!(hdr.len(), 8);
        assert_eq!(&hdr[0..4], &108u32.to_be_bytes());

        let hdr = mdat_header(u32::MAX as u64);
        assert_eq!(hdr.len(), 16);
        assert_eq!(&hdr[0..4], &1u32.to_be_bytes());
        assert_eq!(&hdr[4..8], b"mdat");
        assert_eq!(
            &hdr[8..16],
            &(u32::MAX as u64 + 16).to_be_bytes()
        );
    }
}
