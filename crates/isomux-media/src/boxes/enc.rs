//! Common Encryption support: the encryptor interface, per-sample
//! encryption bookkeeping, and the `sinf`/`tenc`/`senc`/`saiz`/`saio`
//! writers.

use bytes::{BufMut, BytesMut};

use super::{box_end, box_start, full_box_start};
use crate::config::{EncOptions, EncStyle};

/// The PIFF sample-encryption uuid (`A239...`).
pub const PIFF_SENC_UUID: [u8; 16] = [
    0xa2, 0x39, 0x4f, 0x52, 0x5a, 0x9b, 0x4f, 0x14, 0xa2, 0x44, 0x6c, 0x42, 0x7c, 0x64, 0x8d,
    0xf4,
];

/// The PIFF track-encryption uuid (`8974...`).
pub const PIFF_TENC_UUID: [u8; 16] = [
    0x89, 0x74, 0xdb, 0xce, 0x7b, 0xe7, 0x4c, 0x51, 0x84, 0xf9, 0x71, 0x48, 0xf9, 0x88, 0x25,
    0x54,
];

/// The AES-CTR primitive supplied by the caller. The muxer never
/// touches key material; it only drives the counter stream and records
/// the IVs.
pub trait BlockEncryptor {
    /// Encrypt `data` in place, continuing the current counter stream.
    fn encrypt(&mut self, data: &mut [u8]);

    /// Advance to the next per-sample IV.
    fn advance_iv(&mut self);

    /// Current IV bytes (8 or 16).
    fn iv(&self) -> Vec<u8>;
}

/// Per-sample encryption record feeding `senc`/`saiz`.
#[derive(Debug, Clone)]
pub struct EncInfo {
    pub iv: Vec<u8>,
    /// `(bytes_of_clear_data, bytes_of_encrypted_data)` pairs; empty
    /// for full-sample encryption.
    pub subsamples: Vec<(u16, u32)>,
}

impl EncInfo {
    /// Bytes this sample contributes to `senc`.
    pub fn senc_size(&self) -> u32 {
        let mut n = self.iv.len() as u32;
        if !self.subsamples.is_empty() {
            n += 2 + 6 * self.subsamples.len() as u32;
        }
        n
    }
}

/// NAL payloads shorter than this stay fully clear.
const MIN_ENCRYPT_NAL: u32 = 112;
/// Clear prefix of an encrypted NAL: headers plus block alignment.
const CLEAR_PREFIX: u32 = 96;

/// Encrypt one sample in place and record its `senc` entry.
///
/// Video samples with NAL subsamples use the CENC subsample pattern:
/// a NAL shorter than 112 bytes stays clear; otherwise the first
/// `96 + (size & 0xf)` bytes stay clear and the rest is encrypted.
/// Other samples are encrypted whole.
pub fn encrypt_sample(
    encryptor: &mut dyn BlockEncryptor,
    data: &mut [u8],
    subsample_sizes: &[u32],
) -> EncInfo {
    let iv = encryptor.iv();
    let mut subsamples = Vec::new();

    if subsample_sizes.len() > 1 {
        let mut off = 0usize;
        for &size in subsample_sizes {
            let (clear, encrypted) = if size < MIN_ENCRYPT_NAL {
                (size, 0)
            } else {
                let clear = CLEAR_PREFIX + (size & 0xf);
                (clear, size - clear)
            };
            if encrypted > 0 {
                let start = off + clear as usize;
                encryptor.encrypt(&mut data[start..start + encrypted as usize]);
            }
            subsamples.push((clear as u16, encrypted));
            off += size as usize;
        }
    } else {
        encryptor.encrypt(data);
    }

    encryptor.advance_iv();
    EncInfo { iv, subsamples }
}

/// `sinf(frma, schm, schi(tenc))` wrapping a protected sample entry.
pub fn write_sinf(buf: &mut BytesMut, original_format: &[u8; 4], enc: &EncOptions) {
    let sinf = box_start(buf, b"sinf");

    let frma = box_start(buf, b"frma");
    buf.put_slice(original_format);
    box_end(buf, frma);

    let schm = full_box_start(buf, b"schm", 0, 0);
    match enc.style {
        EncStyle::Cenc => {
            buf.put_slice(b"cenc");
            buf.put_u32(0x0001_0000);
        }
        EncStyle::Piff => {
            buf.put_slice(b"piff");
            buf.put_u32(0x0001_0001);
        }
    }
    box_end(buf, schm);

    let schi = box_start(buf, b"schi");
    write_tenc(buf, enc);
    box_end(buf, schi);

    box_end(buf, sinf);
}

/// `tenc` (or its PIFF `uuid` form): default protection parameters,
/// 24-bit AlgorithmID 1 (AES-CTR), IV size, and key id.
fn write_tenc(buf: &mut BytesMut, enc: &EncOptions) {
    let tenc = match enc.style {
        EncStyle::Cenc => full_box_start(buf, b"tenc", 0, 0),
        EncStyle::Piff => {
            let s = box_start(buf, b"uuid");
            buf.put_slice(&PIFF_TENC_UUID);
            buf.put_u32(0); // version & flags
            s
        }
    };
    buf.put_u8(0);
    buf.put_u16(1); // default_AlgorithmID, 24 bits with the byte above
    buf.put_u8(enc.iv_size);
    buf.put_slice(&enc.key_id);
    box_end(buf, tenc);
}

/// `saiz`: when every sample shares one info size, the per-sample
/// array is omitted.
pub fn write_saiz(buf: &mut BytesMut, infos: &[EncInfo]) {
    let saiz = full_box_start(buf, b"saiz", 0, 0);
    let sizes: Vec<u32> = infos.iter().map(|i| i.senc_size()).collect();
    let uniform = sizes.windows(2).all(|w| w[0] == w[1]);
    if uniform && !sizes.is_empty() {
        buf.put_u8(sizes[0].min(255) as u8);
        buf.put_u32(sizes.len() as u32);
    } else {
        buf.put_u8(0);
        buf.put_u32(sizes.len() as u32);
        for s in &sizes {
            buf.put_u8((*s).min(255) as u8);
        }
    }
    box_end(buf, saiz);
}

/// `saio`: a single offset to the `senc` payload. The caller patches
/// the value once the real position is known; the patch offset into
/// the buffer is returned.
pub fn write_saio(buf: &mut BytesMut) -> usize {
    let saio = full_box_start(buf, b"saio", 0, 0);
    buf.put_u32(1); // entry_count
    let patch = buf.len();
    buf.put_u32(0);
    box_end(buf, saio);
    patch
}

/// `senc` (or its PIFF `uuid` form): per-sample IVs and subsample
/// ranges. Returns the buffer offset of the first IV byte, used by
/// `saio` patching.
pub fn write_senc(buf: &mut BytesMut, infos: &[EncInfo], style: EncStyle) -> usize {
    let has_subsamples = infos.iter().any(|i| !i.subsamples.is_empty());
    let flags = if has_subsamples { 0x2 } else { 0 };

    let start = match style {
        EncStyle::Cenc => full_box_start(buf, b"senc", 0, flags),
        EncStyle::Piff => {
            let s = box_start(buf, b"uuid");
            buf.put_slice(&PIFF_SENC_UUID);
            buf.put_u32(flags); // version 0 + flags
            s
        }
    };

    buf.put_u32(infos.len() as u32);
    let payload_start = buf.len();
    for info in infos {
        buf.put_slice(&info.iv);
        if has_subsamples {
            buf.put_u16(info.subsamples.len() as u16);
            for (clear, encrypted) in &info.subsamples {
                buf.put_u16(*clear);
                buf.put_u32(*encrypted);
            }
        }
    }
    box_end(buf, start);
    payload_start
}
