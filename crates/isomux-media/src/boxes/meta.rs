//! `meta` box writer: handler, optional XML document, and items
//! carried in `idat` with an `iloc` index.

use bytes::{BufMut, BytesMut};

use super::{box_end, box_start, full_box_start};

/// One stored item: opaque bytes placed into `idat`.
#[derive(Debug, Clone)]
pub struct MetaItem {
    pub item_id: u16,
    pub data: Vec<u8>,
}

/// A `meta` payload: `hdlr` + optional `xml ` + `iloc`/`idat`.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    pub handler_type: [u8; 4],
    pub xml: Option<String>,
    pub items: Vec<MetaItem>,
}

/// `iloc` construction method 1: offsets are relative to `idat`.
const CONSTRUCTION_METHOD_IDAT: u16 = 1;

pub fn write_meta(buf: &mut BytesMut, meta: &MetaData) {
    let m = full_box_start(buf, b"meta", 0, 0);

    let hdlr = full_box_start(buf, b"hdlr", 0, 0);
    buf.put_u32(0);
    buf.put_slice(&meta.handler_type);
    buf.put_slice(&[0u8; 12]);
    buf.put_u8(0);
    box_end(buf, hdlr);

    if let Some(xml) = &meta.xml {
        let x = full_box_start(buf, b"xml ", 0, 0);
        buf.put_slice(xml.as_bytes());
        buf.put_u8(0);
        box_end(buf, x);
    }

    if !meta.items.is_empty() {
        // compute idat layout first: items are packed back to back
        let mut offsets = Vec::with_capacity(meta.items.len());
        let mut off = 0u64;
        for item in &meta.items {
            offsets.push(off);
            off += item.data.len() as u64;
        }
        let offset_size: u8 = if off > u32::MAX as u64 { 8 } else { 4 };

        let iloc = full_box_start(buf, b"iloc", 1, 0);
        buf.put_u8((offset_size << 4) | offset_size); // offset_size, length_size
        buf.put_u8(0); // base_offset_size, index_size
        buf.put_u16(meta.items.len() as u16);
        for (item, offset) in meta.items.iter().zip(&offsets) {
            buf.put_u16(item.item_id);
            buf.put_u16(CONSTRUCTION_METHOD_IDAT);
            buf.put_u16(0); // data_reference_index
            buf.put_u16(1); // extent_count
            if offset_size == 8 {
                buf.put_u64(*offset);
                buf.put_u64(item.data.len() as u64);
            } else {
                buf.put_u32(*offset as u32);
                buf.put_u32(item.data.len() as u32);
            }
        }
        box_end(buf, iloc);

        let idat = box_start(buf, b"idat");
        for item in &meta.items {
            buf.put_slice(&item.data);
        }
        box_end(buf, idat);
    }

    box_end(buf, m);
}
