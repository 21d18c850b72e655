//! Index page codec.
//!
//! A page holds one primary value's postings, sorted by (secondary,
//! tertiary): 4-byte magic, codec byte, uncompressed body length, primary
//! value, entry count, delta-varint body, CRC32 trailer over everything
//! preceding it.

use crate::manifest::{Codec, Compression};
use crate::{Error, PAGE_MAGIC, Result};
use crc32fast::Hasher;
use std::io::{Read, Write};

pub const PAGE_HEADER_LEN: usize = 4 + 1 + 4 + 8 + 4;
const DEFAULT_BROTLI_LEVEL: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData {
    pub primary: u64,
    /// Sorted, deduplicated `(secondary, tertiary)` pairs.
    pub entries: Vec<(u64, u64)>,
}

/// Encodes one page. `entries` must be sorted and unique.
pub fn encode_page(primary: u64, entries: &[(u64, u64)], compression: Compression) -> Vec<u8> {
    let mut body = Vec::with_capacity(entries.len() * 4);
    let mut prev: Option<(u64, u64)> = None;
    for &(secondary, tertiary) in entries {
        match prev {
            None => {
                write_varint(&mut body, secondary);
                write_varint(&mut body, tertiary);
            }
            Some((ps, pt)) => {
                let delta = secondary - ps;
                write_varint(&mut body, delta);
                if delta == 0 {
                    write_varint(&mut body, tertiary - pt);
                } else {
                    write_varint(&mut body, tertiary);
                }
            }
        }
        prev = Some((secondary, tertiary));
    }

    let uncompressed_len = body.len() as u32;
    let (codec, body) = match compression.codec {
        Codec::None => (0u8, body),
        Codec::Brotli => {
            let level = compression.level.unwrap_or(DEFAULT_BROTLI_LEVEL);
            let mut compressed = Vec::with_capacity(body.len() / 2 + 16);
            {
                let mut writer = brotli::CompressorWriter::new(
                    &mut compressed,
                    4096,
                    level,
                    BROTLI_LG_WINDOW,
                );
                writer
                    .write_all(&body)
                    .expect("brotli write to Vec cannot fail");
            }
            (1u8, compressed)
        }
    };

    let mut out = Vec::with_capacity(PAGE_HEADER_LEN + body.len() + 4);
    out.extend_from_slice(&PAGE_MAGIC);
    out.push(codec);
    out.extend_from_slice(&uncompressed_len.to_le_bytes());
    out.extend_from_slice(&primary.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32(&out).to_le_bytes());
    out
}

pub fn decode_page(bytes: &[u8]) -> Result<PageData> {
    if bytes.len() < PAGE_HEADER_LEN + 4 {
        return Err(Error::StorageCorrupted("page too short"));
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    if crc32(payload) != stored_crc {
        return Err(Error::StorageCorrupted("page crc mismatch"));
    }
    if payload[0..4] != PAGE_MAGIC {
        return Err(Error::StorageCorrupted("bad page magic"));
    }
    let codec = payload[4];
    let uncompressed_len = u32::from_le_bytes(payload[5..9].try_into().unwrap()) as usize;
    let primary = u64::from_le_bytes(payload[9..17].try_into().unwrap());
    let count = u32::from_le_bytes(payload[17..21].try_into().unwrap()) as usize;
    let raw_body = &payload[PAGE_HEADER_LEN..];

    let body: Vec<u8> = match codec {
        0 => raw_body.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(uncompressed_len);
            brotli::Decompressor::new(raw_body, 4096)
                .read_to_end(&mut out)
                .map_err(|_| Error::StorageCorrupted("page decompression failed"))?;
            out
        }
        _ => return Err(Error::StorageCorrupted("unknown page codec")),
    };
    if body.len() != uncompressed_len {
        return Err(Error::StorageCorrupted("page body length mismatch"));
    }

    let mut entries = Vec::with_capacity(count);
    let mut cursor = 0usize;
    let mut prev: Option<(u64, u64)> = None;
    for _ in 0..count {
        let entry = match prev {
            None => {
                let secondary = read_varint(&body, &mut cursor)?;
                let tertiary = read_varint(&body, &mut cursor)?;
                (secondary, tertiary)
            }
            Some((ps, pt)) => {
                let delta = read_varint(&body, &mut cursor)?;
                let tertiary = read_varint(&body, &mut cursor)?;
                if delta == 0 {
                    (ps, pt + tertiary)
                } else {
                    (ps + delta, tertiary)
                }
            }
        };
        entries.push(entry);
        prev = Some(entry);
    }
    if cursor != body.len() {
        return Err(Error::StorageCorrupted("trailing bytes in page body"));
    }

    Ok(PageData { primary, entries })
}

/// CRC of a full on-disk page, as recorded in the manifest catalog.
pub fn page_crc(bytes: &[u8]) -> u32 {
    crc32(bytes)
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn read_varint(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*cursor)
            .ok_or(Error::StorageCorrupted("truncated varint"))?;
        *cursor += 1;
        if shift >= 64 {
            return Err(Error::StorageCorrupted("varint overflow"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(u64, u64)> {
        vec![(3, 10), (3, 11), (3, 500), (4, 1), (900, 2)]
    }

    #[test]
    fn roundtrip_raw() {
        let bytes = encode_page(42, &entries(), Compression::default());
        let page = decode_page(&bytes).unwrap();
        assert_eq!(page.primary, 42);
        assert_eq!(page.entries, entries());
    }

    #[test]
    fn roundtrip_brotli() {
        let many: Vec<(u64, u64)> = (0..2000).map(|i| (i / 7, i)).collect();
        let bytes = encode_page(1, &many, Compression::brotli(5));
        let page = decode_page(&bytes).unwrap();
        assert_eq!(page.entries, many);
    }

    #[test]
    fn empty_page_roundtrip() {
        let bytes = encode_page(7, &[], Compression::default());
        let page = decode_page(&bytes).unwrap();
        assert_eq!(page.primary, 7);
        assert!(page.entries.is_empty());
    }

    #[test]
    fn any_single_byte_flip_is_detected() {
        let bytes = encode_page(9, &entries(), Compression::default());
        for i in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x01;
            assert!(decode_page(&corrupt).is_err(), "flip at byte {i} undetected");
        }
    }

    #[test]
    fn varint_limits() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, u64::MAX] {
            buf.clear();
            write_varint(&mut buf, value);
            let mut cursor = 0;
            assert_eq!(read_varint(&buf, &mut cursor).unwrap(), value);
            assert_eq!(cursor, buf.len());
        }
    }
}
