//! MOBI / AZW handler (PalmDOC records, uncompressed or LZ77).

use crate::error::{AppError, Result};
use crate::formats::text::html_to_text;
use crate::formats::{BookText, Extracted, FormatHandler};
use crate::library::book::BookMetadata;
use encoding_rs::{UTF_8, WINDOWS_1252};
use std::path::Path;

/// Handler for MOBI files.
pub struct MobiHandler;

const PDB_HEADER_LEN: usize = 78;

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Bytes of record `i`, which run up to the next record's offset.
fn pdb_record<'a>(data: &'a [u8], offsets: &[usize], i: usize) -> Option<&'a [u8]> {
    let start = *offsets.get(i)?;
    let end = offsets.get(i + 1).copied().unwrap_or(data.len());
    data.get(start..end.max(start))
}

fn corrupt(what: &str) -> AppError {
    AppError::InvalidFormat(format!("Corrupt MOBI file: {}", what))
}

/// Decompress one PalmDOC LZ77 record.
pub fn palmdoc_decompress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        let c = data[i];
        i += 1;

        match c {
            0x01..=0x08 => {
                let end = (i + c as usize).min(data.len());
                out.extend_from_slice(&data[i..end]);
                i = end;
            }
            0x00 | 0x09..=0x7F => out.push(c),
            0x80..=0xBF => {
                let Some(&next) = data.get(i) else {
                    break;
                };
                i += 1;
                let pair = ((c as usize) << 8) | next as usize;
                let distance = (pair >> 3) & 0x7FF;
                let length = (pair & 0x7) + 3;
                if distance == 0 || distance > out.len() {
                    continue;
                }
                let start = out.len() - distance;
                for k in 0..length {
                    out.push(out[start + k]);
                }
            }
            0xC0..=0xFF => {
                out.push(b' ');
                out.push(c ^ 0x80);
            }
        }
    }

    out
}

/// Size of the trailing entries appended to a text record.
fn trailing_size(record: &[u8], flags: u16) -> usize {
    let mut size = 0usize;

    for bit in 1..16 {
        if flags & (1 << bit) == 0 {
            continue;
        }
        let end = record.len().saturating_sub(size);
        // Backward-encoded variable-width integer.
        let mut value = 0usize;
        let mut shift = 0;
        for pos in (end.saturating_sub(4)..end).rev() {
            let byte = record[pos];
            value |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
            if byte & 0x80 != 0 {
                break;
            }
        }
        size += value;
    }

    if flags & 1 != 0
        && let Some(&last) = record.len().checked_sub(size + 1).and_then(|p| record.get(p))
    {
        size += (last & 0x3) as usize + 1;
    }

    size.min(record.len())
}

/// Metadata from the MOBI and EXTH headers.
fn read_mobi_metadata(record0: &[u8]) -> (BookMetadata, u32, u16) {
    let mut metadata = BookMetadata::default();
    let mut encoding = 1252;
    let mut extra_flags = 0;

    if record0.get(16..20) != Some(b"MOBI".as_slice()) {
        return (metadata, encoding, extra_flags);
    }

    let header_len = be_u32(record0, 20).unwrap_or(0) as usize;
    encoding = be_u32(record0, 28).unwrap_or(1252);

    if header_len >= 0xE4 {
        extra_flags = be_u16(record0, 0xF2).unwrap_or(0);
    }

    let decode = |bytes: &[u8]| -> String {
        if encoding == 65001 {
            UTF_8.decode(bytes).0.into_owned()
        } else {
            WINDOWS_1252.decode(bytes).0.into_owned()
        }
    };

    if let (Some(offset), Some(len)) = (be_u32(record0, 84), be_u32(record0, 88))
        && let Some(end) = offset.checked_add(len)
        && let Some(name) = record0.get(offset as usize..end as usize)
    {
        metadata.set_title(&decode(name));
    }

    let exth_flags = be_u32(record0, 128).unwrap_or(0);
    let exth_start = 16 + header_len;
    if exth_flags & 0x40 != 0 && record0.get(exth_start..exth_start + 4) == Some(b"EXTH".as_slice()) {
        let count = be_u32(record0, exth_start + 8).unwrap_or(0);
        let mut pos = exth_start + 12;
        for _ in 0..count {
            let (Some(kind), Some(len)) = (be_u32(record0, pos), be_u32(record0, pos + 4)) else {
                break;
            };
            let len = len as usize;
            if len < 8 {
                break;
            }
            let Some(end) = pos.checked_add(len) else {
                break;
            };
            if let Some(data) = record0.get(pos + 8..end) {
                let value = decode(data);
                match kind {
                    100 => metadata.authors.push(value.trim().to_string()),
                    103 => metadata.description = Some(html_to_text(&value)),
                    503 => metadata.set_title(&value),
                    524 => metadata.language = Some(value.trim().to_string()),
                    _ => {}
                }
            }
            pos = end;
        }
    }

    (metadata, encoding, extra_flags)
}

impl MobiHandler {
    /// Read a MOBI from memory.
    pub fn extract_bytes(data: &[u8]) -> Result<Extracted> {
        if data.len() < PDB_HEADER_LEN {
            return Err(corrupt("too short"));
        }

        let record_count = be_u16(data, 76).ok_or_else(|| corrupt("no record count"))? as usize;
        let offsets: Vec<usize> = (0..record_count)
            .map(|i| be_u32(data, PDB_HEADER_LEN + i * 8).map(|o| o as usize))
            .collect::<Option<_>>()
            .ok_or_else(|| corrupt("truncated record list"))?;

        let record0 = pdb_record(data, &offsets, 0).ok_or_else(|| corrupt("missing header record"))?;
        let compression = be_u16(record0, 0).ok_or_else(|| corrupt("missing compression"))?;
        let text_length = be_u32(record0, 4).unwrap_or(0) as usize;
        let text_records = be_u16(record0, 8).unwrap_or(0) as usize;
        let encryption = be_u16(record0, 12).unwrap_or(0);

        if encryption != 0 {
            return Err(AppError::InvalidFormat("Encrypted MOBI files are not supported".into()));
        }
        if compression != 1 && compression != 2 {
            return Err(AppError::InvalidFormat(format!(
                "Unsupported MOBI compression: {}",
                compression
            )));
        }

        let (metadata, encoding, extra_flags) = read_mobi_metadata(record0);

        let mut raw = Vec::with_capacity(text_length);
        for i in 1..=text_records {
            let Some(rec) = pdb_record(data, &offsets, i) else {
                break;
            };
            let rec = &rec[..rec.len() - trailing_size(rec, extra_flags)];
            if compression == 2 {
                raw.extend(palmdoc_decompress(rec));
            } else {
                raw.extend_from_slice(rec);
            }
        }
        if text_length > 0 {
            raw.truncate(text_length);
        }

        let html = if encoding == 65001 {
            UTF_8.decode(&raw).0.into_owned()
        } else {
            WINDOWS_1252.decode(&raw).0.into_owned()
        };
        let html = html.replace("<mbp:pagebreak/>", "<p>");

        Ok(Extracted {
            metadata,
            text: BookText::Flat(html_to_text(&html)),
        })
    }
}

impl FormatHandler for MobiHandler {
    fn extract(&self, path: &Path) -> Result<Extracted> {
        let data = std::fs::read(path)?;
        Self::extract_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PDB with a PalmDOC header record (no MOBI header) and the given text records.
    fn build_pdb(compression: u16, text_len: usize, records: &[&[u8]]) -> Vec<u8> {
        let mut record0 = Vec::new();
        record0.extend_from_slice(&compression.to_be_bytes());
        record0.extend_from_slice(&[0, 0]);
        record0.extend_from_slice(&(text_len as u32).to_be_bytes());
        record0.extend_from_slice(&(records.len() as u16).to_be_bytes());
        record0.extend_from_slice(&4096u16.to_be_bytes());
        record0.extend_from_slice(&[0, 0, 0, 0]);

        let all: Vec<&[u8]> = std::iter::once(record0.as_slice())
            .chain(records.iter().copied())
            .collect();

        let mut data = vec![0u8; PDB_HEADER_LEN];
        data[76..78].copy_from_slice(&(all.len() as u16).to_be_bytes());

        let mut offset = PDB_HEADER_LEN + all.len() * 8;
        for rec in &all {
            data.extend_from_slice(&(offset as u32).to_be_bytes());
            data.extend_from_slice(&[0, 0, 0, 0]);
            offset += rec.len();
        }
        for rec in &all {
            data.extend_from_slice(rec);
        }
        data
    }

    #[test]
    fn lz77_back_references() {
        assert_eq!(palmdoc_decompress(&[b'a', b'b', b'c', 0x80, 0x18]), b"abcabc");
        assert_eq!(palmdoc_decompress(&[b'o', 0xE8]), b"o h");
        assert_eq!(palmdoc_decompress(&[0x02, 0x90, 0x91]), vec![0x90, 0x91]);
    }

    #[test]
    fn reads_uncompressed_records() {
        let body = b"<p>Chapter 1</p><p>Hello</p>";
        let pdb = build_pdb(1, body.len(), &[body]);
        let extracted = MobiHandler::extract_bytes(&pdb).unwrap();
        assert_eq!(extracted.text, BookText::Flat("Chapter 1\n\nHello".to_string()));
    }

    #[test]
    fn reads_compressed_records() {
        let pdb = build_pdb(2, 6, &[&[b'a', b'b', b'c', 0x80, 0x18]]);
        let extracted = MobiHandler::extract_bytes(&pdb).unwrap();
        assert_eq!(extracted.text, BookText::Flat("abcabc".to_string()));
    }

    fn mobi_record0(title_offset: u32, title_len: u32) -> Vec<u8> {
        let mut record0 = vec![0u8; 0x100];
        record0[16..20].copy_from_slice(b"MOBI");
        record0[20..24].copy_from_slice(&0xE8u32.to_be_bytes());
        record0[28..32].copy_from_slice(&65001u32.to_be_bytes());
        record0[84..88].copy_from_slice(&title_offset.to_be_bytes());
        record0[88..92].copy_from_slice(&title_len.to_be_bytes());
        record0
    }

    #[test]
    fn reads_full_name() {
        let mut record0 = mobi_record0(0xF8, 4);
        record0[0xF8..0xFC].copy_from_slice(b"Dune");
        let (metadata, encoding, _) = read_mobi_metadata(&record0);
        assert_eq!(metadata.title.as_deref(), Some("Dune"));
        assert_eq!(encoding, 65001);
    }

    #[test]
    fn overflowing_name_is_ignored() {
        let record0 = mobi_record0(0xFFFF_FFF0, 0x20);
        let (metadata, _, _) = read_mobi_metadata(&record0);
        assert!(metadata.title.is_none());
    }

    #[test]
    fn rejects_unsupported_compression() {
        let pdb = build_pdb(17480, 0, &[b"x"]);
        assert!(MobiHandler::extract_bytes(&pdb).is_err());
        assert!(MobiHandler::extract_bytes(b"short").is_err());
    }
}
