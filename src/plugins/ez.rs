//! Minimal zip reading for `.ez` plugin archives: enough to list the
//! central directory and extract stored or deflated entries.

use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::{Error, Result};

const EOCD_SIG: u32 = 0x0605_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    method: u16,
    compressed_size: u32,
    uncompressed_size: u32,
    local_offset: u32,
}

fn u16_at(bytes: &[u8], at: usize) -> Result<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes(b.try_into().expect("slice length")))
        .ok_or(Error::Corrupt("zip record truncated"))
}

fn u32_at(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().expect("slice length")))
        .ok_or(Error::Corrupt("zip record truncated"))
}

/// Reads the central directory.
pub fn list_entries(bytes: &[u8]) -> Result<Vec<ZipEntry>> {
    // The end-of-central-directory record sits in the trailing 64KB and has
    // no fixed position thanks to the comment field; scan backwards.
    let scan_from = bytes.len().saturating_sub(65_557);
    let mut eocd = None;
    for at in (scan_from..bytes.len().saturating_sub(21)).rev() {
        if u32_at(bytes, at)? == EOCD_SIG {
            eocd = Some(at);
            break;
        }
    }
    let eocd = eocd.ok_or(Error::Corrupt("zip end record not found"))?;
    let entry_count = u16_at(bytes, eocd + 10)? as usize;
    let mut at = u32_at(bytes, eocd + 16)? as usize;

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        if u32_at(bytes, at)? != CENTRAL_SIG {
            return Err(Error::Corrupt("zip central directory corrupt"));
        }
        let method = u16_at(bytes, at + 10)?;
        let compressed_size = u32_at(bytes, at + 20)?;
        let uncompressed_size = u32_at(bytes, at + 24)?;
        let name_len = u16_at(bytes, at + 28)? as usize;
        let extra_len = u16_at(bytes, at + 30)? as usize;
        let comment_len = u16_at(bytes, at + 32)? as usize;
        let local_offset = u32_at(bytes, at + 42)?;
        let name_bytes = bytes
            .get(at + 46..at + 46 + name_len)
            .ok_or(Error::Corrupt("zip name truncated"))?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        entries.push(ZipEntry {
            name,
            method,
            compressed_size,
            uncompressed_size,
            local_offset,
        });
        at += 46 + name_len + extra_len + comment_len;
    }
    Ok(entries)
}

/// Extracts one entry's bytes.
pub fn read_entry(bytes: &[u8], entry: &ZipEntry) -> Result<Vec<u8>> {
    let at = entry.local_offset as usize;
    if u32_at(bytes, at)? != LOCAL_SIG {
        return Err(Error::Corrupt("zip local header corrupt"));
    }
    let name_len = u16_at(bytes, at + 26)? as usize;
    let extra_len = u16_at(bytes, at + 28)? as usize;
    let data_start = at + 30 + name_len + extra_len;
    let data = bytes
        .get(data_start..data_start + entry.compressed_size as usize)
        .ok_or(Error::Corrupt("zip data truncated"))?;
    match entry.method {
        METHOD_STORED => Ok(data.to_vec()),
        METHOD_DEFLATE => {
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|_| Error::Corrupt("zip entry inflate failed"))?;
            Ok(out)
        }
        _ => Err(Error::Unsupported("zip compression method")),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Builds an uncompressed (stored) zip archive in memory.
    pub fn build_stored_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut centrals = Vec::new();
        for (name, data) in files {
            let crc = crc32fast::hash(data);
            let local_offset = out.len() as u32;
            // Local file header.
            out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // version, flags, method, time, date
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);
            centrals.push((name.to_string(), *data, crc, local_offset));
        }
        let central_start = out.len() as u32;
        for (name, data, crc, local_offset) in &centrals {
            out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
            out.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // versions, flags, method, time, date
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&[0u8; 12]); // extra, comment, disk, attrs
            out.extend_from_slice(&local_offset.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        let central_size = out.len() as u32 - central_start;
        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // disk numbers
        out.extend_from_slice(&(centrals.len() as u16).to_le_bytes());
        out.extend_from_slice(&(centrals.len() as u16).to_le_bytes());
        out.extend_from_slice(&central_size.to_le_bytes());
        out.extend_from_slice(&central_start.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // comment length
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_stored_zip;
    use super::*;

    #[test]
    fn lists_and_extracts_stored_entries() {
        let zip = build_stored_zip(&[
            ("plug/ebin/plug.app", b"{application, plug, []}."),
            ("plug/ebin/plug.beam", b"\x00\x01\x02"),
        ]);
        let entries = list_entries(&zip).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "plug/ebin/plug.app");
        let data = read_entry(&zip, &entries[0]).unwrap();
        assert_eq!(data, b"{application, plug, []}.");
    }

    #[test]
    fn rejects_non_zip_bytes() {
        assert!(list_entries(b"definitely not a zip").is_err());
    }
}
