//! Minimal ZIP container writer.
//!
//! Export artifacts are small bundles of JSON manifests and delivery
//! documents, so the writer supports exactly what the consumers need:
//! deflate-compressed entries, a central directory, and correct CRC32s
//! (both via flate2).

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_SIG: u32 = 0x0605_4b50;
const VERSION_NEEDED: u16 = 20;
const METHOD_DEFLATE: u16 = 8;

struct Entry {
    name: String,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

/// Builds a ZIP archive in memory.
pub struct ZipWriter {
    buffer: Vec<u8>,
    entries: Vec<Entry>,
}

impl ZipWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            entries: Vec::new(),
        }
    }

    fn put_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Add one file entry. Entry names use forward slashes.
    pub fn add_file(&mut self, name: &str, contents: &[u8]) -> std::io::Result<()> {
        let mut crc = Crc::new();
        crc.update(contents);

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(contents)?;
        let compressed = encoder.finish()?;

        let offset = self.buffer.len() as u32;
        self.put_u32(LOCAL_HEADER_SIG);
        self.put_u16(VERSION_NEEDED);
        self.put_u16(0); // general purpose flags
        self.put_u16(METHOD_DEFLATE);
        self.put_u16(0); // mod time
        self.put_u16(0); // mod date
        self.put_u32(crc.sum());
        self.put_u32(compressed.len() as u32);
        self.put_u32(contents.len() as u32);
        self.put_u16(name.len() as u16);
        self.put_u16(0); // extra length
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.extend_from_slice(&compressed);

        self.entries.push(Entry {
            name: name.to_string(),
            crc32: crc.sum(),
            compressed_size: compressed.len() as u32,
            uncompressed_size: contents.len() as u32,
            local_header_offset: offset,
        });
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Write the central directory and return the finished archive.
    pub fn finish(mut self) -> Vec<u8> {
        let central_start = self.buffer.len() as u32;
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            self.put_u32(CENTRAL_HEADER_SIG);
            self.put_u16(VERSION_NEEDED); // version made by
            self.put_u16(VERSION_NEEDED);
            self.put_u16(0);
            self.put_u16(METHOD_DEFLATE);
            self.put_u16(0);
            self.put_u16(0);
            self.put_u32(entry.crc32);
            self.put_u32(entry.compressed_size);
            self.put_u32(entry.uncompressed_size);
            self.put_u16(entry.name.len() as u16);
            self.put_u16(0); // extra
            self.put_u16(0); // comment
            self.put_u16(0); // disk number
            self.put_u16(0); // internal attrs
            self.put_u32(0); // external attrs
            self.put_u32(entry.local_header_offset);
            self.buffer.extend_from_slice(entry.name.as_bytes());
        }
        let central_size = self.buffer.len() as u32 - central_start;

        self.put_u32(END_OF_CENTRAL_SIG);
        self.put_u16(0); // disk number
        self.put_u16(0); // central directory disk
        self.put_u16(entries.len() as u16);
        self.put_u16(entries.len() as u16);
        self.put_u32(central_size);
        self.put_u32(central_start);
        self.put_u16(0); // comment length

        self.buffer
    }
}

impl Default for ZipWriter {
    fn default() -> Self {
        Self::new()
    }
}
