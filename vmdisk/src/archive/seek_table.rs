//! Seek table trailer for seekable zstd containers.
//!
//! The trailer is appended after the compressed payload:
//! a skippable frame whose body is one `(compressed_size,
//! decompressed_size)` pair per payload frame, closed by a 9-byte footer
//! `(frame_count, descriptor, magic)`. A reader finds the footer at the
//! end of the file, walks back to the skippable frame, and can then map
//! any decompressed offset to a single compressed frame.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use thiserror::Error;
use vmdisk_shared::constants::seekable::{
    DESCRIPTOR, ENTRY_SIZE, FOOTER_SIZE, MAX_FRAME_INPUT, SEEKABLE_MAGIC, SKIPPABLE_HEADER_SIZE,
    SKIPPABLE_MAGIC,
};
use vmdisk_shared::errors::VmDiskError;
use zstd::bulk::Decompressor;

/// Errors raised while building, encoding or reading a seek table.
#[derive(Debug, Error)]
pub enum SeekTableError {
    #[error("file too short for a seek table ({0} bytes)")]
    Truncated(u64),

    #[error("bad {what} magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("seek table of {frames} frames does not fit in {file_len} bytes")]
    TableTruncated { frames: u32, file_len: u64 },

    #[error("unsupported seek table descriptor {0:#04x}")]
    UnsupportedDescriptor(u8),

    #[error("skippable frame length {found} does not match {frames} frames")]
    LengthMismatch { frames: u32, found: u32 },

    #[error("frames cover {covered} bytes but the trailer starts at {trailer_start}")]
    PayloadMismatch { covered: u64, trailer_start: u64 },

    #[error("seek table frame count exceeds u32::MAX")]
    TooManyFrames,

    #[error("frame at offset {offset} is invalid: {reason}")]
    BadFrame { offset: u64, reason: String },

    #[error("frame index {0} out of range")]
    NoSuchFrame(usize),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl From<SeekTableError> for VmDiskError {
    fn from(err: SeekTableError) -> Self {
        match err {
            SeekTableError::Io(e) => VmDiskError::from_io("seek table", e),
            SeekTableError::BadFrame { .. } => VmDiskError::Codec(err.to_string()),
            other => VmDiskError::Integrity(other.to_string()),
        }
    }
}

/// One payload frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTableEntry {
    pub compressed_size: u32,
    pub decompressed_size: u32,
}

/// Where a decompressed offset lives in the compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub index: usize,
    /// Offset of the frame's first compressed byte.
    pub compressed_offset: u64,
    /// Decompressed offset of the frame's first byte.
    pub decompressed_offset: u64,
    pub entry: SeekTableEntry,
}

/// Ordered list of payload frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeekTable {
    entries: Vec<SeekTableEntry>,
}

impl SeekTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. The frame count must stay representable as `u32`.
    pub fn push(&mut self, entry: SeekTableEntry) -> Result<(), SeekTableError> {
        if self.entries.len() >= u32::MAX as usize {
            return Err(SeekTableError::TooManyFrames);
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[SeekTableEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total compressed payload bytes, i.e. the offset of the trailer.
    pub fn payload_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.compressed_size))
            .sum()
    }

    /// Total decompressed bytes.
    pub fn decompressed_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.decompressed_size))
            .sum()
    }

    /// Size of the encoded trailer in bytes.
    pub fn encoded_len(&self) -> usize {
        SKIPPABLE_HEADER_SIZE + self.entries.len() * ENTRY_SIZE + FOOTER_SIZE
    }

    /// Encode the trailer (skippable frame header, entries, footer).
    pub fn encode(&self) -> Result<Vec<u8>, SeekTableError> {
        let frame_count =
            u32::try_from(self.entries.len()).map_err(|_| SeekTableError::TooManyFrames)?;
        let body_len = u32::try_from(self.entries.len() * ENTRY_SIZE + FOOTER_SIZE)
            .map_err(|_| SeekTableError::TooManyFrames)?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&SKIPPABLE_MAGIC.to_le_bytes());
        out.extend_from_slice(&body_len.to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.compressed_size.to_le_bytes());
            out.extend_from_slice(&entry.decompressed_size.to_le_bytes());
        }
        out.extend_from_slice(&frame_count.to_le_bytes());
        out.push(DESCRIPTOR);
        out.extend_from_slice(&SEEKABLE_MAGIC.to_le_bytes());
        Ok(out)
    }

    /// Read the trailer at the end of `file`.
    pub fn read_from(file: &File) -> Result<Self, SeekTableError> {
        let file_len = file.metadata()?.len();
        let minimum = (SKIPPABLE_HEADER_SIZE + FOOTER_SIZE) as u64;
        if file_len < minimum {
            return Err(SeekTableError::Truncated(file_len));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, file_len - FOOTER_SIZE as u64)?;

        let frame_count = read_u32(&footer[0..4]);
        let descriptor = footer[4];
        let magic = read_u32(&footer[5..9]);
        if magic != SEEKABLE_MAGIC {
            return Err(SeekTableError::BadMagic {
                what: "seekable footer",
                expected: SEEKABLE_MAGIC,
                found: magic,
            });
        }
        // Checksum columns and reserved bits are not supported
        if descriptor != DESCRIPTOR {
            return Err(SeekTableError::UnsupportedDescriptor(descriptor));
        }

        let entries_len = u64::from(frame_count) * ENTRY_SIZE as u64;
        let trailer_len = SKIPPABLE_HEADER_SIZE as u64 + entries_len + FOOTER_SIZE as u64;
        if file_len < trailer_len {
            return Err(SeekTableError::TableTruncated {
                frames: frame_count,
                file_len,
            });
        }
        let trailer_start = file_len - trailer_len;

        let mut header = [0u8; SKIPPABLE_HEADER_SIZE];
        file.read_exact_at(&mut header, trailer_start)?;
        let skippable = read_u32(&header[0..4]);
        if skippable != SKIPPABLE_MAGIC {
            return Err(SeekTableError::BadMagic {
                what: "skippable frame",
                expected: SKIPPABLE_MAGIC,
                found: skippable,
            });
        }
        let body_len = read_u32(&header[4..8]);
        if u64::from(body_len) != entries_len + FOOTER_SIZE as u64 {
            return Err(SeekTableError::LengthMismatch {
                frames: frame_count,
                found: body_len,
            });
        }

        let mut raw = vec![0u8; entries_len as usize];
        file.read_exact_at(&mut raw, trailer_start + SKIPPABLE_HEADER_SIZE as u64)?;
        let entries = raw
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| SeekTableEntry {
                compressed_size: read_u32(&chunk[0..4]),
                decompressed_size: read_u32(&chunk[4..8]),
            })
            .collect::<Vec<_>>();

        let table = Self { entries };
        if table.payload_size() != trailer_start {
            return Err(SeekTableError::PayloadMismatch {
                covered: table.payload_size(),
                trailer_start,
            });
        }
        Ok(table)
    }

    /// Locate the frame holding decompressed byte `offset`.
    pub fn frame_for_offset(&self, offset: u64) -> Option<FrameLocation> {
        let mut compressed_offset = 0u64;
        let mut decompressed_offset = 0u64;
        for (index, entry) in self.entries.iter().enumerate() {
            let end = decompressed_offset + u64::from(entry.decompressed_size);
            if offset < end {
                return Some(FrameLocation {
                    index,
                    compressed_offset,
                    decompressed_offset,
                    entry: *entry,
                });
            }
            compressed_offset += u64::from(entry.compressed_size);
            decompressed_offset = end;
        }
        None
    }

    /// Decompress frame `index` of `file` without touching other frames.
    pub fn read_frame(&self, file: &File, index: usize) -> Result<Vec<u8>, SeekTableError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(SeekTableError::NoSuchFrame(index))?;
        let offset: u64 = self.entries[..index]
            .iter()
            .map(|e| u64::from(e.compressed_size))
            .sum();

        let mut frame = vec![0u8; entry.compressed_size as usize];
        file.read_exact_at(&mut frame, offset)?;

        let mut decompressor = Decompressor::new()?;
        let data = decompressor
            .decompress(&frame, entry.decompressed_size as usize)
            .map_err(|e| SeekTableError::BadFrame {
                offset,
                reason: e.to_string(),
            })?;
        if data.len() != entry.decompressed_size as usize {
            return Err(SeekTableError::BadFrame {
                offset,
                reason: format!(
                    "decompressed to {} bytes, table says {}",
                    data.len(),
                    entry.decompressed_size
                ),
            });
        }
        Ok(data)
    }
}

/// Largest compressed frame a payload frame can occupy.
///
/// Incompressible input grows slightly, so the scan window has to be
/// the compress bound of a full frame rather than the frame cap itself.
pub fn scan_window_size() -> usize {
    zstd::zstd_safe::compress_bound(MAX_FRAME_INPUT)
}

/// Measures payload frames one at a time.
pub struct FrameScanner {
    decompressor: Decompressor<'static>,
    window: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Result<Self, SeekTableError> {
        Ok(Self {
            decompressor: Decompressor::new()?,
            window: vec![0u8; scan_window_size()],
        })
    }

    /// Measure the frame starting at `offset`; the payload ends at `end`.
    ///
    /// Reads one window, asks zstd for the exact length of the complete
    /// frame at its head, then decompresses just that frame to learn its
    /// decompressed size.
    pub fn measure(
        &mut self,
        file: &File,
        offset: u64,
        end: u64,
    ) -> Result<SeekTableEntry, SeekTableError> {
        let available = (end - offset).min(self.window.len() as u64) as usize;
        let window = &mut self.window[..available];
        file.read_exact_at(window, offset)?;

        let compressed = zstd::zstd_safe::find_frame_compressed_size(window).map_err(|code| {
            SeekTableError::BadFrame {
                offset,
                reason: zstd::zstd_safe::get_error_name(code).to_string(),
            }
        })?;

        let decompressed = self
            .decompressor
            .decompress(&window[..compressed], MAX_FRAME_INPUT)
            .map_err(|e| SeekTableError::BadFrame {
                offset,
                reason: e.to_string(),
            })?;

        Ok(SeekTableEntry {
            compressed_size: compressed as u32,
            decompressed_size: decompressed.len() as u32,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FrameWriter;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::TempDir;
    use vmdisk_shared::constants::seekable::DESCRIPTOR_CHECKSUM_FLAG;

    fn entry(compressed_size: u32, decompressed_size: u32) -> SeekTableEntry {
        SeekTableEntry {
            compressed_size,
            decompressed_size,
        }
    }

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> File {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        File::open(&path).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let mut table = SeekTable::new();
        table.push(entry(10, 20)).unwrap();
        table.push(entry(30, 40)).unwrap();

        let bytes = table.encode().unwrap();
        assert_eq!(bytes.len(), table.encoded_len());
        assert_eq!(bytes.len(), 8 + 16 + 9);
        assert_eq!(&bytes[0..4], &[0x5E, 0x2A, 0x4D, 0x18]);
        // length covers entries and footer
        assert_eq!(read_u32(&bytes[4..8]), 16 + 9);
        assert_eq!(read_u32(&bytes[8..12]), 10);
        assert_eq!(read_u32(&bytes[12..16]), 20);
        let footer = &bytes[bytes.len() - 9..];
        assert_eq!(read_u32(&footer[0..4]), 2);
        assert_eq!(footer[4], 0);
        assert_eq!(&footer[5..9], &[0xB1, 0xEA, 0x92, 0x8F]);
    }

    #[test]
    fn test_empty_table_encodes() {
        let bytes = SeekTable::new().encode().unwrap();
        assert_eq!(bytes.len(), 17);
    }

    #[test]
    fn test_read_from_rejects_bad_footer_magic() {
        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "junk", &[0u8; 64]);

        let err = SeekTable::read_from(&file).unwrap_err();
        assert!(matches!(err, SeekTableError::BadMagic { .. }));
    }

    #[test]
    fn test_read_from_rejects_short_file() {
        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "short", b"abc");

        let err = SeekTable::read_from(&file).unwrap_err();
        assert!(matches!(err, SeekTableError::Truncated(3)));
    }

    #[test]
    fn test_read_from_rejects_oversized_frame_count() {
        let mut bytes = SeekTable::new().encode().unwrap();
        let count = bytes.len() - 9;
        bytes[count..count + 4].copy_from_slice(&1000u32.to_le_bytes());

        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "oversized", &bytes);

        let err = SeekTable::read_from(&file).unwrap_err();
        assert!(matches!(
            err,
            SeekTableError::TableTruncated {
                frames: 1000,
                file_len: 17
            }
        ));
    }

    #[test]
    fn test_read_from_rejects_checksummed_tables() {
        let mut bytes = SeekTable::new().encode().unwrap();
        let descriptor = bytes.len() - 5;
        bytes[descriptor] = DESCRIPTOR_CHECKSUM_FLAG;

        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "checksummed", &bytes);

        let err = SeekTable::read_from(&file).unwrap_err();
        assert!(matches!(err, SeekTableError::UnsupportedDescriptor(0x80)));
    }

    #[test]
    fn test_scan_and_random_access() {
        let input: Vec<u8> = (0..(MAX_FRAME_INPUT * 3 + 17))
            .map(|i| (i * 7 % 256) as u8)
            .collect();
        let mut writer = FrameWriter::new(Vec::new(), 3).unwrap();
        writer.write_input(&input).unwrap();
        let payload = writer.finish().unwrap();

        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "payload.zst", &payload);

        let mut scanner = FrameScanner::new().unwrap();
        let mut table = SeekTable::new();
        let mut offset = 0u64;
        while offset < payload.len() as u64 {
            let entry = scanner
                .measure(&file, offset, payload.len() as u64)
                .unwrap();
            offset += u64::from(entry.compressed_size);
            table.push(entry).unwrap();
        }

        assert_eq!(table.len(), 4);
        assert_eq!(table.payload_size(), payload.len() as u64);
        assert_eq!(table.decompressed_size(), input.len() as u64);

        let target = (MAX_FRAME_INPUT * 2 + 5) as u64;
        let location = table.frame_for_offset(target).unwrap();
        assert_eq!(location.index, 2);
        assert_eq!(location.decompressed_offset, (MAX_FRAME_INPUT * 2) as u64);

        let frame = table.read_frame(&file, location.index).unwrap();
        assert_eq!(frame[5], input[target as usize]);
        assert!(table.frame_for_offset(input.len() as u64).is_none());
    }

    #[test]
    fn test_measure_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let file = write_file(&dir, "garbage", &[0x42; 32]);

        let mut scanner = FrameScanner::new().unwrap();
        let err = scanner.measure(&file, 0, 32).unwrap_err();
        assert!(matches!(err, SeekTableError::BadFrame { offset: 0, .. }));
    }

    proptest! {
        #[test]
        fn prop_trailer_roundtrip(
            sizes in prop::collection::vec((1u32..4096, 1u32..131072), 0..64),
        ) {
            let mut table = SeekTable::new();
            let mut payload_len = 0usize;
            for (c, d) in &sizes {
                table.push(entry(*c, *d)).unwrap();
                payload_len += *c as usize;
            }

            // Payload bytes are never inspected by read_from
            let mut bytes = vec![0u8; payload_len];
            bytes.extend(table.encode().unwrap());

            let dir = TempDir::new().unwrap();
            let file = write_file(&dir, "trailer", &bytes);
            let parsed = SeekTable::read_from(&file).unwrap();

            prop_assert_eq!(&parsed, &table);
            prop_assert_eq!(parsed.payload_size(), payload_len as u64);
        }
    }
}
