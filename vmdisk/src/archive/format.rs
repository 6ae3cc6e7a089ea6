//! Container detection and readers for import.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use flate2::read::DeflateDecoder;
use vmdisk_shared::constants::zstd::FRAME_MAGIC_BYTES;
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};
use zip::{CompressionMethod, ZipArchive};

/// Containers an import understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Header-less zstd stream (guest export), optionally seekable.
    ZstdRaw,
    /// ZIP archive holding one entry.
    Zip,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::ZstdRaw => "zstd",
            ContainerFormat::Zip => "zip",
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detect the container by its first 4 bytes.
///
/// Anything that does not open with the zstd frame magic is handed to the
/// ZIP reader, which rejects it if it is not a ZIP either.
pub fn detect(source: &File) -> VmDiskResult<ContainerFormat> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = source
            .read_at(&mut magic[filled..], filled as u64)
            .map_err(|e| VmDiskError::from_io("failed to read source signature", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == magic.len() && magic == FRAME_MAGIC_BYTES {
        Ok(ContainerFormat::ZstdRaw)
    } else {
        Ok(ContainerFormat::Zip)
    }
}

/// Reader that counts the bytes pulled from the source.
///
/// The counter is shared so progress can be read while the reader sits
/// underneath a decoder.
pub struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Rc<Cell<u64>>) {
        let count = Rc::new(Cell::new(0));
        (
            Self {
                inner,
                count: Rc::clone(&count),
            },
            count,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n as u64);
        Ok(n)
    }
}

/// Metadata of the single entry carried by a ZIP container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntryInfo {
    pub name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub data_offset: u64,
    pub compression: CompressionMethod,
}

/// Size of the fixed part of a ZIP local file header.
const LOCAL_HEADER_LEN: usize = 30;

/// Read the first entry's metadata from a ZIP container.
pub fn read_zip_entry(source: &File) -> VmDiskResult<ZipEntryInfo> {
    let handle = source
        .try_clone()
        .map_err(|e| VmDiskError::from_io("failed to duplicate source descriptor", e))?;
    let mut archive = ZipArchive::new(BufReader::new(handle))
        .map_err(|e| VmDiskError::Archive(format!("failed to open zip archive: {}", e)))?;
    if archive.is_empty() {
        return Err(VmDiskError::Archive(
            "zip archive has no entries".to_string(),
        ));
    }

    let entry = archive
        .by_index_raw(0)
        .map_err(|e| VmDiskError::Archive(format!("failed to read zip entry: {}", e)))?;
    let name = entry.name().to_string();
    let size = entry.size();
    let compressed_size = entry.compressed_size();
    let compression = entry.compression();
    let header_start = entry.header_start();
    drop(entry);

    // The central directory does not record where the data begins; the
    // local header's variable-length fields decide that.
    let mut header = [0u8; LOCAL_HEADER_LEN];
    source
        .read_exact_at(&mut header, header_start)
        .map_err(|e| VmDiskError::from_io("failed to read zip local header", e))?;
    if header[0..4] != vmdisk_shared::constants::zip::LOCAL_HEADER_MAGIC {
        return Err(VmDiskError::Archive(format!(
            "bad local header signature at offset {}",
            header_start
        )));
    }
    let name_len = u16::from_le_bytes([header[26], header[27]]) as u64;
    let extra_len = u16::from_le_bytes([header[28], header[29]]) as u64;

    Ok(ZipEntryInfo {
        name,
        size,
        compressed_size,
        data_offset: header_start + LOCAL_HEADER_LEN as u64 + name_len + extra_len,
        compression,
    })
}

/// Owned decompressing reader over a ZIP entry.
///
/// Returns the reader plus a counter of compressed bytes consumed.
pub fn open_zip_entry(
    mut source: File,
    entry: &ZipEntryInfo,
) -> VmDiskResult<(Box<dyn Read>, Rc<Cell<u64>>)> {
    source
        .seek(SeekFrom::Start(entry.data_offset))
        .map_err(|e| VmDiskError::from_io("failed to seek to zip entry data", e))?;
    let (counting, count) = CountingReader::new(source);
    let raw = counting.take(entry.compressed_size);

    let reader: Box<dyn Read> = match entry.compression {
        CompressionMethod::Stored => Box::new(raw),
        CompressionMethod::Deflated => Box::new(DeflateDecoder::new(BufReader::new(raw))),
        other => {
            return Err(VmDiskError::Archive(format!(
                "unsupported zip compression method {:?} for {}",
                other, entry.name
            )));
        }
    };
    Ok((reader, count))
}

/// Owned decoder over a raw zstd container.
///
/// Skippable frames (the seek table trailer) are passed over by the
/// decoder, so this yields exactly the exported image bytes.
pub fn open_zstd_stream(mut source: File) -> VmDiskResult<(Box<dyn Read>, Rc<Cell<u64>>)> {
    source
        .seek(SeekFrom::Start(0))
        .map_err(|e| VmDiskError::from_io("failed to rewind source", e))?;
    let (counting, count) = CountingReader::new(source);
    let decoder = zstd::stream::read::Decoder::new(counting)
        .map_err(|e| VmDiskError::Codec(format!("failed to create zstd decoder: {}", e)))?;
    Ok((Box::new(decoder), count))
}
