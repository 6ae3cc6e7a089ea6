//! On-disk format constants.
//!
//! Everything here is part of a bit-exact container format; changing a
//! value breaks compatibility with previously exported images.

/// Zstd stream constants.
pub mod zstd {
    /// Magic number opening every regular zstd frame.
    pub const FRAME_MAGIC: u32 = 0xFD2F_B528;

    /// `FRAME_MAGIC` as it appears on disk (little-endian).
    pub const FRAME_MAGIC_BYTES: [u8; 4] = FRAME_MAGIC.to_le_bytes();
}

/// ZIP container constants.
pub mod zip {
    /// Local file header signature ("PK\x03\x04").
    pub const LOCAL_HEADER_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
}

/// Seekable zstd trailer layout.
///
/// ```text
/// +----------------------+---------------+----------------------------+
/// | skippable magic (u32)| length (u32)  | entries: N x (u32, u32)    |
/// +----------------------+---------------+----------------------------+
/// | frame_count (u32) | descriptor (u8) | seekable magic (u32)         |
/// +-------------------+-----------------+------------------------------+
/// ```
///
/// `length` counts the entries plus the footer, so the whole trailer is a
/// single skippable frame to a generic zstd decoder.
pub mod seekable {
    /// Magic of the skippable frame carrying the seek table.
    pub const SKIPPABLE_MAGIC: u32 = 0x184D_2A5E;

    /// Magic closing the footer, at the very end of the file.
    pub const SEEKABLE_MAGIC: u32 = 0x8F92_EAB1;

    /// Footer descriptor byte. Bit 7 would flag per-frame checksums; we
    /// never write them.
    pub const DESCRIPTOR: u8 = 0;

    /// Descriptor bit announcing a checksum column in each entry.
    pub const DESCRIPTOR_CHECKSUM_FLAG: u8 = 0x80;

    /// Size of one `(compressed_size, decompressed_size)` entry.
    pub const ENTRY_SIZE: usize = 8;

    /// Size of the skippable frame header (magic + length).
    pub const SKIPPABLE_HEADER_SIZE: usize = 8;

    /// Size of the `(frame_count, descriptor, magic)` footer.
    pub const FOOTER_SIZE: usize = 9;

    /// Maximum decompressed bytes carried by one frame (128 KiB).
    pub const MAX_FRAME_INPUT: usize = 128 * 1024;
}

/// Extended attributes written on disk images.
pub mod xattrs {
    /// Marks a disk image as sized by the user; automatic resizing
    /// must leave it alone.
    pub const USER_CHOSEN_SIZE: &str = "user.crostini.user_chosen_size";

    /// Value stored in [`USER_CHOSEN_SIZE`].
    pub const USER_CHOSEN_SIZE_VALUE: &[u8] = b"1";
}
