//! Disk image constants.
//!
//! Centralized location for file modes and fixed names used when
//! materializing disk images on the host.

/// File and directory permissions.
pub mod modes {
    /// Imported disk images (owner read/write only).
    pub const IMPORTED_IMAGE: u32 = 0o600;

    /// Plugin VM install image copied into the staging directory.
    pub const INSTALL_IMAGE: u32 = 0o640;

    /// Staging and freshly created VM directories.
    pub const STAGING_DIR: u32 = 0o750;
}

/// Plugin VM export layout.
pub mod plugin {
    /// Suffix of the top-level directory inside a plugin VM export.
    pub const BUNDLE_SUFFIX: &str = ".pvm";
}

/// Copy tuning.
pub mod copy {
    /// Default block size for create/import copies (1 MiB).
    pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

    /// Granularity at which all-zero runs become holes (4 KiB).
    pub const HOLE_GRANULARITY: usize = 4096;
}

/// Compression levels.
pub mod compression {
    /// Zstd level for guest exports.
    pub const GUEST_EXPORT_LEVEL: i32 = 3;

    /// Deflate level for plugin VM exports.
    pub const PLUGIN_EXPORT_LEVEL: i64 = 1;
}
