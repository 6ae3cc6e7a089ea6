//! Tuning options for disk image operations.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

use crate::disk::constants::{compression, copy};

/// Fixed ownership forced onto imported images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Options shared by every operation kind.
///
/// Format-defining values (frame cap, magics, xattr name) are constants,
/// not options: changing them would produce unreadable exports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskOpsOptions {
    /// Block size for create/import copies.
    ///
    /// Default: 1 MiB
    #[serde(default = "default_copy_block_size")]
    pub copy_block_size: usize,

    /// Zstd level for guest exports.
    ///
    /// Default: 3
    #[serde(default = "default_export_compression_level")]
    pub export_compression_level: i32,

    /// Deflate level for plugin VM exports.
    ///
    /// Default: 1
    #[serde(default = "default_zip_compression_level")]
    pub zip_compression_level: i64,

    /// Owner forced onto imported images.
    ///
    /// - None: effective uid/gid of this process
    #[serde(default)]
    pub import_owner: Option<ImageOwner>,

    /// Suffix appended to an import destination to form its staging
    /// directory.
    ///
    /// Default: ".import"
    #[serde(default = "default_staging_suffix")]
    pub staging_suffix: String,

    /// File name of the install image inside a new plugin VM directory.
    ///
    /// Default: "install.iso"
    #[serde(default = "default_plugin_install_image_name")]
    pub plugin_install_image_name: String,
}

fn default_copy_block_size() -> usize {
    copy::DEFAULT_BLOCK_SIZE
}

fn default_export_compression_level() -> i32 {
    compression::GUEST_EXPORT_LEVEL
}

fn default_zip_compression_level() -> i64 {
    compression::PLUGIN_EXPORT_LEVEL
}

fn default_staging_suffix() -> String {
    ".import".to_string()
}

fn default_plugin_install_image_name() -> String {
    "install.iso".to_string()
}

impl Default for DiskOpsOptions {
    fn default() -> Self {
        Self {
            copy_block_size: default_copy_block_size(),
            export_compression_level: default_export_compression_level(),
            zip_compression_level: default_zip_compression_level(),
            import_owner: None,
            staging_suffix: default_staging_suffix(),
            plugin_install_image_name: default_plugin_install_image_name(),
        }
    }
}

impl DiskOpsOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> VmDiskResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VmDiskError::from_io(format!("failed to read config {}", path.display()), e)
        })?;
        serde_json::from_str(&text).map_err(|e| {
            VmDiskError::InvalidArgument(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Owner for imported images, falling back to the effective ids.
    pub fn resolved_import_owner(&self) -> ImageOwner {
        self.import_owner.unwrap_or_else(|| ImageOwner {
            uid: nix::unistd::Uid::effective().as_raw(),
            gid: nix::unistd::Gid::effective().as_raw(),
        })
    }

    /// Copy block size, never zero.
    pub(crate) fn block_size(&self) -> usize {
        self.copy_block_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let options: DiskOpsOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.copy_block_size, 1024 * 1024);
        assert_eq!(options.export_compression_level, 3);
        assert_eq!(options.zip_compression_level, 1);
        assert_eq!(options.staging_suffix, ".import");
        assert_eq!(options.plugin_install_image_name, "install.iso");
        assert!(options.import_owner.is_none());
    }

    #[test]
    fn test_partial_override() {
        let options: DiskOpsOptions = serde_json::from_str(
            r#"{"copy_block_size": 4096, "import_owner": {"uid": 655360, "gid": 655360}}"#,
        )
        .unwrap();
        assert_eq!(options.copy_block_size, 4096);
        assert_eq!(
            options.resolved_import_owner(),
            ImageOwner {
                uid: 655360,
                gid: 655360
            }
        );
    }

    #[test]
    fn test_default_owner_is_effective_ids() {
        let owner = DiskOpsOptions::default().resolved_import_owner();
        assert_eq!(owner.uid, nix::unistd::Uid::effective().as_raw());
        assert_eq!(owner.gid, nix::unistd::Gid::effective().as_raw());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("options.json");
        std::fs::write(&path, r#"{"staging_suffix": ".partial"}"#).unwrap();

        let options = DiskOpsOptions::load(&path).unwrap();
        assert_eq!(options.staging_suffix, ".partial");
        assert_eq!(options.copy_block_size, 1024 * 1024);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            DiskOpsOptions::load(&path),
            Err(VmDiskError::InvalidArgument(_))
        ));
        assert!(matches!(
            DiskOpsOptions::load(&temp_dir.path().join("missing.json")),
            Err(VmDiskError::NotFound(_))
        ));
    }

    #[test]
    fn test_zero_block_size_is_clamped() {
        let options = DiskOpsOptions {
            copy_block_size: 0,
            ..Default::default()
        };
        assert_eq!(options.block_size(), 1);
    }
}
