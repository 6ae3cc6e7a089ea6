use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vmdisk::{DiskOpsOptions, VmId};

use crate::commands::create_plugin::CreatePluginArgs;
use crate::commands::export_guest::ExportGuestArgs;
use crate::commands::export_plugin::ExportPluginArgs;
use crate::commands::import_guest::ImportGuestArgs;
use crate::commands::seek_table::SeekTableArgs;

/// Default per-step I/O budget (8 MiB).
const DEFAULT_IO_LIMIT: u64 = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "vmdisk", version, about = "Create, export and import VM disk images")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export a guest VM disk image into a seekable zstd container
    ExportGuest(ExportGuestArgs),

    /// Export a plugin VM directory (or file) into a ZIP archive
    ExportPlugin(ExportPluginArgs),

    /// Import a guest VM disk image from a zstd or ZIP container
    ImportGuest(ImportGuestArgs),

    /// Create a plugin VM directory from an install image
    CreatePlugin(CreatePluginArgs),

    /// Print the seek table of a seekable zstd container as JSON
    SeekTable(SeekTableArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// JSON file with operation options
    #[arg(long, global = true, env = "VMDISK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bytes of work per step before yielding
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_IO_LIMIT,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub io_limit: u64,

    /// Milliseconds between progress reports
    #[arg(long, global = true, default_value_t = 1000)]
    pub progress_interval: u64,

    /// Write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Print the final operation state as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

impl GlobalFlags {
    /// Options from `--config`, or defaults.
    pub fn load_options(&self) -> anyhow::Result<DiskOpsOptions> {
        match &self.config {
            Some(path) => Ok(DiskOpsOptions::load(path)?),
            None => Ok(DiskOpsOptions::default()),
        }
    }
}

/// Identifies the VM an operation belongs to.
#[derive(Args, Debug)]
pub struct VmArgs {
    /// Owner of the VM
    #[arg(long, default_value = "local")]
    pub owner_id: String,

    /// Name of the VM
    #[arg(long)]
    pub vm_name: String,
}

impl VmArgs {
    pub fn vm_id(&self) -> VmId {
        VmId::new(self.owner_id.clone(), self.vm_name.clone())
    }
}
