use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use vmdisk::archive::SeekTable;

use super::open_input;

#[derive(Args, Debug)]
pub struct SeekTableArgs {
    /// Seekable zstd container
    pub path: PathBuf,
}

#[derive(Serialize)]
struct FrameView {
    compressed_size: u32,
    decompressed_size: u32,
}

#[derive(Serialize)]
struct SeekTableView {
    frames: usize,
    payload_size: u64,
    decompressed_size: u64,
    entries: Vec<FrameView>,
}

pub fn execute(args: SeekTableArgs) -> anyhow::Result<()> {
    let file = open_input(&args.path)?;
    let table = SeekTable::read_from(&file)
        .map_err(|e| anyhow::anyhow!("No usable seek table in {}: {}", args.path.display(), e))?;

    let view = SeekTableView {
        frames: table.len(),
        payload_size: table.payload_size(),
        decompressed_size: table.decompressed_size(),
        entries: table
            .entries()
            .iter()
            .map(|e| FrameView {
                compressed_size: e.compressed_size,
                decompressed_size: e.decompressed_size,
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
