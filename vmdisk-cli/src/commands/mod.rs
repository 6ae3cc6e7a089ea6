pub mod create_plugin;
pub mod export_guest;
pub mod export_plugin;
pub mod import_guest;
pub mod seek_table;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use vmdisk::{DiskImageOperation, DiskImageStatus};

use crate::cli::GlobalFlags;

/// Drive `op` to a final status, yielding to the runtime between steps.
///
/// Ctrl-C drops the operation, which releases its handles and removes any
/// staging directory it still owns.
pub async fn drive(mut op: DiskImageOperation, global: &GlobalFlags) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(global.progress_interval.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while op.status() == DiskImageStatus::InProgress {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                tracing::warn!(uuid = %op.uuid(), "Interrupted, discarding operation");
                anyhow::bail!("Operation {} cancelled", op.uuid());
            }
            _ = ticker.tick() => {
                tracing::info!(
                    uuid = %op.uuid(),
                    kind = %op.kind(),
                    progress = op.progress(),
                    processed = op.processed_size(),
                    "Progress"
                );
            }
            _ = tokio::task::yield_now() => {
                op.run(global.io_limit)?;
            }
        }
    }

    report(&op, global)
}

/// Print the outcome; a failed operation is an error exit.
fn report(op: &DiskImageOperation, global: &GlobalFlags) -> anyhow::Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(&op.info())?);
    } else {
        println!("{} {}", op.uuid(), op.status());
    }

    if !op.status().is_success() {
        anyhow::bail!(
            "Operation {} ended with {}: {}",
            op.uuid(),
            op.status(),
            op.failure_reason()
        );
    }
    Ok(())
}

/// Create (or truncate) an output file, readable so exports can re-read it.
pub fn create_output(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", path.display(), e))
}

pub fn open_input(path: &Path) -> anyhow::Result<File> {
    File::open(path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))
}
