use std::io::Read;

use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, ansi: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}

/// Env filter from `RUST_LOG`, defaulting to `default_directive`.
pub fn env_filter_or(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// How many bytes the next chunk may cover under `budget`.
///
/// Never zero while budget remains, so a copy loop always progresses.
pub(crate) fn chunk_len(budget: u64, block_size: usize) -> usize {
    budget.min(block_size as u64).max(1) as usize
}

/// Fill `buf` as far as the reader allows; short only at end of input.
///
/// Decoders return short reads at frame boundaries; copying those as-is
/// would defeat hole detection on block boundaries.
pub(crate) fn read_full<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    context: &str,
) -> VmDiskResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(VmDiskError::from_io(context, e)),
        }
    }
    Ok(filled)
}
