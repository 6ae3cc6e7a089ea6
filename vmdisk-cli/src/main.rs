mod cli;
mod commands;

use std::io::IsTerminal;

use clap::Parser;
use cli::{Cli, Commands, GlobalFlags};
use tracing_appender::non_blocking::WorkerGuard;

/// Initialize tracing.
///
/// Logs go to stderr, or to `<log_dir>/vmdisk.log` with daily rotation
/// when `--log-dir` is given. Returns the guard that keeps the
/// background writer alive.
fn init_logging(global: &GlobalFlags) -> anyhow::Result<WorkerGuard> {
    let env_filter = vmdisk::util::env_filter_or("info");

    let guard = match &global.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "vmdisk.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            vmdisk::util::register_to_tracing(non_blocking, env_filter, false);
            guard
        }
        None => {
            let ansi = std::io::stderr().is_terminal();
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            vmdisk::util::register_to_tracing(non_blocking, env_filter, ansi);
            guard
        }
    };
    Ok(guard)
}

// Operations are single-threaded objects, so everything runs on one thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.global)?;

    match cli.command {
        Commands::ExportGuest(args) => commands::export_guest::execute(args, &cli.global).await,
        Commands::ExportPlugin(args) => commands::export_plugin::execute(args, &cli.global).await,
        Commands::ImportGuest(args) => commands::import_guest::execute(args, &cli.global).await,
        Commands::CreatePlugin(args) => commands::create_plugin::execute(args, &cli.global).await,
        Commands::SeekTable(args) => commands::seek_table::execute(args),
    }
}
