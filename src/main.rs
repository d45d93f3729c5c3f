use std::num::NonZeroUsize;
use std::path::Path;

use clap::Parser;
use color_eyre::eyre::Result;

use tcptap::config::{Cli, Settings};
use tcptap::logging;
use tcptap::manager::ProxyManager;

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();

    let settings = match &args.settings_file {
        Some(path) => Settings::load(path)?,
        None => Settings::from_cli(&args),
    };

    let severity = settings
        .logging
        .severity
        .clone()
        .unwrap_or_else(|| args.log_level.clone());
    logging::init(
        args.log_settings.as_deref(),
        settings.logging.file_name.as_deref().map(Path::new),
        &severity,
    )?;

    let workers = settings
        .thread_pool_size
        .or(args.thread_pool_size)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
        .max(1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let manager = ProxyManager::new();
        manager.run(settings).await
    })
}
