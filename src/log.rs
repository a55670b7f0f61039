//! Logger bootstrap for binaries and integration tests.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

/// Initialize a terminal logger at `level`, optionally mirrored at debug
/// level into `file`. Calling this twice is harmless (the second attempt
/// is ignored).
pub fn setup_logger(level: LevelFilter, file: Option<&Path>) -> Result<()> {
    let config = ConfigBuilder::new().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if let Some(path) = file {
        let log_file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, log_file));
    }

    CombinedLogger::init(loggers).ok();
    Ok(())
}
