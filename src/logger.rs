//! Logging setup.

/// Stderr logger so cue blocks on stdout stay clean.
pub fn init_logger(verbose: bool) -> Result<(), fern::InitError> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let format = |out: fern::FormatCallback<'_>, message: &std::fmt::Arguments<'_>, record: &log::Record| {
        out.finish(format_args!(
            "[{}][{}][{}][{:?}] {}",
            chrono::Local::now().format("%Y-%m-%d"),
            chrono::Local::now().format("%H:%M:%S"),
            record.target(),
            record.level(),
            message
        ))
    };

    fern::Dispatch::new()
        .format(format)
        .level(level)
        .chain(std::io::stderr())
        .apply()?;

    Ok(())
}
