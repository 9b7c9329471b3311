use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// map `-v` occurrences to a level, warnings are always shown
pub fn level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber writing to stderr. `RUST_LOG` takes precedence
/// over `verbosity`. Calling this twice keeps the first subscriber.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level(verbosity).into())
        .from_env_lossy();

    // stdout belongs to the job output
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    if installed.is_err() {
        tracing::debug!("A global subscriber was already installed");
    }
}
