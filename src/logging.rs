//! Logging initialization for the annotee binary

use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

/// Log filter for a `-v` count
pub fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize tracing to stderr.
///
/// An explicit `filter` (from configuration) wins over the `-v` count. Logs
/// go to stderr so they never mix with the child's teed stdout.
pub fn init_logging(verbose: u8, filter: Option<&str>) {
    let filter = filter.unwrap_or_else(|| log_level(verbose));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(log_level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .with_line_number(verbose >= 3)
        .init();

    debug!("annotee started with verbosity level: {}", verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
}
