use tracing_subscriber::EnvFilter;

/// Filter directives for the adapter's own log output.
pub const LOG_ENV: &str = "ANNEXB2_LOG";
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber. Output goes to stderr because stdout
/// carries the special remote protocol. Calling this twice is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
