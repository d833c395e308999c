pub mod log;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `verbose` widens the default
/// filter; `RUST_LOG` always wins.
pub fn setup_logging(verbose: bool) {
	let default = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.try_init();
}
