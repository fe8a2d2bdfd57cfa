use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::config::SyncConfig;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false` when a
/// subscriber was already installed, which is left untouched.
pub fn init(config: &SyncConfig) -> bool {
	let default_filter = format!(
		"{level},flx_core_sync={level},flx_sync={level}",
		level = config.log_level
	);

	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
		.with(fmt::layer().with_target(true).with_thread_ids(true))
		.try_init()
		.is_ok()
}
