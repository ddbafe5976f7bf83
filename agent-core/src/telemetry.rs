// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: OnceLock<()> = OnceLock::new();

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// Installs a global tracing subscriber. Safe to call more than once; only the first
/// call takes effect, matching the idempotent setup pattern the rest of the process
/// shell relies on.
pub fn setup_logging(format: LogFormat, default_filter: &str) {
	INIT.get_or_init(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
		let registry = tracing_subscriber::registry().with(filter);
		match format {
			LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
			LogFormat::Json => registry
				.with(tracing_subscriber::fmt::layer().json().flatten_event(true))
				.init(),
		}
	});
}

pub mod testing {
	use super::*;

	/// Test-only logging setup: human-readable, verbose by default, never panics if a
	/// prior test already installed a subscriber.
	pub fn setup_test_logging() {
		setup_logging(LogFormat::Text, "debug");
	}
}
