use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

/// Install the global subscriber once. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) {
	TRACING_INIT.get_or_init(|| {
		let env_filter =
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

		let result = match format {
			LogFormat::Json => tracing_subscriber::registry()
				.with(env_filter)
				.with(fmt::layer().json().with_writer(std::io::stderr))
				.try_init(),
			LogFormat::Text => tracing_subscriber::registry()
				.with(env_filter)
				.with(fmt::layer().compact().with_writer(std::io::stderr))
				.try_init(),
		};

		if let Err(err) = result {
			eprintln!("tracing init skipped: {err}");
		}
	});
}
