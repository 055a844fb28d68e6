mod config;
mod observability;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use giles::{FsWatcher, Supervisor, WatchMode};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;

use config::Overrides;
use observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "giles", version, about = "Rebuild and restart local services on every change")]
struct Cli {
	/// Service registry
	#[arg(default_value = "giles.toml")]
	config: PathBuf,

	/// Build command, overrides `build` in the registry
	#[arg(long, value_name = "PATH")]
	build: Option<PathBuf>,

	/// Directory handed to the build command for its output; removed on exit
	#[arg(long, value_name = "DIR")]
	artifact_dir: Option<PathBuf>,

	/// Scan watched trees every MS milliseconds instead of using native notifications
	#[arg(long, value_name = "MS")]
	poll: Option<u64>,

	/// Quiet period that collapses a burst of changes into one restart
	#[arg(long, value_name = "MS")]
	debounce: Option<u64>,

	/// Log background errors and keep running instead of exiting
	#[arg(long)]
	keep_going: bool,

	#[arg(long, value_enum, default_value_t = LogFormat::Text)]
	log_format: LogFormat,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	observability::init_tracing(cli.log_format);
	let code = run(cli).await;
	std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
	let overrides = Overrides {
		build: cli.build.clone(),
		artifact_dir: cli.artifact_dir.clone(),
		poll_interval_ms: cli.poll,
		debounce_ms: cli.debounce,
	};
	let registry = match config::load(&cli.config, &overrides) {
		Ok(r) => r,
		Err(e) => {
			report(&e);
			return 1;
		}
	};

	let mode = match registry.poll_interval {
		Some(interval) => WatchMode::Poll(interval),
		None => WatchMode::Native,
	};
	let sup = match FsWatcher::new(mode)
		.and_then(|watcher| Supervisor::new(registry.services, registry.supervisor, watcher))
	{
		Ok(sup) => sup,
		Err(e) => {
			report(&e);
			return 1;
		}
	};

	for path in &registry.watch_paths {
		if let Err(e) = sup.watch_path(path).await {
			report(&e);
			shutdown(&sup).await;
			return 1;
		}
	}

	let Some(mut errors) = sup.take_errors() else {
		shutdown(&sup).await;
		return 1;
	};

	eprintln!(
		"{} {} services, watching {} paths",
		"giles".bold(),
		sup.services().len().cyan(),
		registry.watch_paths.len().cyan()
	);
	sup.start().await;

	let watcher = Arc::clone(&sup);
	tokio::spawn(async move { watcher.watch().await });

	let mut code = tokio::select! {
		code = drain_errors(&mut errors, cli.keep_going) => code,
		signal = signals::wait_for_shutdown_signal() => match signal {
			Ok(name) => {
				tracing::info!(signal = name, "shutting down");
				0
			}
			Err(e) => {
				tracing::error!("signal handler failed: {}", e);
				1
			}
		},
	};

	if !shutdown(&sup).await {
		code = 1;
	}
	code
}

/// Resolves with the exit code once an error ends the session.
async fn drain_errors(errors: &mut mpsc::Receiver<giles::Error>, keep_going: bool) -> i32 {
	while let Some(err) = errors.recv().await {
		if keep_going {
			continue;
		}
		report(&err);
		return 1;
	}
	0
}

async fn shutdown(sup: &Supervisor) -> bool {
	match sup.close().await {
		Ok(()) => true,
		Err(e) => {
			report(&e);
			false
		}
	}
}

fn report(err: &giles::Error) {
	eprintln!("{} {}", "error:".red().bold(), err);
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::CommandFactory;

	#[test]
	fn cli_definition_is_valid() {
		Cli::command().debug_assert();
	}

	#[test]
	fn parses_flags() {
		let cli = Cli::parse_from([
			"giles",
			"dev.toml",
			"--poll",
			"500",
			"--keep-going",
			"--log-format",
			"json",
		]);
		assert_eq!(cli.config, PathBuf::from("dev.toml"));
		assert_eq!(cli.poll, Some(500));
		assert!(cli.keep_going);
		assert_eq!(cli.log_format, LogFormat::Json);
		assert!(cli.build.is_none());
	}

	#[test]
	fn config_defaults_to_giles_toml() {
		let cli = Cli::parse_from(["giles"]);
		assert_eq!(cli.config, PathBuf::from("giles.toml"));
		assert_eq!(cli.log_format, LogFormat::Text);
	}
}
