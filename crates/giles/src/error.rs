//! Error types and the supervisor's error channel.
//!
//! Everything that fails inside a background task (builds, launches, output
//! scanners, kill sweeps triggered by a file change) is funneled through an
//! [`ErrorSink`] into a single bounded channel owned by whoever embeds the
//! [`Supervisor`](crate::Supervisor). Only synchronous calls such as
//! construction and [`close`](crate::Supervisor::close) return errors directly.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::output::Stream;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
	/// Bad registry or supervisor configuration.
	#[error("config error: {0}")]
	Config(String),

	#[error("build of {service} failed: {source}")]
	Build {
		service: String,
		#[source]
		source: BuildError,
	},

	#[error("failed to launch {service} ({}): {source}", .binary.display())]
	Launch {
		service: String,
		binary: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("reading {stream} of {service} failed: {source}")]
	Stream {
		service: String,
		stream: Stream,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to stop {} process(es): {}", .0.len(), join_failures(.0))]
	Kill(Vec<KillFailure>),

	#[error("watch error: {0}")]
	Watch(#[from] notify::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Short stable label for log fields.
	pub fn as_label(&self) -> &'static str {
		match self {
			Error::Config(_) => "config",
			Error::Build { .. } => "build",
			Error::Launch { .. } => "launch",
			Error::Stream { .. } => "stream",
			Error::Kill(_) => "kill",
			Error::Watch(_) => "watch",
			Error::Io(_) => "io",
		}
	}
}

/// Why a build command did not produce a binary.
#[derive(Error, Debug)]
pub enum BuildError {
	#[error("cannot prepare artifact dir {}: {source}", .dir.display())]
	Prepare {
		dir: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("cannot run {}: {source}", .command.display())]
	Spawn {
		command: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{status}\n{}", captured(.stdout, .stderr))]
	Failed {
		status: ExitStatus,
		stdout: String,
		stderr: String,
	},

	#[error("timed out after {0:?}")]
	Timeout(Duration),

	#[error("build command printed no binary path")]
	NoBinary,
}

/// A tracked process that could not be signalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillFailure {
	pub pid: u32,
	pub service: String,
	pub errno: Errno,
}

impl fmt::Display for KillFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (pid {}): {}", self.service, self.pid, self.errno)
	}
}

fn join_failures(failures: &[KillFailure]) -> String {
	failures
		.iter()
		.map(|f| f.to_string())
		.collect::<Vec<_>>()
		.join(", ")
}

fn captured(stdout: &str, stderr: &str) -> String {
	let mut parts = Vec::new();
	if !stdout.trim().is_empty() {
		parts.push(format!("stdout: {}", stdout.trim()));
	}
	if !stderr.trim().is_empty() {
		parts.push(format!("stderr: {}", stderr.trim()));
	}
	if parts.is_empty() {
		"(no output)".to_string()
	} else {
		parts.join("\n")
	}
}

/// Producer half of the error channel.
///
/// Never blocks: when the buffer is full the error is logged and dropped, so a
/// missing or slow consumer cannot stall a launch task.
#[derive(Clone, Debug)]
pub struct ErrorSink {
	tx: mpsc::Sender<Error>,
}

impl ErrorSink {
	pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Error>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { tx }, rx)
	}

	pub fn report(&self, err: Error) {
		tracing::error!(kind = err.as_label(), "{}", err);
		match self.tx.try_send(err) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(err)) => {
				tracing::warn!(kind = err.as_label(), "error channel full, dropping error");
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				tracing::debug!("error channel closed");
			}
		}
	}
}
