use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
const DEFAULT_OUTPUT_LINES: usize = 500;
const MIN_ERROR_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Executable invoked as `<build_command> <path> <name> <token> <artifact_dir>`.
	pub build_command: PathBuf,
	/// Scratch directory handed to the build command; removed on close.
	pub artifact_dir: PathBuf,
	pub build_timeout: Duration,
	/// How long a SIGTERMed process group may linger before SIGKILL.
	pub kill_grace: Duration,
	/// Change events closer together than this collapse into one restart.
	pub debounce: Duration,
	/// Error channel capacity. `0` sizes it from the service count.
	pub error_buffer: usize,
	/// Recent output lines kept per service.
	pub output_lines: usize,
}

impl SupervisorConfig {
	pub fn new(build_command: impl Into<PathBuf>) -> Self {
		Self {
			build_command: build_command.into(),
			artifact_dir: default_artifact_dir(),
			build_timeout: DEFAULT_BUILD_TIMEOUT,
			kill_grace: DEFAULT_KILL_GRACE,
			debounce: DEFAULT_DEBOUNCE,
			error_buffer: 0,
			output_lines: DEFAULT_OUTPUT_LINES,
		}
	}

	pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.artifact_dir = dir.into();
		self
	}

	pub fn build_timeout(mut self, timeout: Duration) -> Self {
		self.build_timeout = timeout;
		self
	}

	pub fn kill_grace(mut self, grace: Duration) -> Self {
		self.kill_grace = grace;
		self
	}

	pub fn debounce(mut self, debounce: Duration) -> Self {
		self.debounce = debounce;
		self
	}

	pub fn error_buffer(mut self, capacity: usize) -> Self {
		self.error_buffer = capacity;
		self
	}

	pub(crate) fn error_capacity(&self, services: usize) -> usize {
		if self.error_buffer > 0 {
			self.error_buffer
		} else {
			(services * 4).max(MIN_ERROR_BUFFER)
		}
	}

	pub(crate) fn validate(&self) -> Result<()> {
		if self.build_command.as_os_str().is_empty() {
			return Err(Error::Config("build command is empty".into()));
		}
		if self.artifact_dir.as_os_str().is_empty() {
			return Err(Error::Config("artifact dir is empty".into()));
		}
		if self.build_timeout.is_zero() {
			return Err(Error::Config("build timeout must be positive".into()));
		}
		Ok(())
	}
}

fn default_artifact_dir() -> PathBuf {
	std::env::temp_dir().join(format!("giles-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = SupervisorConfig::new("./build.sh");
		assert_eq!(config.build_timeout, Duration::from_secs(300));
		assert_eq!(config.kill_grace, Duration::from_secs(3));
		assert!(config.artifact_dir.starts_with(std::env::temp_dir()));
		assert!(config.validate().is_ok());
	}

	#[test]
	fn error_capacity_scales_with_services() {
		let config = SupervisorConfig::new("./build.sh");
		assert_eq!(config.error_capacity(1), 16);
		assert_eq!(config.error_capacity(10), 40);
		assert_eq!(config.error_buffer(3).error_capacity(10), 3);
	}

	#[test]
	fn rejects_empty_build_command() {
		let err = SupervisorConfig::new("").validate().unwrap_err();
		assert_eq!(err.as_label(), "config");
	}
}
