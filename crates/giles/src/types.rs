use std::path::{Path, PathBuf};

/// One child program the supervisor builds and keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
	pub name: String,
	pub path: PathBuf,
}

impl Service {
	pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			path: path.into(),
		}
	}
}

/// What a successful build hands to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
	pub binary: PathBuf,
}

impl BuildOutput {
	pub fn binary(&self) -> &Path {
		&self.binary
	}
}

/// A child this supervisor spawned and must stop on restart or shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
	pub pid: u32,
	pub service: String,
}
