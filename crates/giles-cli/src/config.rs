use giles::{Error, Result, Service, SupervisorConfig};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

// ── Registry file format (giles.toml / giles.yaml) ───────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryFile {
	#[serde(default = "default_build")]
	pub build: String,
	pub artifact_dir: Option<String>,
	/// Directories to watch. Defaults to the service paths.
	#[serde(default)]
	pub paths: Vec<String>,
	#[serde(default = "default_build_timeout")]
	pub build_timeout: u64,
	#[serde(default = "default_kill_grace")]
	pub kill_grace: u64,
	#[serde(default = "default_debounce_ms")]
	pub debounce_ms: u64,
	pub poll_interval_ms: Option<u64>,
	#[serde(default)]
	pub services: Vec<ServiceDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDef {
	pub name: String,
	pub path: String,
}

fn default_build() -> String { "./build.sh".into() }
fn default_build_timeout() -> u64 { 300 }
fn default_kill_grace() -> u64 { 3 }
fn default_debounce_ms() -> u64 { 200 }

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub build: Option<PathBuf>,
	pub artifact_dir: Option<PathBuf>,
	pub poll_interval_ms: Option<u64>,
	pub debounce_ms: Option<u64>,
}

// ── Registry: everything the supervisor needs ───────────────────────────────

#[derive(Debug)]
pub struct Registry {
	pub services: Vec<Service>,
	pub watch_paths: Vec<PathBuf>,
	pub supervisor: SupervisorConfig,
	pub poll_interval: Option<Duration>,
}

pub fn load(path: &Path, overrides: &Overrides) -> Result<Registry> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
	let file = parse(path, &content)?;

	let parent = match path.parent() {
		Some(p) if !p.as_os_str().is_empty() => p,
		_ => Path::new("."),
	};
	let base = parent
		.canonicalize()
		.map_err(|e| Error::Config(format!("cannot resolve {}: {}", parent.display(), e)))?;

	file.resolve(&base, overrides)
}

/// Deserialize by extension: `.toml`, `.yaml` or `.yml`.
pub fn parse(path: &Path, content: &str) -> Result<RegistryFile> {
	let parsed = match path.extension().and_then(|e| e.to_str()) {
		Some("toml") => toml::from_str(content).map_err(|e| e.to_string()),
		Some("yaml") | Some("yml") => serde_yaml::from_str(content).map_err(|e| e.to_string()),
		_ => {
			return Err(Error::Config(format!(
				"config file must be .toml, .yaml or .yml, got {}",
				path.display()
			)))
		}
	};
	parsed.map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
}

impl RegistryFile {
	pub fn resolve(self, base: &Path, overrides: &Overrides) -> Result<Registry> {
		let services: Vec<Service> = self
			.services
			.iter()
			.map(|s| Service::new(s.name.clone(), resolve_path(base, &s.path)))
			.collect();

		let watch_paths = if self.paths.is_empty() {
			services.iter().map(|s| s.path.clone()).collect()
		} else {
			self.paths.iter().map(|p| resolve_path(base, p)).collect()
		};

		let build = overrides
			.build
			.clone()
			.unwrap_or_else(|| resolve_path(base, &self.build));
		let debounce = overrides.debounce_ms.unwrap_or(self.debounce_ms);

		let mut supervisor = SupervisorConfig::new(build)
			.build_timeout(Duration::from_secs(self.build_timeout))
			.kill_grace(Duration::from_secs(self.kill_grace))
			.debounce(Duration::from_millis(debounce));

		let artifact_dir = match &overrides.artifact_dir {
			Some(dir) if dir.is_relative() => {
				let cwd = std::env::current_dir()
					.map_err(|e| Error::Config(format!("cannot resolve current dir: {}", e)))?;
				Some(cwd.join(dir))
			}
			Some(dir) => Some(dir.clone()),
			None => self.artifact_dir.as_deref().map(|d| resolve_path(base, d)),
		};
		if let Some(dir) = artifact_dir {
			let dir = normalize(&dir);
			let dir = dir.canonicalize().unwrap_or(dir);
			// The artifact dir is deleted on shutdown.
			if normalize(base).starts_with(&dir) {
				return Err(Error::Config(format!(
					"artifact_dir {} contains the project directory",
					dir.display()
				)));
			}
			supervisor = supervisor.artifact_dir(dir);
		}

		let poll_interval = match overrides.poll_interval_ms.or(self.poll_interval_ms) {
			Some(0) => return Err(Error::Config("poll interval must be positive".into())),
			Some(ms) => Some(Duration::from_millis(ms)),
			None => None,
		};

		Ok(Registry {
			services,
			watch_paths,
			supervisor,
			poll_interval,
		})
	}
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
	let path = expand_tilde(raw);
	if path.is_absolute() {
		path
	} else {
		base.join(path)
	}
}

/// Drop `.` and fold `..` into its parent. Meant for absolute paths; `..`
/// at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				out.pop();
			}
			other => out.push(other.as_os_str()),
		}
	}
	out
}

fn expand_tilde(path: &str) -> PathBuf {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Ok(home) = std::env::var("HOME") {
			return PathBuf::from(home).join(rest);
		}
	}
	PathBuf::from(path)
}
