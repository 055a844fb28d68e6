use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;
use crate::error::{Error, ErrorSink, Result};
use crate::launcher::{new_token, Launcher};
use crate::output::OutputCapture;
use crate::process_set::ProcessSet;
use crate::types::Service;
use crate::watcher::{ChangeEvent, ChangeSource, ChangeStreams};

pub struct Supervisor {
	services: Vec<Service>,
	config: SupervisorConfig,
	launcher: Launcher,
	processes: ProcessSet,
	outputs: HashMap<String, OutputCapture>,
	errors: ErrorSink,
	error_rx: StdMutex<Option<mpsc::Receiver<Error>>>,
	source: Mutex<Option<Box<dyn ChangeSource>>>,
	launches: StdMutex<Vec<JoinHandle<()>>>,
	// Serializes restart and close so a stop sweep never overlaps another.
	cycle: Mutex<()>,
	shutdown: watch::Sender<bool>,
}

impl Supervisor {
	pub fn new(
		services: Vec<Service>,
		config: SupervisorConfig,
		source: impl ChangeSource + 'static,
	) -> Result<Arc<Self>> {
		validate_registry(&services)?;
		config.validate()?;
		// close() deletes the artifact dir.
		if let Some(service) = services.iter().find(|s| s.path.starts_with(&config.artifact_dir)) {
			return Err(Error::Config(format!(
				"{}: source lives inside the artifact dir {}",
				service.name,
				config.artifact_dir.display()
			)));
		}

		let (errors, error_rx) = ErrorSink::channel(config.error_capacity(services.len()));
		let outputs = services
			.iter()
			.map(|s| (s.name.clone(), OutputCapture::new(&s.name, config.output_lines)))
			.collect();
		let launcher = Launcher::new(
			config.build_command.clone(),
			config.artifact_dir.clone(),
			config.build_timeout,
		);
		let (shutdown, _) = watch::channel(false);
		let source: Box<dyn ChangeSource> = Box::new(source);

		Ok(Arc::new(Self {
			services,
			config,
			launcher,
			processes: ProcessSet::new(),
			outputs,
			errors,
			error_rx: StdMutex::new(Some(error_rx)),
			source: Mutex::new(Some(source)),
			launches: StdMutex::new(Vec::new()),
			cycle: Mutex::new(()),
			shutdown,
		}))
	}

	pub fn services(&self) -> &[Service] {
		&self.services
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	pub fn processes(&self) -> &ProcessSet {
		&self.processes
	}

	pub fn output(&self, service: &str) -> Option<OutputCapture> {
		self.outputs.get(service).cloned()
	}

	pub fn is_closed(&self) -> bool {
		self.processes.is_sealed()
	}

	/// Receive side of the error channel. Available once.
	pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
		self.error_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
	}

	/// Add a directory tree to the change source.
	pub async fn watch_path(&self, path: &Path) -> Result<()> {
		let mut source = self.source.lock().await;
		match source.as_mut() {
			Some(source) => source.add(path),
			None => Err(Error::Config("change source is closed".into())),
		}
	}

	/// Build and launch every service, waiting until all launches finish.
	///
	/// Failures are reported on the error channel, never returned.
	pub async fn start(self: &Arc<Self>) {
		{
			let _cycle = self.cycle.lock().await;
			self.start_all();
		}
		self.wait_launches().await;
	}

	/// Dispatch one build-and-launch task per service without waiting.
	pub fn start_all(self: &Arc<Self>) {
		if self.is_closed() {
			return;
		}
		let generation = self.processes.generation();
		let handles: Vec<JoinHandle<()>> = self
			.services
			.iter()
			.map(|service| {
				let sup = Arc::clone(self);
				let service = service.clone();
				tokio::spawn(async move { sup.launch(service, generation).await })
			})
			.collect();
		self.lock_launches().extend(handles);
	}

	/// Wait for every dispatched launch task to finish.
	pub async fn wait_launches(&self) {
		loop {
			let handles = std::mem::take(&mut *self.lock_launches());
			if handles.is_empty() {
				return;
			}
			for handle in handles {
				if let Err(e) = handle.await {
					if e.is_panic() {
						tracing::error!("launch task panicked: {}", e);
					}
				}
			}
		}
	}

	/// Stop every owned process.
	pub async fn stop_all(&self) -> Result<()> {
		self.processes.stop_all(self.config.kill_grace).await
	}

	/// Stop everything, then rebuild and relaunch every service.
	///
	/// Launches of a previous generation that are still building are
	/// abandoned, including boot launches a concurrent [`start`](Self::start)
	/// is waiting on. If the stop sweep fails the error goes to the error
	/// channel and nothing is relaunched.
	pub async fn restart(self: &Arc<Self>) {
		let _cycle = self.cycle.lock().await;
		if self.is_closed() {
			return;
		}
		let generation = self.processes.advance();
		tracing::debug!(generation, "new generation");
		self.abort_launches();

		if let Err(e) = self.stop_all().await {
			self.errors.report(e);
			return;
		}
		tracing::info!(services = self.services.len(), "restarting");
		self.start_all();
	}

	/// Consume change and error events until the source ends or the
	/// supervisor is closed.
	pub async fn watch(self: &Arc<Self>) {
		let streams = {
			let mut source = self.source.lock().await;
			source.as_mut().and_then(|s| s.streams())
		};
		let Some(ChangeStreams {
			mut changes,
			mut errors,
		}) = streams
		else {
			tracing::warn!("change source closed or already being watched");
			return;
		};

		let mut shutdown = self.shutdown.subscribe();
		if *shutdown.borrow() {
			return;
		}

		loop {
			tokio::select! {
				event = changes.recv() => match event {
					Some(event) => {
						tracing::info!(paths = ?event.paths, "change detected");
						let open = self.settle(&mut changes).await;
						self.restart().await;
						if !open {
							break;
						}
					}
					None => break,
				},
				err = errors.recv() => match err {
					Some(err) => self.errors.report(err),
					None => break,
				},
				_ = shutdown.changed() => break,
			}
		}
		tracing::info!("watch loop stopped");
	}

	/// Stop all processes, remove build artifacts and release the change source.
	///
	/// Every step runs even if an earlier one fails; the first failure is
	/// returned. Safe to call more than once.
	pub async fn close(&self) -> Result<()> {
		self.processes.seal();
		self.shutdown.send_replace(true);

		let _cycle = self.cycle.lock().await;
		self.abort_launches();

		let mut first_err = None;
		if let Err(e) = self.stop_all().await {
			first_err.get_or_insert(e);
		}

		match tokio::fs::remove_dir_all(&self.config.artifact_dir).await {
			Ok(()) => {
				tracing::info!(dir = %self.config.artifact_dir.display(), "removed build artifacts");
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => {
				first_err.get_or_insert(Error::Io(e));
			}
		}

		if let Some(mut source) = self.source.lock().await.take() {
			source.close();
		}

		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	async fn launch(self: Arc<Self>, service: Service, generation: u64) {
		let token = new_token();
		let build = match self.launcher.build(&service, &token).await {
			Ok(build) => build,
			Err(e) => {
				self.errors.report(e);
				return;
			}
		};

		let output = self
			.output(&service.name)
			.unwrap_or_else(|| OutputCapture::new(&service.name, self.config.output_lines));
		let admitted = self.processes.admit(generation, || {
			self.launcher
				.run(&service, &build, output, self.errors.clone())
		});

		match admitted {
			Ok(Some(_)) => {}
			Ok(None) => {
				tracing::debug!(service = %service.name, generation, "superseded or closing, launch skipped");
			}
			Err(e) => self.errors.report(e),
		}
	}

	/// Collapse a burst of change events. Returns `false` if the stream ended.
	async fn settle(&self, changes: &mut mpsc::Receiver<ChangeEvent>) -> bool {
		let mut merged = 0usize;
		loop {
			match tokio::time::timeout(self.config.debounce, changes.recv()).await {
				Ok(Some(_)) => merged += 1,
				Ok(None) => return false,
				Err(_) => break,
			}
		}
		if merged > 0 {
			tracing::debug!(merged, "coalesced change events");
		}
		true
	}

	fn abort_launches(&self) {
		let handles = std::mem::take(&mut *self.lock_launches());
		let mut aborted = 0;
		for handle in handles {
			if !handle.is_finished() {
				handle.abort();
				aborted += 1;
			}
		}
		if aborted > 0 {
			tracing::debug!(aborted, "abandoned in-flight launches");
		}
	}

	fn lock_launches(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
		self.launches.lock().unwrap_or_else(|e| e.into_inner())
	}
}

fn validate_registry(services: &[Service]) -> Result<()> {
	if services.is_empty() {
		return Err(Error::Config("no services defined".into()));
	}
	let mut seen = HashSet::new();
	for service in services {
		if service.name.trim().is_empty() {
			return Err(Error::Config("service with empty name".into()));
		}
		if service.path.as_os_str().is_empty() {
			return Err(Error::Config(format!("{}: empty path", service.name)));
		}
		if !seen.insert(service.name.as_str()) {
			return Err(Error::Config(format!("duplicate service name: {}", service.name)));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::watcher::ChannelSource;

	fn config() -> SupervisorConfig {
		SupervisorConfig::new("./build.sh")
	}

	#[test]
	fn rejects_empty_registry() {
		let (source, _handle) = ChannelSource::new();
		let err = Supervisor::new(vec![], config(), source).err().unwrap();
		assert!(err.to_string().contains("no services defined"));
	}

	#[test]
	fn rejects_duplicate_names() {
		let (source, _handle) = ChannelSource::new();
		let services = vec![Service::new("one", "./a"), Service::new("one", "./b")];
		let err = Supervisor::new(services, config(), source).err().unwrap();
		assert!(err.to_string().contains("duplicate service name: one"));
	}

	#[test]
	fn rejects_empty_path() {
		let (source, _handle) = ChannelSource::new();
		let services = vec![Service::new("one", "")];
		let err = Supervisor::new(services, config(), source).err().unwrap();
		assert_eq!(err.as_label(), "config");
	}

	#[test]
	fn rejects_sources_inside_artifact_dir() {
		let (source, _handle) = ChannelSource::new();
		let cfg = config().artifact_dir("/work");
		let services = vec![Service::new("one", "/work/one")];
		let err = Supervisor::new(services, cfg, source).err().unwrap();
		assert!(err.to_string().contains("inside the artifact dir"));
	}

	#[tokio::test]
	async fn errors_can_be_taken_once() {
		let (source, _handle) = ChannelSource::new();
		let sup = Supervisor::new(vec![Service::new("one", "./a")], config(), source).unwrap();
		assert!(sup.take_errors().is_some());
		assert!(sup.take_errors().is_none());
	}

	#[tokio::test]
	async fn close_without_start_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let (source, _handle) = ChannelSource::new();
		let cfg = config().artifact_dir(dir.path().join("artifacts"));
		let sup = Supervisor::new(vec![Service::new("one", "./a")], cfg, source).unwrap();
		sup.close().await.unwrap();
		sup.close().await.unwrap();
		assert!(sup.is_closed());
		assert!(sup.watch_path(dir.path()).await.is_err());
	}
}
