//! Change sources feeding the supervisor's event loop.
//!
//! The supervisor only needs four things from a file-notification backend:
//! register a path, receive change events, receive errors, and shut down.
//! [`ChangeSource`] is exactly that surface. [`FsWatcher`] implements it on
//! top of `notify`; [`ChannelSource`] lets callers drive restarts by hand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

const STREAM_CAPACITY: usize = 64;

/// Something changed under a watched path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
	pub paths: Vec<PathBuf>,
}

/// Receive halves handed to the event loop.
#[derive(Debug)]
pub struct ChangeStreams {
	pub changes: mpsc::Receiver<ChangeEvent>,
	pub errors: mpsc::Receiver<Error>,
}

pub trait ChangeSource: Send {
	/// Start watching `path` and everything below it.
	fn add(&mut self, path: &Path) -> Result<()>;

	/// Take the event streams. Yields `Some` once.
	fn streams(&mut self) -> Option<ChangeStreams>;

	/// Stop producing events. Both streams end once buffered events drain.
	fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
	/// Platform notification API (inotify, FSEvents, ...).
	Native,
	/// Scan the watched trees on an interval.
	Poll(Duration),
}

/// [`ChangeSource`] backed by a `notify` watcher.
pub struct FsWatcher {
	inner: Option<Box<dyn Watcher + Send>>,
	streams: Option<ChangeStreams>,
	watched: Vec<PathBuf>,
}

impl std::fmt::Debug for FsWatcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FsWatcher")
			.field("open", &self.inner.is_some())
			.field("watched", &self.watched)
			.finish()
	}
}

impl FsWatcher {
	pub fn new(mode: WatchMode) -> Result<Self> {
		let (change_tx, changes) = mpsc::channel(STREAM_CAPACITY);
		let (error_tx, errors) = mpsc::channel(STREAM_CAPACITY);

		let handler = move |res: notify::Result<Event>| match res {
			Ok(event) => {
				if is_access(&event.kind) {
					return;
				}
				// A full buffer already guarantees a pending restart.
				let _ = change_tx.try_send(ChangeEvent { paths: event.paths });
			}
			Err(e) => {
				if error_tx.try_send(Error::Watch(e)).is_err() {
					tracing::warn!("watch error dropped, stream full or closed");
				}
			}
		};

		let inner: Box<dyn Watcher + Send> = match mode {
			WatchMode::Native => Box::new(RecommendedWatcher::new(handler, notify::Config::default())?),
			WatchMode::Poll(interval) => Box::new(PollWatcher::new(
				handler,
				notify::Config::default().with_poll_interval(interval),
			)?),
		};

		Ok(Self {
			inner: Some(inner),
			streams: Some(ChangeStreams { changes, errors }),
			watched: Vec::new(),
		})
	}

	pub fn watched(&self) -> &[PathBuf] {
		&self.watched
	}
}

impl ChangeSource for FsWatcher {
	fn add(&mut self, path: &Path) -> Result<()> {
		let inner = self
			.inner
			.as_mut()
			.ok_or_else(|| Error::Config("watcher is closed".into()))?;
		inner.watch(path, RecursiveMode::Recursive)?;
		tracing::info!(path = %path.display(), "watching");
		self.watched.push(path.to_path_buf());
		Ok(())
	}

	fn streams(&mut self) -> Option<ChangeStreams> {
		self.streams.take()
	}

	fn close(&mut self) {
		// Dropping the watcher drops the handler and with it both senders.
		if self.inner.take().is_some() {
			tracing::debug!("watcher closed");
		}
		self.streams = None;
	}
}

fn is_access(kind: &EventKind) -> bool {
	matches!(kind, EventKind::Access(_))
}

/// Hand-driven [`ChangeSource`]; events come from its [`ChannelHandle`].
#[derive(Debug)]
pub struct ChannelSource {
	streams: Option<ChangeStreams>,
	watched: Vec<PathBuf>,
}

/// Sender side of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
	changes: mpsc::Sender<ChangeEvent>,
	errors: mpsc::Sender<Error>,
}

impl ChannelSource {
	pub fn new() -> (Self, ChannelHandle) {
		let (change_tx, changes) = mpsc::channel(STREAM_CAPACITY);
		let (error_tx, errors) = mpsc::channel(STREAM_CAPACITY);
		(
			Self {
				streams: Some(ChangeStreams { changes, errors }),
				watched: Vec::new(),
			},
			ChannelHandle {
				changes: change_tx,
				errors: error_tx,
			},
		)
	}

	pub fn watched(&self) -> &[PathBuf] {
		&self.watched
	}
}

impl ChangeSource for ChannelSource {
	fn add(&mut self, path: &Path) -> Result<()> {
		self.watched.push(path.to_path_buf());
		Ok(())
	}

	fn streams(&mut self) -> Option<ChangeStreams> {
		self.streams.take()
	}

	fn close(&mut self) {
		self.streams = None;
	}
}

impl ChannelHandle {
	/// Returns `false` once the receiving side is gone.
	pub async fn change(&self, paths: Vec<PathBuf>) -> bool {
		self.changes.send(ChangeEvent { paths }).await.is_ok()
	}

	pub async fn error(&self, err: Error) -> bool {
		self.errors.send(err).await.is_ok()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn channel_source_forwards_events() {
		let (mut source, handle) = ChannelSource::new();
		source.add(Path::new("./svc")).unwrap();
		assert_eq!(source.watched(), &[PathBuf::from("./svc")]);

		let mut streams = source.streams().unwrap();
		assert!(source.streams().is_none());

		assert!(handle.change(vec![PathBuf::from("./svc/main.rs")]).await);
		let event = streams.changes.recv().await.unwrap();
		assert_eq!(event.paths, vec![PathBuf::from("./svc/main.rs")]);

		assert!(handle.error(Error::Config("boom".into())).await);
		assert_eq!(streams.errors.recv().await.unwrap().as_label(), "config");
	}

	#[tokio::test]
	async fn closed_fs_watcher_ends_streams() {
		let dir = tempfile::tempdir().unwrap();
		let mut watcher = FsWatcher::new(WatchMode::Poll(Duration::from_millis(50))).unwrap();
		watcher.add(dir.path()).unwrap();
		let mut streams = watcher.streams().unwrap();
		watcher.close();
		let drained = tokio::time::timeout(Duration::from_secs(5), async {
			while streams.changes.recv().await.is_some() {}
		})
		.await;
		assert!(drained.is_ok(), "change stream stayed open after close");
		assert!(watcher.add(dir.path()).is_err());
	}

	#[tokio::test]
	async fn fs_watcher_reports_writes() {
		let dir = tempfile::tempdir().unwrap();
		let mut watcher = FsWatcher::new(WatchMode::Poll(Duration::from_millis(50))).unwrap();
		watcher.add(dir.path()).unwrap();
		let mut streams = watcher.streams().unwrap();

		tokio::time::sleep(Duration::from_millis(100)).await;
		std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

		let event = tokio::time::timeout(Duration::from_secs(5), streams.changes.recv())
			.await
			.expect("no change event")
			.unwrap();
		assert!(!event.paths.is_empty());
		watcher.close();
	}

	#[test]
	fn missing_path_is_rejected() {
		let mut watcher = FsWatcher::new(WatchMode::Native).unwrap();
		assert!(watcher.add(Path::new("/definitely/not/here/giles")).is_err());
	}
}
