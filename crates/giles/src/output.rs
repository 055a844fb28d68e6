use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
	Stdout,
	Stderr,
}

impl fmt::Display for Stream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Stream::Stdout => f.write_str("stdout"),
			Stream::Stderr => f.write_str("stderr"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
	pub stream: Stream,
	pub text: String,
}

/// Line sink for one service's child output.
///
/// Lines go to the `giles::child` tracing target, into a ring of recent
/// lines, and out to any live subscribers. One capture lives for the whole
/// supervisor lifetime, so history spans rebuilds.
#[derive(Clone, Debug)]
pub struct OutputCapture {
	service: Arc<str>,
	ring: Arc<Mutex<VecDeque<OutputLine>>>,
	capacity: usize,
	sender: broadcast::Sender<OutputLine>,
}

impl OutputCapture {
	pub fn new(service: &str, capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			service: Arc::from(service),
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
			capacity: capacity.max(1),
			sender,
		}
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	pub async fn push(&self, stream: Stream, text: String) {
		tracing::info!(target: "giles::child", service = %self.service, %stream, "{}", text);

		let line = OutputLine { stream, text };
		{
			let mut ring = self.ring.lock().await;
			if ring.len() >= self.capacity {
				ring.pop_front();
			}
			ring.push_back(line.clone());
		}

		let _ = self.sender.send(line);
	}

	pub async fn snapshot(&self) -> Vec<OutputLine> {
		let ring = self.ring.lock().await;
		ring.iter().cloned().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
		self.sender.subscribe()
	}
}
