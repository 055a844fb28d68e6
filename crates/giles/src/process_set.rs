use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::time::Instant;

use crate::error::{Error, KillFailure, Result};
use crate::types::TrackedProcess;

const EXIT_POLL: Duration = Duration::from_millis(50);

/// Pids owned by the supervisor.
///
/// Launch tasks add to it concurrently; a stop sweep drains it. Every launch
/// is tagged with the generation it was dispatched in and is refused once a
/// newer generation has begun. Once sealed it admits nothing new.
#[derive(Debug, Default)]
pub struct ProcessSet {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	procs: Vec<TrackedProcess>,
	generation: u64,
	sealed: bool,
}

impl ProcessSet {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Run `launch` and record the process it returns.
	///
	/// The launch happens under the lock so a concurrent seal or generation
	/// bump can never miss a freshly spawned child. Returns `Ok(None)` without
	/// launching once the set is sealed or `generation` is no longer current.
	pub fn admit<F>(&self, generation: u64, launch: F) -> Result<Option<u32>>
	where
		F: FnOnce() -> Result<TrackedProcess>,
	{
		let mut inner = self.lock();
		if inner.sealed || inner.generation != generation {
			return Ok(None);
		}
		let proc = launch()?;
		let pid = proc.pid;
		inner.procs.push(proc);
		Ok(Some(pid))
	}

	pub fn generation(&self) -> u64 {
		self.lock().generation
	}

	/// Start a new generation; launches tagged with an older one are refused.
	pub(crate) fn advance(&self) -> u64 {
		let mut inner = self.lock();
		inner.generation += 1;
		inner.generation
	}

	pub fn pids(&self) -> Vec<u32> {
		self.lock().procs.iter().map(|p| p.pid).collect()
	}

	pub fn snapshot(&self) -> Vec<TrackedProcess> {
		self.lock().procs.clone()
	}

	pub fn len(&self) -> usize {
		self.lock().procs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().procs.is_empty()
	}

	pub fn is_sealed(&self) -> bool {
		self.lock().sealed
	}

	pub(crate) fn seal(&self) {
		self.lock().sealed = true;
	}

	/// Stop every tracked process group.
	///
	/// Every pid is attempted even when an earlier one fails. Groups that are
	/// already gone count as stopped. Signalled groups get `grace` to exit
	/// before SIGKILL. Pids that could not be signalled, with either signal,
	/// stay tracked and are returned together as [`Error::Kill`].
	pub async fn stop_all(&self, grace: Duration) -> Result<()> {
		let targets = std::mem::take(&mut self.lock().procs);
		if targets.is_empty() {
			return Ok(());
		}

		let mut signalled = Vec::new();
		let mut failures = Vec::new();

		for proc in targets {
			match signal_group(proc.pid, Signal::SIGTERM) {
				Ok(true) => signalled.push(proc),
				Ok(false) => {
					tracing::debug!(service = %proc.service, pid = proc.pid, "already exited");
				}
				Err(errno) => {
					tracing::warn!(service = %proc.service, pid = proc.pid, "kill failed: {}", errno);
					failures.push((proc, errno));
				}
			}
		}

		failures.extend(wait_or_kill(signalled, grace).await);

		if failures.is_empty() {
			return Ok(());
		}

		let mut inner = self.lock();
		let mut report = Vec::with_capacity(failures.len());
		for (proc, errno) in failures {
			report.push(KillFailure {
				pid: proc.pid,
				service: proc.service.clone(),
				errno,
			});
			inner.procs.push(proc);
		}
		Err(Error::Kill(report))
	}
}

fn group_id(pid: u32) -> std::result::Result<Pid, Errno> {
	i32::try_from(pid).map(Pid::from_raw).map_err(|_| Errno::EINVAL)
}

/// Signal a process group. `Ok(false)` means the group no longer exists.
fn signal_group(pid: u32, signal: Signal) -> std::result::Result<bool, Errno> {
	match killpg(group_id(pid)?, signal) {
		Ok(()) => Ok(true),
		Err(Errno::ESRCH) => Ok(false),
		Err(e) => Err(e),
	}
}

fn group_alive(pid: u32) -> bool {
	match group_id(pid) {
		Ok(pgid) => killpg(pgid, None).is_ok(),
		Err(_) => false,
	}
}

/// Wait out `grace`, then SIGKILL whatever is left. Returns the groups that
/// could not be killed.
async fn wait_or_kill(
	mut procs: Vec<TrackedProcess>,
	grace: Duration,
) -> Vec<(TrackedProcess, Errno)> {
	let deadline = Instant::now() + grace;

	loop {
		procs.retain(|p| {
			let alive = group_alive(p.pid);
			if !alive {
				tracing::info!(service = %p.service, pid = p.pid, "killed");
			}
			alive
		});
		if procs.is_empty() {
			return Vec::new();
		}
		if Instant::now() >= deadline {
			break;
		}
		tokio::time::sleep(EXIT_POLL).await;
	}

	let mut failures = Vec::new();
	for proc in procs {
		tracing::warn!(service = %proc.service, pid = proc.pid, "still running after {:?}, sending SIGKILL", grace);
		match signal_group(proc.pid, Signal::SIGKILL) {
			Ok(_) => {}
			Err(errno) => {
				tracing::warn!(service = %proc.service, pid = proc.pid, "SIGKILL failed: {}", errno);
				failures.push((proc, errno));
			}
		}
	}
	failures
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tracked(pid: u32) -> TrackedProcess {
		TrackedProcess {
			pid,
			service: format!("svc-{}", pid),
		}
	}

	#[test]
	fn admit_records_pid() {
		let set = ProcessSet::new();
		assert_eq!(set.admit(0, || Ok(tracked(42))).unwrap(), Some(42));
		assert_eq!(set.pids(), vec![42]);
		assert_eq!(set.len(), 1);
	}

	#[test]
	fn failed_launch_records_nothing() {
		let set = ProcessSet::new();
		let res = set.admit(0, || Err(Error::Config("nope".into())));
		assert!(res.is_err());
		assert!(set.is_empty());
	}

	#[test]
	fn sealed_set_skips_launch() {
		let set = ProcessSet::new();
		set.seal();
		let mut called = false;
		let res = set.admit(0, || {
			called = true;
			Ok(tracked(7))
		});
		assert_eq!(res.unwrap(), None);
		assert!(!called);
		assert!(set.is_empty());
	}

	#[test]
	fn stale_generation_skips_launch() {
		let set = ProcessSet::new();
		let boot = set.generation();
		assert_eq!(set.advance(), boot + 1);
		let mut called = false;
		let res = set.admit(boot, || {
			called = true;
			Ok(tracked(9))
		});
		assert_eq!(res.unwrap(), None);
		assert!(!called);
		assert_eq!(set.admit(boot + 1, || Ok(tracked(10))).unwrap(), Some(10));
	}

	#[tokio::test]
	async fn unsignallable_pid_stays_tracked() {
		let set = ProcessSet::new();
		set.admit(0, || Ok(tracked(u32::MAX))).unwrap();

		let err = set.stop_all(Duration::from_millis(10)).await.unwrap_err();
		match err {
			Error::Kill(failures) => {
				assert_eq!(failures.len(), 1);
				assert_eq!(failures[0].pid, u32::MAX);
				assert_eq!(failures[0].errno, Errno::EINVAL);
			}
			other => panic!("expected kill error, got {:?}", other),
		}
		assert_eq!(set.pids(), vec![u32::MAX]);
	}

	#[test]
	fn group_id_rejects_overflow() {
		assert_eq!(group_id(u32::MAX), Err(Errno::EINVAL));
		assert_eq!(group_id(42), Ok(Pid::from_raw(42)));
	}

	#[tokio::test]
	async fn stop_all_on_empty_set_is_ok() {
		let set = ProcessSet::new();
		assert!(set.stop_all(Duration::from_millis(10)).await.is_ok());
	}

	#[tokio::test]
	async fn stop_all_kills_process_group() {
		let child = tokio::process::Command::new("sleep")
			.arg("60")
			.process_group(0)
			.kill_on_drop(true)
			.spawn()
			.unwrap();
		let pid = child.id().unwrap();
		let set = ProcessSet::new();
		set.admit(set.generation(), || Ok(tracked(pid))).unwrap();

		// Reap in the background so the group disappears once it dies.
		let waiter = tokio::spawn(async move {
			let mut child = child;
			child.wait().await
		});

		set.stop_all(Duration::from_secs(2)).await.unwrap();
		assert!(set.is_empty());
		let status = waiter.await.unwrap().unwrap();
		assert!(!status.success());
	}
}
