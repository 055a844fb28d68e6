use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::{BuildError, Error, ErrorSink, Result};
use crate::output::{OutputCapture, Stream};
use crate::types::{BuildOutput, Service, TrackedProcess};

/// Builds service binaries with an external command and launches them.
#[derive(Debug, Clone)]
pub struct Launcher {
	build_command: PathBuf,
	artifact_dir: PathBuf,
	build_timeout: Duration,
}

impl Launcher {
	pub fn new(build_command: PathBuf, artifact_dir: PathBuf, build_timeout: Duration) -> Self {
		Self {
			build_command,
			artifact_dir,
			build_timeout,
		}
	}

	/// Run the build command for `service` and return the binary it printed.
	pub async fn build(&self, service: &Service, token: &str) -> Result<BuildOutput> {
		self.build_inner(service, token)
			.await
			.map_err(|source| Error::Build {
				service: service.name.clone(),
				source,
			})
	}

	async fn build_inner(
		&self,
		service: &Service,
		token: &str,
	) -> std::result::Result<BuildOutput, BuildError> {
		tokio::fs::create_dir_all(&self.artifact_dir)
			.await
			.map_err(|source| BuildError::Prepare {
				dir: self.artifact_dir.clone(),
				source,
			})?;

		let mut cmd = Command::new(&self.build_command);
		cmd.arg(&service.path)
			.arg(&service.name)
			.arg(token)
			.arg(&self.artifact_dir)
			.stdin(Stdio::null())
			.kill_on_drop(true);

		tracing::debug!(service = %service.name, token, "building");

		let output = match tokio::time::timeout(self.build_timeout, cmd.output()).await {
			Ok(Ok(output)) => output,
			Ok(Err(source)) => {
				return Err(BuildError::Spawn {
					command: self.build_command.clone(),
					source,
				})
			}
			Err(_) => return Err(BuildError::Timeout(self.build_timeout)),
		};

		let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
		if !output.status.success() {
			return Err(BuildError::Failed {
				status: output.status,
				stdout,
				stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
			});
		}

		let binary = stdout.trim();
		if binary.is_empty() {
			return Err(BuildError::NoBinary);
		}

		tracing::info!(service = %service.name, binary, "built");
		Ok(BuildOutput {
			binary: PathBuf::from(binary),
		})
	}

	/// Spawn `binary` and wire its output into `output`.
	///
	/// Returns as soon as the process is started. Read failures on either
	/// stream are reported to `errors`; the scanner and exit-watcher tasks are
	/// detached and end on their own once the process dies.
	pub fn run(
		&self,
		service: &Service,
		build: &BuildOutput,
		output: OutputCapture,
		errors: ErrorSink,
	) -> Result<TrackedProcess> {
		let launch_err = |source| Error::Launch {
			service: service.name.clone(),
			binary: build.binary.clone(),
			source,
		};

		let mut child = Command::new(build.binary())
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0)
			.spawn()
			.map_err(launch_err)?;

		let pid = match child.id() {
			Some(pid) => pid,
			None => {
				return Err(launch_err(std::io::Error::new(
					std::io::ErrorKind::Other,
					"process exited before its pid was read",
				)))
			}
		};

		let stdout = child.stdout.take();
		let stderr = child.stderr.take();
		let (stdout, stderr) = match (stdout, stderr) {
			(Some(out), Some(err)) => (out, err),
			_ => {
				let _ = child.start_kill();
				return Err(launch_err(std::io::Error::new(
					std::io::ErrorKind::BrokenPipe,
					"child output pipes unavailable",
				)));
			}
		};

		tokio::spawn(scan_lines(
			stdout,
			Stream::Stdout,
			service.name.clone(),
			output.clone(),
			errors.clone(),
		));
		tokio::spawn(scan_lines(
			stderr,
			Stream::Stderr,
			service.name.clone(),
			output,
			errors,
		));

		let name = service.name.clone();
		tokio::spawn(async move {
			match child.wait().await {
				Ok(status) if status.success() => {
					tracing::info!(service = %name, pid, "exited cleanly");
				}
				Ok(status) => {
					tracing::warn!(service = %name, pid, %status, "exited");
				}
				Err(e) => {
					tracing::warn!(service = %name, pid, "wait failed: {}", e);
				}
			}
		});

		tracing::info!(service = %service.name, pid, "launched");
		Ok(TrackedProcess {
			pid,
			service: service.name.clone(),
		})
	}
}

async fn scan_lines<R: AsyncRead + Unpin>(
	reader: R,
	stream: Stream,
	service: String,
	output: OutputCapture,
	errors: ErrorSink,
) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(&buf);
				let line = line.trim_end_matches(['\n', '\r']);
				output.push(stream, line.to_string()).await;
			}
			Err(source) => {
				errors.report(Error::Stream {
					service,
					stream,
					source,
				});
				break;
			}
		}
	}
}

/// Fresh per-build token so successive binaries never collide on disk.
pub fn new_token() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::pin::Pin;
	use std::task::{Context, Poll};
	use tokio::io::{AsyncReadExt, ReadBuf};

	/// A pipe whose reads always fail.
	struct BrokenPipe;

	impl AsyncRead for BrokenPipe {
		fn poll_read(
			self: Pin<&mut Self>,
			_cx: &mut Context<'_>,
			_buf: &mut ReadBuf<'_>,
		) -> Poll<std::io::Result<()>> {
			Poll::Ready(Err(std::io::Error::new(
				std::io::ErrorKind::BrokenPipe,
				"pipe broke",
			)))
		}
	}

	#[tokio::test]
	async fn concurrent_tokens_are_distinct() {
		let handles: Vec<_> = (0..64).map(|_| tokio::spawn(async { new_token() })).collect();
		let mut tokens = HashSet::new();
		for handle in handles {
			tokens.insert(handle.await.unwrap());
		}
		assert_eq!(tokens.len(), 64);
	}

	#[tokio::test]
	async fn missing_build_command_is_a_build_error() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Launcher::new(
			dir.path().join("no-such-build"),
			dir.path().join("artifacts"),
			Duration::from_secs(5),
		);
		let err = launcher
			.build(&Service::new("one", "./svc/one"), "t0")
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			Error::Build {
				source: BuildError::Spawn { .. },
				..
			}
		));
	}

	#[tokio::test]
	async fn missing_binary_is_a_launch_error() {
		let dir = tempfile::tempdir().unwrap();
		let launcher = Launcher::new(
			dir.path().join("build.sh"),
			dir.path().to_path_buf(),
			Duration::from_secs(5),
		);
		let (errors, _rx) = ErrorSink::channel(4);
		let build = BuildOutput {
			binary: dir.path().join("missing-binary"),
		};
		let err = launcher
			.run(
				&Service::new("one", "./svc/one"),
				&build,
				OutputCapture::new("one", 10),
				errors,
			)
			.unwrap_err();
		assert_eq!(err.as_label(), "launch");
	}

	#[tokio::test]
	async fn read_failure_is_reported_as_stream_error() {
		let (errors, mut rx) = ErrorSink::channel(4);
		let output = OutputCapture::new("web", 10);
		let reader = (&b"booting\r\n"[..]).chain(BrokenPipe);

		scan_lines(reader, Stream::Stderr, "web".into(), output.clone(), errors).await;

		let lines = output.snapshot().await;
		assert_eq!(lines.len(), 1);
		assert_eq!(lines[0].text, "booting");
		match rx.try_recv().unwrap() {
			Error::Stream { service, stream, source } => {
				assert_eq!(service, "web");
				assert_eq!(stream, Stream::Stderr);
				assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
			}
			other => panic!("expected stream error, got {:?}", other),
		}
		assert!(rx.try_recv().is_err());
	}
}
