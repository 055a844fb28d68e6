use tokio::signal::unix::{signal, SignalKind};

/// Resolves with the name of the first shutdown signal received.
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigquit = signal(SignalKind::quit())?;

	let name = tokio::select! {
		_ = sigint.recv() => "SIGINT",
		_ = sigterm.recv() => "SIGTERM",
		_ = sigquit.recv() => "SIGQUIT",
	};
	Ok(name)
}
