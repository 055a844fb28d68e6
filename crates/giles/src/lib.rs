//! # giles
//!
//! Rebuild-and-restart supervisor for local development.
//!
//! Watch source trees, and on every change stop the services you own, rebuild
//! each one with an external build command, relaunch the fresh binaries and
//! capture their output. Failures from background work arrive on a single
//! error channel; the supervisor itself never exits the process.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use giles::{FsWatcher, Service, Supervisor, SupervisorConfig, WatchMode};
//!
//! # #[tokio::main]
//! # async fn main() -> giles::Result<()> {
//! let services = vec![Service::new("api", "./services/api")];
//! let config = SupervisorConfig::new("./build.sh");
//! let sup = Supervisor::new(services, config, FsWatcher::new(WatchMode::Native)?)?;
//!
//! sup.watch_path("./services".as_ref()).await?;
//! let mut errors = sup.take_errors().expect("fresh supervisor");
//!
//! sup.start().await;
//! let watcher = std::sync::Arc::clone(&sup);
//! tokio::spawn(async move { watcher.watch().await });
//!
//! if let Some(err) = errors.recv().await {
//!     eprintln!("{}", err);
//! }
//! sup.close().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod launcher;
pub mod output;
pub mod process_set;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use config::SupervisorConfig;
pub use error::{BuildError, Error, ErrorSink, KillFailure, Result};
pub use launcher::Launcher;
pub use output::{OutputCapture, OutputLine, Stream};
pub use process_set::ProcessSet;
pub use supervisor::Supervisor;
pub use types::*;
pub use watcher::{
	ChangeEvent, ChangeSource, ChangeStreams, ChannelHandle, ChannelSource, FsWatcher, WatchMode,
};
