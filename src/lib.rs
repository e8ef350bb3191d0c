//! # media-dl
//!
//! Concurrent media acquisition engine. Turns download requests into local files:
//! bounded parallelism, per-attempt timeouts with fixed-interval retry, single-file
//! and HLS manifest downloads (variant selection, sequential fragment fetch, remux
//! through ffmpeg), live speed/size/ETA estimation and fingerprint-based ad-segment
//! filtering.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_dl::{Config, DirectResolver, DownloadManager, TaskRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::new(Config::default(), Arc::new(DirectResolver)).await?;
//!
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     manager.submit(TaskRequest::new(
//!         "direct",
//!         "https://cdn.example.com/show/e01/index.m3u8",
//!         "/media/show/e01.mp4",
//!     ))?;
//!     manager.join().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Ad-segment filtering
pub mod adblock;
/// Configuration types
pub mod config;
/// Engine context and collaborator traits
pub mod context;
/// Error types
pub mod error;
/// Bounded error log
pub mod error_log;
/// Single-resource HTTP fetcher
pub mod fetcher;
/// Format downloaders (single file, HLS manifest)
pub mod formats;
/// Download manager
pub mod manager;
/// Speed, size and ETA estimation
pub mod progress;
/// Stream-copy remux
pub mod remux;
/// Fixed-interval retry
pub mod retry;
/// Bounded concurrency scheduler
pub mod scheduler;
/// Per-attempt scratch directories
pub mod scratch;
/// Task downloader state machine
pub mod task;
/// Core types and events
pub mod types;
/// File publishing helpers
pub mod utils;

// Re-export commonly used types
pub use adblock::{
    AdBlacklist, AdFilter, FfprobeProber, FragmentProber, JsonBlacklist, MemoryBlacklist,
    spawn_flush_task,
};
pub use config::Config;
pub use context::{DirectResolver, EngineContext, ErrorSink, Resolver, TracingErrorSink};
pub use error::{Error, Result};
pub use error_log::{ErrorEntry, ErrorLog};
pub use manager::DownloadManager;
pub use remux::{FfmpegRemuxer, NoOpRemuxer, Remuxer};
pub use scheduler::Scheduler;
pub use task::{TaskDownloader, TaskState, TaskStatus};
pub use types::{
    DownloadTask, Event, MediaFormat, Resource, ResourceKind, RunningTask, Severity,
    StatusSnapshot, TaskCallbacks, TaskId, TaskRequest,
};

/// Run until a termination signal arrives, then stop the manager.
///
/// - **Unix:** SIGTERM or SIGINT; falls back to whichever handler could be registered.
/// - **Windows/other:** Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Pending tasks are dropped and running ones cancelled; no destination file is
/// published after the signal.
///
/// # Example
///
/// ```no_run
/// use media_dl::{Config, DirectResolver, DownloadManager, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = DownloadManager::new(Config::default(), Arc::new(DirectResolver)).await?;
///     run_with_shutdown(manager).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: DownloadManager) {
    wait_for_signal().await;
    manager.stop().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        return;
    }
    tracing::info!("Received Ctrl+C signal");
}
