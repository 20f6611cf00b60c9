//! speakd: a persistent local text-to-speech daemon.
//!
//! Listens on a per-user Unix socket, keeps the synthesis engine warm,
//! caches synthesized audio at clause and word granularity, and plays
//! queued items gaplessly through a single audio sink.

mod audio;
mod cache;
mod config;
mod error;
mod protocol;
mod queue;
mod server;
mod state;
mod subscribers;
mod synth;
mod text;
mod writer;

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::Daemon;

/// Stderr plus a daily-rolling file under the per-user log directory.
/// The returned guard must stay alive for the file writer to flush.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_appender = tracing_appender::rolling::daily(config::paths::log_dir(), "speakd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();
    let config = Config::load();
    info!(
        socket = %config.socket_path.display(),
        cache = %config.cache_dir.display(),
        engine = %config.engine_url,
        "speakd starting"
    );

    let daemon = Daemon::new(config);

    let mut sigterm = signal(SignalKind::terminate())?;
    {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("Shutdown signal received");
            daemon.shutdown();
        });
    }

    daemon.run().await
}
