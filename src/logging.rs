//! Tracing setup: an `EnvFilter`-gated `fmt` layer over either stdout or a
//! rolling, non-blocking file sink.
//!
//! Simplified descendant of the JSON-span-capturing logger used elsewhere
//! in this example pack (`tracing_appender::non_blocking` +
//! `RollingFileAppender` + `EnvFilter`); this reactor doesn't need span
//! field capture, just a level-filtered writer that never blocks the
//! reactor thread on log I/O.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs the global subscriber. The returned guard must be held for
/// the lifetime of the process -- dropping it flushes and tears down the
/// background writer thread.
pub fn init(config: &Config) -> WorkerGuard {
    let filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "reactor-httpd.log");
            tracing_appender::non_blocking::NonBlockingBuilder::default()
                .buffered_lines_limit(config.log_queue_size)
                .finish(appender)
        }
        None => tracing_appender::non_blocking::NonBlockingBuilder::default()
            .buffered_lines_limit(config.log_queue_size)
            .finish(std::io::stdout()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();

    guard
}
