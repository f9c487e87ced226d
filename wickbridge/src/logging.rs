//! Log subscriber setup for embedders.
//!
//! The library only emits `tracing` events. Applications that have no
//! subscriber of their own can call [`init`] once at startup, or
//! [`init_with_file`] to also keep a daily-rotated log file.

use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, BridgeResult};

/// Filter used when `RUST_LOG` is unset and no other default is given.
pub const DEFAULT_FILTER: &str = "info,wickbridge=debug";

/// Install a formatting subscriber on stderr as the global default.
///
/// `RUST_LOG` takes precedence over `default_filter`. Fails with
/// [`BridgeError::Logging`] if a global subscriber is already installed.
pub fn init(default_filter: &str) -> BridgeResult<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter)?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| BridgeError::Logging(err.to_string()))
}

/// Like [`init`], additionally writing to `<directory>/<file_prefix>.<date>`.
///
/// File output goes through a background writer; keep the returned guard
/// alive for as long as logs should be flushed.
pub fn init_with_file(
    default_filter: &str,
    directory: impl AsRef<Path>,
    file_prefix: &str,
) -> BridgeResult<WorkerGuard> {
    let (writer, guard) = file_writer(directory.as_ref(), file_prefix);

    tracing_subscriber::registry()
        .with(env_filter(default_filter)?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|err| BridgeError::Logging(err.to_string()))?;

    Ok(guard)
}

fn env_filter(default_filter: &str) -> BridgeResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|err| BridgeError::Logging(format!("invalid filter: {}", err))),
    }
}

fn file_writer(directory: &Path, file_prefix: &str) -> (NonBlocking, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(directory, file_prefix);
    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_second_init_fails_without_panicking() {
        // Another test may already have installed a subscriber, so only the
        // second call is asserted.
        let _ = init(DEFAULT_FILTER);
        assert!(matches!(init(DEFAULT_FILTER), Err(BridgeError::Logging(_))));
    }

    #[test]
    fn test_invalid_default_filter_is_rejected() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                env_filter("wickbridge=notalevel"),
                Err(BridgeError::Logging(_))
            ));
        }
    }

    #[test]
    fn test_file_writer_creates_prefixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut writer, guard) = file_writer(dir.path(), "wickbridge.log");

        writer.write_all(b"engine initialized\n").unwrap();
        drop(guard);

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("wickbridge.log"));
    }
}
