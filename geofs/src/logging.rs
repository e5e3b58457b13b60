//! Engine logging.
//!
//! Structured `tracing` output to a file under the volume's `logs/`
//! directory, filtered by `RUST_LOG`. Initialization is idempotent so
//! embedding applications and tests that install their own subscriber
//! keep working.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::errors::GeofsResult;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging into `logs_dir/geofs.log`. A no-op if a
/// subscriber is already installed.
pub fn init_for(logs_dir: &Path) -> GeofsResult<()> {
    std::fs::create_dir_all(logs_dir)?;

    let appender = tracing_appender::rolling::never(logs_dir, "geofs.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .is_ok()
    {
        // keep the worker alive for the process lifetime
        let _ = LOG_GUARD.set(guard);
    }

    Ok(())
}
