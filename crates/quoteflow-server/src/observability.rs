//! Log output for the server binary.
//!
//! The filter sits behind a reload layer: the process starts at `info` and
//! switches to `logging.level` once `quoteflow.toml` is loaded. A `RUST_LOG`
//! directive overrides both.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

const BOOTSTRAP_LEVEL: &str = "info";

/// Dependencies that are chatty at `debug` and below.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "h2=warn"];

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

fn level_filter(level: &str) -> EnvFilter {
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level), EnvFilter::add_directive)
}

pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(BOOTSTRAP_LEVEL));

    let (filter_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switch to the configured level. No-op when `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = FILTER_HANDLE.get() {
        if let Err(e) = handle.reload(level_filter(level)) {
            tracing::warn!(level, error = %e, "Failed to apply logging level");
        }
    }
}
