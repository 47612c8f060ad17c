//! Log subscriber setup for binaries and tests embedding the controller.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Records emitted through the `log` facade are bridged into `tracing`.
/// Only the first call installs anything; later calls return whether that
/// first installation succeeded.
pub fn init_logging(format: LogFormat) -> bool {
    *INSTALLED.get_or_init(|| install(format))
}

/// Filter from `RUST_LOG`, or `info` when unset or unparsable.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn install(format: LogFormat) -> bool {
    let filter = env_filter();

    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(fmt::layer().with_target(true).compact()), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_current_span(true))),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json);
    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log facade already bridged: {}", e);
    }

    if installed {
        tracing::debug!(?format, "Logging initialized");
    }
    installed
}
