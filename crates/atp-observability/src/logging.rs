//! Tracing subscriber bootstrap for the routing core.
//!
//! The context builder installs the process-wide subscriber once at
//! startup; `RUST_LOG` wins over the configured default filter. Installing
//! twice is a no-op, which keeps repeated builds in tests harmless.

use tracing_subscriber::{fmt, EnvFilter};

/// Output shape of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for interactive use.
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Install the process-wide tracing subscriber.
///
/// Returns whether this call actually installed it; `false` means a
/// subscriber was already in place and nothing changed.
pub fn init(service_name: &str, default_filter: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = match format {
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "tracing subscriber installed");
    }
    installed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
