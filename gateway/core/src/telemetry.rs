//! Tracing subscriber setup for processes embedding the gateway core.

use tracing_subscriber::EnvFilter;

use crate::error::{GatewayError, Result};

/// Install a formatted subscriber filtered by `RUST_LOG`.
///
/// `default_directive` (e.g. `"gateway_core=info"`) is added underneath
/// whatever `RUST_LOG` specifies. Fails with `Config` if a global subscriber
/// already exists or the directive does not parse.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let directive = default_directive.parse().map_err(|e| {
        GatewayError::Config(format!("invalid log directive {default_directive:?}: {e}"))
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_target(true)
        .try_init()
        .map_err(|e| GatewayError::Config(format!("tracing subscriber not installed: {e}")))
}
