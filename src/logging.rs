//! Tracing setup for binaries and integration tests embedding this
//! crate. The library itself never installs a subscriber — only
//! whatever process hosts it should decide that.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
