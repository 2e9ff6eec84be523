//! Structured logging setup.
//!
//! Plain `tracing-subscriber` registry: this kernel is a single process with
//! no collector to ship spans to, so only the `EnvFilter` + `fmt` layer
//! pairing is kept (no OTLP exporter).

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence if set; otherwise `default_level` is used
/// (e.g. `"info"` or `"info,djr3x_kernel=debug"`).
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
