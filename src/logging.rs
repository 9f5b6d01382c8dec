//! Logging initialization. Plain `tracing-subscriber` in place of the
//! workspace-internal `utils::logging` wrapper the rest of this stack
//! reaches for: same `RUST_LOG`-driven filter, just without the
//! Sentry/OpenTelemetry plumbing that wrapper also pulls in.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber. Must run before the
/// first log line is emitted; call once from `main`. `RUST_LOG`
/// overrides the verbosity implied by repeated `-v` flags.
pub fn init(verbose_count: u8) -> Result<()> {
    let default_directive = match verbose_count {
        0 => "wal_broadcaster=info",
        1 => "wal_broadcaster=debug",
        _ => "wal_broadcaster=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .finish()
        .try_init()?;
    Ok(())
}
