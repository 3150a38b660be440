use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing: stdout, compact, `RUST_LOG`-driven.
///
/// This is a headless polling service, not a desktop app, so unlike the
/// ambient-context machinery this crate is descended from there is no
/// crash-hook-to-file layer here — panics during a cron cycle are caught at
/// the lock-release boundary (§7) rather than recovered from a crash log.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ingestor_core=debug"));

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();

    tracing::debug!("Tracing initialized");
}
