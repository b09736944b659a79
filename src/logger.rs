//! Logging setup for summit-solver.
//!
//! All diagnostics go through `tracing`: the Levenberg-Marquardt driver
//! emits its per-iteration table at debug level under the
//! `summit_solver::optimizer` target, the derivative check warns on
//! suspicious Jacobians, and the error helpers log before propagation.
//! The helpers here install a compact stderr subscriber tuned for those
//! streams. Both are idempotent (later calls are no-ops), so tests and
//! short-lived tools can call them unconditionally.

use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber at info level.
///
/// `RUST_LOG` takes precedence over the default filter when set.
///
/// # Example
/// ```no_run
/// use summit_solver::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("optimization starting");
/// }
/// ```
pub fn init_logger() {
    init_with_filter("info");
}

/// Install a subscriber that also shows the optimizer's per-iteration
/// table: debug level for this crate, info elsewhere.
///
/// Equivalent to running with `RUST_LOG=info,summit_solver=debug`.
pub fn init_iteration_logger() {
    init_with_filter("info,summit_solver=debug");
}

fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // try_init so a second call (another test in the same process) is a
    // silent no-op instead of a panic
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
