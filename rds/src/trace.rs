//! Broker logging.
//!
//! Modules log through `crate::trace::{debug, info, ...}`. With the default
//! `tracing` feature these are the `tracing` macros; without it they expand
//! to nothing, so log arguments must not carry side effects the caller needs.

/// Installs a stderr subscriber filtered by `RUST_LOG` (`rds=info` when
/// unset).
///
/// Only the first call installs anything; later calls and builds without
/// the `tracing` feature return quietly.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rds=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// Stand-in that swallows its arguments.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
