//! Logging for the scheduler threads and the control path.
//!
//! Enable with `--features tracing`. Without the feature every log macro
//! expands to nothing, so neither the send path nor the arbiter round pays
//! for logging in production builds.

/// Filter used when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "txarb=trace";

/// Installs a subscriber with uptime timestamps and thread names.
///
/// Call this at the start of tests or a binary to see scheduler logs.
/// `RUST_LOG` overrides the default `txarb=trace` filter. Calling it again,
/// or after another subscriber was installed, is harmless. Does nothing if
/// the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    if tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("subscriber already installed");
    }
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

/// Swallows its arguments; stands in for every level when logging is off.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
