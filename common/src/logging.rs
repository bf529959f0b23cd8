//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the embedding application or test. These helpers wire the usual
//! `EnvFilter` + `fmt` stack so `RUST_LOG` overrides the built-in directive.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default directive when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "dictionary=info,mdbx_base=info";

/// Installs the global subscriber.
///
/// Returns `false` if a subscriber was already installed (the existing one is
/// kept).
pub fn init_tracing(default_directive: &str) -> bool {
    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .with(fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(default_directive, "tracing subscriber installed");
    }
    installed
}

/// Installs a subscriber that writes through the libtest capture.
///
/// Safe to call from every test; only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
