//! Logging setup for canopy binaries.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] read from
//! `RUST_LOG` and a fmt layer on stderr, so stdout stays free for program
//! output.
//!
//! ```bash
//! RUST_LOG=canopy_kernel=debug canopy replay script.jsonl
//! ```

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber with the default directive.
///
/// Fails if a global subscriber is already set.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    init_with(DEFAULT_DIRECTIVE)
}

/// Install the global subscriber, falling back to `default_directive`.
pub fn init_with(default_directive: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    tracing::debug!(default_directive, "logging initialised");
    Ok(())
}
