//! Logging setup for binaries and tests that embed the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install a fmt subscriber filtered by `RUST_LOG`. Returns `false` when a
/// global subscriber was already installed, which makes repeated calls
/// harmless.
pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_FILTER)
}

/// Like `init_tracing`, with a custom fallback filter such as
/// `"tierflow=debug"`.
pub fn init_tracing_with(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_tracing();
        assert!(!init_tracing_with("tierflow=debug"));
    }
}
