//! Bootstrap utilities for host processes.
//!
//! Shared initialization code for applications embedding pubsync.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the PUBSYNC_LOG environment variable.
///
/// Defaults to "debug" when `debug_mode` is set, "info" otherwise. Returns
/// `false` if a global subscriber was already installed.
pub fn init_tracing(debug_mode: bool) -> bool {
    let fallback = if debug_mode { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_repeatable() {
        init_tracing(true);
        assert!(!init_tracing(false));
    }
}
