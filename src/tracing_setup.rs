//! Console tracing for the experiment engine
//!
//! Installs a `tracing_subscriber` fmt layer filtered by `RUST_LOG`
//! (default: `info`). Embedding applications that already own a global
//! subscriber can skip this entirely; calling it twice is harmless.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize console tracing
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_tracing() -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            "Experiment engine logging initialized"
        );
    }

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init_is_idempotent() {
        assert!(init_tracing().is_ok());
        assert!(!init_tracing().unwrap());
    }
}
