//! Process logging bootstrap.
//!
//! Thin wrapper over `tracing-subscriber`: the library itself only emits
//! `tracing` events, installing a subscriber is the binary's call.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` wins over the configured level when set. Safe to call more
/// than once; later calls are no-ops, which keeps test setups simple.
pub fn init(config: &LoggingConfig) {
    let level: tracing::Level = config.level.into();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if config.json_format {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(config.include_targets);
        if config.include_timestamps {
            let _ = builder.try_init();
        } else {
            let _ = builder.without_time().try_init();
        }
    } else {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.colored)
            .with_target(config.include_targets);
        if config.include_timestamps {
            let _ = builder.try_init();
        } else {
            let _ = builder.without_time().try_init();
        }
    }
}
