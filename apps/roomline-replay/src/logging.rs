//! Tracing/logging bootstrap for the replay tool.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,roomline_replay=info,roomline_engine=info";

/// Install the global subscriber. Safe to call more than once.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `ROOMLINE_REPLAY_LOG`
/// 3) `ROOMLINE_LOG`
/// 4) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["ROOMLINE_REPLAY_LOG", "ROOMLINE_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
