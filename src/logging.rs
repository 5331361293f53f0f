//! Logging setup: a `tracing_subscriber::fmt` subscriber configured from the
//! numeric `DEBUG` env var (0-5), since that's the verbosity knob callers of
//! this library expect rather than a level name.
use std::env;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Maps `DEBUG` (unset or non-numeric = 0) onto a tracing level:
/// 0 = errors only, 1 = + warnings, 2 = + info, 3 = + debug, 4-5 = trace.
fn level_for_debug(debug: u8) -> Level {
    match debug {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initializes the global `tracing` subscriber from the `DEBUG` env var.
///
/// Intended for binaries (demos, tests) embedding this crate; library code
/// never calls this itself, it only emits `tracing` events.
pub fn init_from_debug_env() {
    let debug = env::var("DEBUG")
        .ok()
        .and_then(|s| s.parse::<u8>().ok())
        .unwrap_or(0);
    let level = level_for_debug(debug);
    let filter = EnvFilter::new(level.to_string());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_zero_maps_to_error_only() {
        assert_eq!(level_for_debug(0), Level::ERROR);
    }

    #[test]
    fn debug_five_maps_to_trace() {
        assert_eq!(level_for_debug(5), Level::TRACE);
    }

    #[test]
    fn debug_above_five_still_maps_to_trace() {
        assert_eq!(level_for_debug(255), Level::TRACE);
    }
}
