//! Tracing subscriber bootstrap for the viewer binary and embedding hosts.

use std::sync::Once;

use tracing::Level;

static INIT: Once = Once::new();

/// Install a fmt subscriber with the given maximum level.
///
/// Safe to call more than once; only the first call installs a subscriber,
/// and an already-installed global subscriber (e.g. from a host application)
/// is left untouched.
pub fn init(level: Level) {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .try_init();
    });
}

/// Parse a level name (`error`, `warn`, `info`, `debug`, `trace`), defaulting to `info`.
pub fn level_from_str(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
