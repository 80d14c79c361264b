//! Structured logging setup using tracing-subscriber.
//!
//! The orchestrator's signal lives in its tick loops (monitor polls, claim
//! cycles, limit evaluations); the default filter keeps those at the
//! configured level while muting the statement-by-statement chatter from the
//! database and HTTP stacks.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose per-call logging would drown the tick loops' own output.
const QUIET_DEPS: &[&str] = &["sqlx", "hyper", "reqwest"];

/// Initialize the global tracing subscriber. An explicit RUST_LOG always
/// wins over the config file.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let layer = fmt::layer().with_target(true).with_thread_ids(false);
    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json_output {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer.compact()).init();
    }
}

fn default_directives(level: &str) -> String {
    QUIET_DEPS.iter().fold(level.to_string(), |directives, dep| {
        format!("{directives},{dep}=warn")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_quiet_dependency_chatter() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("debug"));
        assert!(directives.contains("sqlx=warn"));
        assert!(directives.contains("hyper=warn"));
        assert!(directives.contains("reqwest=warn"));
    }
}
