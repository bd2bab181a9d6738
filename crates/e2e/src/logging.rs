//! Subscriber setup for the runner binary

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/// `--debug` wins over `RUST_LOG`, which wins over the `info` default
pub fn filter_directive(debug: bool, rust_log: Option<&str>) -> String {
    if debug {
        return "debug".to_string();
    }
    match rust_log.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => DEFAULT_DIRECTIVE.to_string(),
    }
}

/// Install the global fmt subscriber
pub fn init(debug: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(debug, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
