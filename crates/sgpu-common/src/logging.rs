use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SGPU_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// True when `directives` does not parse as a filter spec.
fn directive_invalid(directives: &str) -> bool {
    EnvFilter::try_new(directives).is_err()
}

/// A typo'd `SGPU_LOG` silently becomes the default filter; say so once
/// a subscriber is installed to carry the message.
fn warn_on_bad_filter() {
    if let Ok(value) = std::env::var("SGPU_LOG") {
        if directive_invalid(&value) {
            warn!("unparseable SGPU_LOG={value}; using the default info filter");
        }
    }
}

/// Initialize structured logging with environment filter.
/// Set SGPU_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .init();
    warn_on_bad_filter();
}

/// Like [`init_logging`] but safe to call more than once; later calls
/// (another test in the same process, usually) do nothing.
pub fn try_init_logging() {
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
    warn_on_bad_filter();
}
