//! Tracing setup for the launcher.
//!
//! The console carries the launcher's own narrative: one `entering phase` event
//! per pipeline phase, delegate invocations tagged with `delegate`, and the
//! reaper summary. Delegate stdout and stderr never reach the console; they are
//! appended to `<run_dir>/delegate_logs/<delegate>.log`. At `debug` the
//! classifier's raw answer, each rewritten prompt, and every per-process reaping
//! failure are logged as well.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: launcher events at `info`, dependencies at `warn`.
pub const DEFAULT_FILTER: &str = "warn,scientist=info";

/// Initialize the tracing subscriber (stderr, compact format).
///
/// # Example
/// ```bash
/// RUST_LOG=scientist=debug scientist --load-ideas ideas/demo.json
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
