//! Bounded retry accounting for pipeline phases.

use anyhow::Result;
use tracing::{info, warn};

/// Result of a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Whether any attempt reported success.
    pub succeeded: bool,
    /// Attempts actually made (1-indexed count).
    pub attempts: u32,
}

/// Run `attempt` until it reports success or `max_attempts` are used up.
///
/// `attempt` receives the 1-indexed attempt number. An `Err` counts as a failed
/// attempt and is logged; it never escapes the loop.
pub fn retry_bounded<F>(label: &str, max_attempts: u32, mut attempt: F) -> RetryOutcome
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut attempts = 0;
    for n in 1..=max_attempts {
        attempts = n;
        info!(phase = label, attempt = n, max_attempts, "attempt started");
        match attempt(n) {
            Ok(true) => {
                return RetryOutcome {
                    succeeded: true,
                    attempts,
                };
            }
            Ok(false) => {
                warn!(phase = label, attempt = n, "attempt did not succeed");
            }
            Err(err) => {
                warn!(phase = label, attempt = n, err = format!("{err:#}"), "attempt failed");
            }
        }
    }
    RetryOutcome {
        succeeded: false,
        attempts,
    }
}
