//! Deduplicated error reporting through `tracing`.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::WalletError;

/// Identical reports inside this window are dropped.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Logs wallet errors once per `(action, message)` within a short window.
pub struct ErrorReporter {
    window: Duration,
    seen: DashMap<(String, String), Instant>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl ErrorReporter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    /// Returns whether the error was reported rather than suppressed.
    pub fn report(&self, action: &str, error: &WalletError) -> bool {
        if error.is_cancellation() {
            tracing::debug!(action, "User cancelled");
            return false;
        }

        let now = Instant::now();
        let key = (action.to_string(), error.message().to_string());
        let fresh = match self.seen.get(&key) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        if !fresh {
            return false;
        }
        self.seen.insert(key, now);
        self.seen
            .retain(|_, last| now.duration_since(*last) < self.window);

        if error.is_recoverable() {
            tracing::warn!(action, error = %error, user_visible = error.is_user_visible(), "Recoverable error");
        } else {
            tracing::error!(action, error = %error, user_visible = error.is_user_visible(), "Error");
        }
        true
    }
}
