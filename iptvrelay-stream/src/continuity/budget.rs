use std::time::Duration;

use iptvrelay_core::config::ContinuityConfig;
use tokio::time::Instant;

/// Outcome of recording one restart trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Reconnect after `delay`. `attempt` counts from 1 within the current window.
    Restart { attempt: u32, delay: Duration },
    Exhausted { restarts: u32 },
}

/// Bounded restart counter with time decay.
///
/// A trigger arriving more than `window` after the previous one starts a
/// fresh count, so occasional provider hiccups never add up to a failure.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    count: u32,
    last_trigger: Option<Instant>,
}

impl RestartBudget {
    #[must_use]
    pub const fn new(
        max_restarts: u32,
        window: Duration,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            max_restarts,
            window,
            backoff_initial,
            backoff_max,
            count: 0,
            last_trigger: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &ContinuityConfig) -> Self {
        Self::new(
            config.max_restarts,
            config.decay_window(),
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Restarts counted in the current window.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    pub fn record(&mut self, now: Instant) -> RestartDecision {
        if let Some(last) = self.last_trigger {
            if now.saturating_duration_since(last) > self.window {
                self.count = 0;
            }
        }
        self.last_trigger = Some(now);

        if self.count >= self.max_restarts {
            return RestartDecision::Exhausted {
                restarts: self.count,
            };
        }
        self.count += 1;
        RestartDecision::Restart {
            attempt: self.count,
            delay: self.backoff(self.count),
        }
    }

    /// `initial * 2^(attempt - 1)`, capped at the configured maximum.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_initial
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}
