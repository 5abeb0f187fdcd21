use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Session lifecycle.
///
/// ```text
/// Starting -> Probing -> Live <-> Restarting
///     \          \         \          \
///      +----------+---------+----------+--> Ended | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Port bound, connector launching.
    Starting,
    /// Upstream answered; deciding the mode, bootstrap segment on air.
    Probing,
    Live,
    /// Reconnecting upstream and/or the transcoder after a trigger.
    Restarting,
    Ended,
    Error,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Live => "live",
            Self::Restarting => "restarting",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Ended, Error, Live, Probing, Restarting, Starting};
        match (self, next) {
            (Ended | Error, _) => false,
            (_, Ended | Error) => true,
            (Starting, Probing | Restarting)
            | (Probing, Live | Restarting)
            | (Live, Restarting)
            | (Restarting, Probing | Live) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable session state with enforced transitions.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Starting);
        Self { tx }
    }

    #[must_use]
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Returns the previous state, or `None` when the move is
    /// not allowed (which includes any move out of a terminal state).
    pub fn transition(&self, next: SessionState) -> Option<SessionState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(from) => debug!(from = %from, to = %next, "Session state changed"),
            None if self.get() != next => {
                warn!(from = %self.get(), to = %next, "Rejected session state change");
            }
            None => {}
        }
        previous
    }
}
