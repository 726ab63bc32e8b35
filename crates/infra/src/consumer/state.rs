use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle of a tenant consumer's bus connection.
///
/// `Disconnected -> Connecting -> Active -> Draining -> Disconnected`, plus
/// `Active <-> Reconnecting` while the bus (or a downstream store) misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Reconnecting,
    Draining,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Draining => "draining",
        }
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Active)
                | (Connecting, Disconnected)
                | (Active, Reconnecting)
                | (Active, Draining)
                | (Reconnecting, Active)
                | (Reconnecting, Draining)
                | (Reconnecting, Disconnected)
                | (Draining, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus when it was entered; observers can `subscribe`.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
    since: Mutex<Instant>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            since: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if allowed; returns the previous state on success.
    pub(crate) fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut previous = self.get();
        let moved = self.tx.send_if_modified(|state| {
            previous = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if moved {
            if let Ok(mut since) = self.since.lock() {
                *since = Instant::now();
            }
            Ok(previous)
        } else {
            Err(previous)
        }
    }

    /// How long the current state has been held.
    pub(crate) fn held_for(&self) -> Duration {
        self.since.lock().map(|s| s.elapsed()).unwrap_or_default()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_lifecycle() {
        let cell = StateCell::new();
        assert_eq!(cell.transition(ConnectionState::Connecting), Ok(ConnectionState::Disconnected));
        assert_eq!(cell.transition(ConnectionState::Active), Ok(ConnectionState::Connecting));
        assert_eq!(cell.transition(ConnectionState::Reconnecting), Ok(ConnectionState::Active));
        assert_eq!(cell.transition(ConnectionState::Active), Ok(ConnectionState::Reconnecting));
        assert_eq!(cell.transition(ConnectionState::Draining), Ok(ConnectionState::Active));
        assert_eq!(cell.transition(ConnectionState::Disconnected), Ok(ConnectionState::Draining));
    }

    #[test]
    fn rejects_skipping_states() {
        let cell = StateCell::new();
        assert_eq!(cell.transition(ConnectionState::Active), Err(ConnectionState::Disconnected));
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn observers_see_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(ConnectionState::Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }
}
