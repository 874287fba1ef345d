//! Test notifier: records every notification.

use std::sync::Mutex;

use async_trait::async_trait;
use guildhall_core::error::DomainError;
use guildhall_core::guild::{CharacterId, GuildId};
use guildhall_core::ports::Notifier;

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Guild the notification was sent in.
    pub guild: GuildId,
    /// Recipient.
    pub character: CharacterId,
    /// Event kind.
    pub event_kind: String,
    /// Payload.
    pub payload: serde_json::Value,
}

/// A notifier that records notifications, or fails every delivery when built
/// with [`RecordingNotifier::failing`].
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    fail: bool,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates a notifier that accepts every notification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a notifier whose deliveries all fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Notifications delivered so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        guild: GuildId,
        character: &CharacterId,
        event_kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DomainError> {
        if self.fail {
            return Err(DomainError::Collaborator("gateway closed".into()));
        }
        self.sent.lock().unwrap().push(Notification {
            guild,
            character: character.clone(),
            event_kind: event_kind.to_owned(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
