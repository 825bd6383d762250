// =============================================================================
// Push notifications - provider contract and payload
// =============================================================================
//
// Two transports sit behind one trait: the APNs transport for production and
// a log-only sink for development. The evaluators only ever see the trait
// object, so tests substitute a recording fake.
// =============================================================================

pub mod apns;
pub mod dev;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use apns::{ApnsProvider, PushError};
pub use dev::DevProvider;

/// What kind of event produced this notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Alert,
    Automation,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alert => write!(f, "alert"),
            Self::Automation => write!(f, "automation"),
        }
    }
}

/// One notification to one user about one server.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub user_uuid: String,
    pub server_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Transport-agnostic push sender.
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Deliver `payload` to `device_token`. Implementations bound their own
    /// retries; an `Err` is terminal for this token and cycle.
    async fn send(&self, device_token: &str, payload: &PushPayload) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// First 16 characters of a device token, safe to log.
pub(crate) fn token_prefix(token: &str) -> String {
    token.chars().take(16).collect()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every send; evaluator tests assert on the captured payloads.
    #[derive(Default)]
    pub struct RecordingPush {
        pub sent: Mutex<Vec<(String, PushPayload)>>,
        pub fail_all: bool,
    }

    impl RecordingPush {
        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl PushProvider for RecordingPush {
        async fn send(&self, device_token: &str, payload: &PushPayload) -> anyhow::Result<()> {
            self.sent
                .lock()
                .push((device_token.to_string(), payload.clone()));
            if self.fail_all {
                anyhow::bail!("simulated push failure");
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }
}
